use crate::{device::DeviceOperation, state::ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The parameters could not be normalized. No device call was made.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A device call failed. Calls that already succeeded are not rolled back.
    #[error("{operation} of partition {name} failed: {source}")]
    Device {
        operation: DeviceOperation,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A mutating device call returned without error but reported that
    /// nothing was applied.
    #[error("device did not apply {operation} of partition {name}")]
    NotApplied {
        operation: DeviceOperation,
        name: String,
    },

    #[error("failed to delete partition {name}: it still exists on the device")]
    RemoveFailed { name: String },
}

impl Error {
    pub(crate) fn device(
        operation: DeviceOperation,
        name: &str,
    ) -> impl FnOnce(anyhow::Error) -> Error + '_ {
        move |source| Error::Device {
            operation,
            name: name.to_string(),
            source,
        }
    }
}
