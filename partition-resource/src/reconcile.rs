use serde::Serialize;
use tracing::{debug, info};

use crate::{
    device::{DeviceOperation, PartitionDevice, RemovableDevice},
    error::Error,
    state::{CanonicalState, PartitionChanges, ValidationError},
};

/// The outcome of a reconciliation.
///
/// Serializes to `{"changed": bool, ...}` with one entry per created or
/// updated field, keyed by its user-facing name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    pub changed: bool,
    #[serde(flatten)]
    pub changes: PartitionChanges,
}

impl ChangeReport {
    pub fn unchanged() -> Self {
        Self::default()
    }

    fn changed(changes: PartitionChanges) -> Self {
        ChangeReport {
            changed: true,
            changes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Report what would change without issuing create, update or remove.
    pub check_mode: bool,
}

/// Drives a device towards a desired partition state.
///
/// Device calls are issued one at a time and never retried. The device is
/// borrowed for the lifetime of the reconciler and is not closed by it.
pub struct Reconciler<'a, D: ?Sized> {
    device: &'a D,
    options: ReconcileOptions,
}

impl<'a, D: PartitionDevice + ?Sized> Reconciler<'a, D> {
    pub fn new(device: &'a D) -> Self {
        Self::with_options(device, ReconcileOptions::default())
    }

    pub fn with_options(device: &'a D, options: ReconcileOptions) -> Self {
        Reconciler { device, options }
    }

    /// Create the partition if it is missing, otherwise update whichever of
    /// its specified fields differ.
    #[tracing::instrument(
        name = "reconcile",
        skip_all,
        fields(partition = desired.name(), check_mode = self.options.check_mode)
    )]
    pub async fn reconcile(&self, desired: &CanonicalState) -> Result<ChangeReport, Error> {
        let name = desired.name();
        let exists = self
            .device
            .exists(name)
            .await
            .map_err(Error::device(DeviceOperation::Exists, name))?;
        if exists {
            self.update(desired).await
        } else {
            self.create(desired).await
        }
    }

    async fn create(&self, desired: &CanonicalState) -> Result<ChangeReport, Error> {
        let name = desired.name();
        let report = ChangeReport::changed(desired.specified());
        if self.options.check_mode {
            info!("partition would be created");
            return Ok(report);
        }

        let applied = self
            .device
            .create(&desired.to_create_payload())
            .await
            .map_err(Error::device(DeviceOperation::Create, name))?;
        if !applied {
            return Err(Error::NotApplied {
                operation: DeviceOperation::Create,
                name: name.to_string(),
            });
        }
        info!("created partition");
        Ok(report)
    }

    async fn update(&self, desired: &CanonicalState) -> Result<ChangeReport, Error> {
        let name = desired.name();
        let raw = self
            .device
            .read(name)
            .await
            .map_err(Error::device(DeviceOperation::Read, name))?;
        let current = CanonicalState::from_device_response(&raw).map_err(|e| {
            Error::device(DeviceOperation::Read, name)(
                anyhow::Error::new(e).context("unexpected partition state in device response"),
            )
        })?;

        let changes = desired.diff(&current);
        if changes.is_empty() {
            info!("partition is up to date");
            return Ok(ChangeReport::unchanged());
        }
        debug!(?changes, "partition differs from desired state");
        if self.options.check_mode {
            info!("partition would be updated");
            return Ok(ChangeReport::changed(changes));
        }

        let applied = self
            .device
            .update(name, &changes.to_device_fields())
            .await
            .map_err(Error::device(DeviceOperation::Update, name))?;
        if !applied {
            return Err(Error::NotApplied {
                operation: DeviceOperation::Update,
                name: name.to_string(),
            });
        }
        info!("updated partition");
        Ok(ChangeReport::changed(changes))
    }
}

impl<D: RemovableDevice + ?Sized> Reconciler<'_, D> {
    /// Make sure no partition named `name` exists.
    ///
    /// After a removal the device is asked again; a partition that survived
    /// the call is an error.
    #[tracing::instrument(
        name = "remove",
        skip_all,
        fields(partition = name, check_mode = self.options.check_mode)
    )]
    pub async fn remove(&self, name: &str) -> Result<ChangeReport, Error> {
        if name.is_empty() {
            return Err(ValidationError::EmptyParameter("name").into());
        }
        let exists = self
            .device
            .exists(name)
            .await
            .map_err(Error::device(DeviceOperation::Exists, name))?;
        if !exists {
            info!("partition is already absent");
            return Ok(ChangeReport::unchanged());
        }
        if self.options.check_mode {
            info!("partition would be removed");
            return Ok(ChangeReport::changed(PartitionChanges::default()));
        }

        let applied = self
            .device
            .remove(name)
            .await
            .map_err(Error::device(DeviceOperation::Remove, name))?;
        if !applied {
            return Err(Error::NotApplied {
                operation: DeviceOperation::Remove,
                name: name.to_string(),
            });
        }
        let still_exists = self
            .device
            .exists(name)
            .await
            .map_err(Error::device(DeviceOperation::Exists, name))?;
        if still_exists {
            return Err(Error::RemoveFailed {
                name: name.to_string(),
            });
        }
        info!("removed partition");
        Ok(ChangeReport::changed(PartitionChanges::default()))
    }
}
