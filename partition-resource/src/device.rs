use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A partition as returned by the device, in the device's vocabulary.
pub type RawDeviceState = Map<String, Value>;

/// Settable partition attributes in the device's vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_route_domain: Option<u32>,
}

impl DeviceFields {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.default_route_domain.is_none()
    }
}

/// The body of a create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayload {
    pub name: String,
    #[serde(flatten)]
    pub fields: DeviceFields,
}

/// The operations a reconciliation issues against a device.
///
/// Every call may fail. The boolean results of `create` and `update` report
/// whether the device applied the change.
#[async_trait]
pub trait PartitionDevice: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn read(&self, name: &str) -> Result<RawDeviceState>;

    async fn create(&self, payload: &CreatePayload) -> Result<bool>;

    /// Apply `fields` to an existing partition. Fields absent from `fields`
    /// are left untouched on the device.
    async fn update(&self, name: &str, fields: &DeviceFields) -> Result<bool>;
}

/// A device that can also delete partitions.
#[async_trait]
pub trait RemovableDevice: PartitionDevice {
    async fn remove(&self, name: &str) -> Result<bool>;
}

/// Names a device call, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    Exists,
    Read,
    Create,
    Update,
    Remove,
}

impl fmt::Display for DeviceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceOperation::Exists => "existence check",
            DeviceOperation::Read => "read",
            DeviceOperation::Create => "create",
            DeviceOperation::Update => "update",
            DeviceOperation::Remove => "remove",
        })
    }
}
