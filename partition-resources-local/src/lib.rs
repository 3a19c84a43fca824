//! A partition device whose partitions live in a local state file.
//!
//! The records it stores and returns use the device vocabulary, the same
//! shape an appliance's management API would produce, so reconciliation
//! against it goes through the same normalization as against real hardware.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use partition_resource::device::{
    CreatePayload, DeviceFields, PartitionDevice, RawDeviceState, RemovableDevice,
};
use serde_json::{json, Map, Value};

pub mod state;
use state::{Change, Snapshot, StateHandle};

const PARTITION_KIND: &str = "tm:auth:partition:partitionstate";

pub struct LocalDevice {
    path: PathBuf,
}

impl LocalDevice {
    /// Use the state file at `path`, initializing it if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<LocalDevice> {
        let path = path.as_ref().to_path_buf();
        match StateHandle::open(&path, true) {
            Ok(_) => tracing::info!(path = %path.display(), "initialized partition state file"),
            Err(e) if is_already_exists(&e) => {
                // Validate what is there before accepting it.
                StateHandle::open(&path, false)?.read().with_context(|| {
                    format!("Could not read partition state file {}", path.display())
                })?;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Could not create partition state file {}", path.display())
                })
            }
        }
        Ok(LocalDevice { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<StateHandle> {
        StateHandle::open(&self.path, false).with_context(|| {
            format!("Could not open partition state file {}", self.path.display())
        })
    }

    fn snapshot(&self) -> Result<Snapshot> {
        self.handle()?.read().with_context(|| {
            format!("Could not read partition state file {}", self.path.display())
        })
    }

    /// Apply `f` to the current snapshot under the write lock.
    fn modify(
        &self,
        f: impl FnOnce(&Snapshot) -> Result<(bool, Option<Change>)>,
    ) -> Result<bool> {
        self.handle()?.update(f).with_context(|| {
            format!(
                "Could not update partition state file {}",
                self.path.display()
            )
        })
    }
}

fn is_already_exists(e: &anyhow::Error) -> bool {
    e.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::AlreadyExists)
}

fn find_partition<'a>(snapshot: &'a Snapshot, name: &str) -> Option<&'a Map<String, Value>> {
    snapshot
        .state
        .get("partitions")
        .and_then(|partitions| partitions.get(name))
        .and_then(Value::as_object)
}

/// JSON pointer to a partition record, escaped per RFC 6901.
fn partition_pointer(name: &str) -> String {
    format!("/partitions/{}", name.replace('~', "~0").replace('/', "~1"))
}

fn change(operation: &str, name: &str, ops: Value) -> Result<Change> {
    Ok(Change {
        meta: json!({
            "operation": operation,
            "partition": name,
        }),
        patch: serde_json::from_value(ops)?,
    })
}

fn fields_object(fields: &DeviceFields) -> Result<Map<String, Value>> {
    match serde_json::to_value(fields)? {
        Value::Object(o) => Ok(o),
        _ => anyhow::bail!("Expected object for partition fields"),
    }
}

#[async_trait]
impl PartitionDevice for LocalDevice {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(find_partition(&self.snapshot()?, name).is_some())
    }

    async fn read(&self, name: &str) -> Result<RawDeviceState> {
        find_partition(&self.snapshot()?, name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("partition {} not found", name))
    }

    async fn create(&self, payload: &CreatePayload) -> Result<bool> {
        let name = payload.name.as_str();
        let mut record = Map::new();
        record.insert("kind".to_string(), json!(PARTITION_KIND));
        record.insert("name".to_string(), json!(name));
        record.insert("fullPath".to_string(), json!(name));
        record.extend(fields_object(&payload.fields)?);

        self.modify(|snapshot| {
            if find_partition(snapshot, name).is_some() {
                tracing::warn!(partition = name, "create requested for existing partition");
                return Ok((false, None));
            }
            let ops = json!([{
                "op": "add",
                "path": partition_pointer(name),
                "value": record,
            }]);
            Ok((true, Some(change("create", name, ops)?)))
        })
    }

    async fn update(&self, name: &str, fields: &DeviceFields) -> Result<bool> {
        let nothing_to_set = fields.is_empty();
        let fields = fields_object(fields)?;
        self.modify(|snapshot| {
            if find_partition(snapshot, name).is_none() {
                tracing::warn!(partition = name, "update requested for missing partition");
                return Ok((false, None));
            }
            if nothing_to_set {
                return Ok((true, None));
            }
            let base = partition_pointer(name);
            let ops: Vec<Value> = fields
                .into_iter()
                .map(|(key, value)| {
                    // "add" replaces an existing member of an object.
                    json!({
                        "op": "add",
                        "path": format!("{}/{}", base, key),
                        "value": value,
                    })
                })
                .collect();
            Ok((true, Some(change("update", name, Value::Array(ops))?)))
        })
    }
}

#[async_trait]
impl RemovableDevice for LocalDevice {
    async fn remove(&self, name: &str) -> Result<bool> {
        self.modify(|snapshot| {
            if find_partition(snapshot, name).is_none() {
                return Ok((false, None));
            }
            let ops = json!([{
                "op": "remove",
                "path": partition_pointer(name),
            }]);
            Ok((true, Some(change("remove", name, ops)?)))
        })
    }
}
