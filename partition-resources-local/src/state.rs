//! The local device keeps its partitions in a state file: a stream of JSON
//! events, each carrying an RFC 6902 patch. Replaying the patches in order
//! yields the current document:
//!
//! ```json
//! { "_type": "partitionState", "partitions": { "foo": { "name": "foo", ... } } }
//! ```
//!
//! Writers hold an exclusive lock on the file while they read the document,
//! decide and append, so a decision is never based on a stale document.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{de::IoRead, json, Deserializer, StreamDeserializer, Value};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, Write},
    path::Path,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

const STATE_TYPE: &str = "partitionState";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: Value,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// Save the validated first event for processing by our caller
    /// (basically prepend it to the iterator)
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let deserializer = Deserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    bail!("Expected initial state event with index 0, got {}", index);
                }
                ev
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<'a, R: io::Read> Iterator for StateEventStream<'a, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

pub fn apply_state_event(state: &mut Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

/// The document obtained by replaying a state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: Value,
    /// Index for the next event appended to the file.
    pub next_index: u64,
}

/// Replay `events`, checking that indices are consecutive and that the result
/// is a partition state document.
pub fn replay(events: impl Iterator<Item = Result<StateEvent>>) -> Result<Snapshot> {
    let mut state = json!({});
    let mut next_index = 0;
    for event in events {
        let event = event?;
        if event.index != next_index {
            bail!(
                "State file invalid: expected event index {}, got {}",
                next_index,
                event.index
            );
        }
        apply_state_event(&mut state, &event)
            .with_context(|| format!("Could not apply state event {}", event.index))?;
        next_index += 1;
    }
    match state.get("_type").and_then(Value::as_str) {
        Some(STATE_TYPE) => {}
        other => bail!(
            "unexpected _type in partition state: expected '{}', got {:?}",
            STATE_TYPE,
            other
        ),
    }
    Ok(Snapshot { state, next_index })
}

/// A change to append to the state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Extra metadata recorded next to the event time.
    pub meta: Value,
    pub patch: json_patch::Patch,
}

/// Monitor a task which may take a long time, and log messages as needed.
/// After SILENT_INTERVAL: log activity
/// After LOG_INTERVAL: log activity and duration
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(|| {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = std::time::Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(next_log.saturating_duration_since(std::time::Instant::now()));
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            tracing::info!(
                waited_s = next_log.duration_since(start).as_secs(),
                "{}",
                activity
            );
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

pub struct StateHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
}
impl StateHandle {
    /// Open a state file. With `create_new`, the file must not exist yet and
    /// is initialized with an empty partition state.
    pub fn open<P: AsRef<Path>>(name: P, create_new: bool) -> Result<StateHandle> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(name)?;
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        let mut handle = StateHandle { file, locking };
        if create_new {
            let lock_guard = Self::lock_write(&mut handle.locking)?;
            Self::append(handle.file.clone(), &Self::init_event()?)?;
            drop(lock_guard);
        }
        Ok(handle)
    }

    fn init_event() -> Result<StateEvent> {
        Ok(StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: json!({}),
            },
            patch: serde_json::from_value(json!([{
                "op": "add",
                "path": "",
                "value": {
                    "_type": STATE_TYPE,
                    "partitions": {},
                },
            }]))?,
        })
    }

    fn lock_write(
        locking: &mut fd_lock::RwLock<Arc<File>>,
    ) -> Result<fd_lock::RwLockWriteGuard<'_, Arc<File>>> {
        let lock_wait_mon = WaitMonitor::new("Waiting for state file write lock".to_owned());
        let lock = locking.write()?;
        lock_wait_mon.done();
        Ok(lock)
    }

    /// Read the whole file from the start. The caller holds a lock.
    fn load(file: &mut Arc<File>) -> Result<Snapshot> {
        file.seek(io::SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            bail!("State file invalid: no initial state event");
        }
        replay(StateEventStream::open_from_reader(contents.as_bytes())?)
    }

    /// The current document, read under a shared lock.
    pub fn read(&self) -> Result<Snapshot> {
        let _guard = self.locking.read()?;
        let mut file = self.file.clone();
        Self::load(&mut file)
    }

    /// Read the current document and append the change `f` derives from it,
    /// if any, all under the exclusive lock.
    pub fn update<T>(
        &mut self,
        f: impl FnOnce(&Snapshot) -> Result<(T, Option<Change>)>,
    ) -> Result<T> {
        let lock_guard = Self::lock_write(&mut self.locking)?;
        let mut file = self.file.clone();
        let snapshot = Self::load(&mut file)?;
        let (result, change) = f(&snapshot)?;

        if let Some(change) = change {
            let event = StateEvent {
                index: snapshot.next_index,
                meta: StateEventMeta {
                    time: Utc::now().to_rfc3339(),
                    other_fields: change.meta,
                },
                patch: change.patch,
            };
            Self::append(file, &event)?;
        }

        drop(lock_guard);
        Ok(result)
    }

    /// Write one event at the end of the file. The caller holds the write lock.
    fn append(file: Arc<File>, event: &StateEvent) -> Result<()> {
        let mut writer = io::BufWriter::new(file);
        // We prettify to make it more human readable. Potentially slightly
        // harder to parse by other tools, but worth the tradeoff.
        serde_json::to_writer_pretty(&mut writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        tracing::debug!(index = event.index, "appended state event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2019-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "_type": "partitionState", "partitions": {} },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2019-03-04T07:41:00Z", "operation": "create", "partition": "foo"},
        "patch": [
            {
                "op": "add",
                "value": {
                    "kind": "tm:auth:partition:partitionstate",
                    "name": "foo",
                    "fullPath": "foo",
                    "defaultRouteDomain": 0
                },
                "path": "/partitions/foo"
            }
        ]
    }
"#;

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(
            events[0].as_ref().unwrap().meta.time,
            "2019-03-04T07:40:00Z"
        );
        assert_eq!(
            events[1].as_ref().unwrap().meta.other_fields,
            json!({"operation": "create", "partition": "foo"})
        );
    }

    #[test]
    fn test_replay() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let snapshot = replay(stream).unwrap();
        assert_eq!(snapshot.next_index, 2);
        assert_eq!(
            snapshot.state,
            json!({
                "_type": "partitionState",
                "partitions": {
                    "foo": {
                        "kind": "tm:auth:partition:partitionstate",
                        "name": "foo",
                        "fullPath": "foo",
                        "defaultRouteDomain": 0
                    }
                }
            })
        );
    }

    #[test]
    fn test_replay_rejects_gap() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[{"op":"add","path":"","value":{"_type":"partitionState","partitions":{}}}]}
{"index":2,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        assert!(replay(stream).is_err());
    }

    #[test]
    fn test_replay_rejects_foreign_type() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[{"op":"add","path":"","value":{"_type":"nixopsState","resources":{}}}]}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        assert!(replay(stream).is_err());
    }

    #[test]
    fn test_open_state_stream_invalid_index() {
        let input = r#"{"index":1,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes());
        assert!(stream.is_err());
    }

    #[test]
    fn test_open_state_stream_invalid_json() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes());
        assert!(stream.is_err());
    }

    #[test]
    fn test_open_state_stream_empty() {
        let stream = StateEventStream::open_from_reader("".as_bytes());
        assert!(stream.is_err());
    }

    #[test]
    fn test_open_state_stream_no_patch() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"}}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes());
        assert!(stream.is_err());
    }

    #[test]
    fn test_invalid_second_event() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}
{"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let vec: Vec<Result<StateEvent>> = stream.collect();
        assert!(vec[1].is_err());
    }

    #[test]
    fn test_state_file_create_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut handle = StateHandle::open(&path, true).unwrap();
        assert_eq!(
            handle.read().unwrap(),
            Snapshot {
                state: json!({"_type": "partitionState", "partitions": {}}),
                next_index: 1,
            }
        );

        let seen_index = handle
            .update(|snapshot| {
                let patch = serde_json::from_value(json!([
                    {"op": "add", "path": "/partitions/a", "value": {"name": "a"}}
                ]))?;
                Ok((
                    snapshot.next_index,
                    Some(Change {
                        meta: json!({"operation": "create"}),
                        patch,
                    }),
                ))
            })
            .unwrap();
        assert_eq!(seen_index, 1);

        // A second handle sees the appended event.
        let other = StateHandle::open(&path, false).unwrap();
        let snapshot = other.read().unwrap();
        assert_eq!(snapshot.next_index, 2);
        assert_eq!(snapshot.state["partitions"]["a"], json!({"name": "a"}));
    }

    #[test]
    fn test_update_without_change_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut handle = StateHandle::open(&path, true).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        handle.update(|_| Ok(((), None))).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_empty_state_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "").unwrap();
        let mut handle = StateHandle::open(&path, false).unwrap();
        let err = handle.read().unwrap_err();
        assert!(err.to_string().contains("no initial state event"));

        // Writers refuse it too, so the file is never given a partial history.
        assert!(handle
            .update(|_| -> Result<((), Option<Change>)> { panic!("must not be reached") })
            .is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_create_new_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        StateHandle::open(&path, true).unwrap();
        assert!(StateHandle::open(&path, true).is_err());
    }
}
