//! The state file: an append-only log of JSON patches which, replayed in
//! order, produce the current [`State`] snapshot.
//!
//! The first event (index 0) adds the initial snapshot at the document root.
//! Every later event carries the RFC 6902 difference to the previous
//! snapshot, so the file doubles as an audit log of every change grove made.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use grove_core::states::State;
use serde_json::{de::IoRead, Deserializer, StreamDeserializer};
use std::{
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use tracing::{debug, warn};

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
    pub other_fields: serde_json::Value,
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
            Some(Err(e)) => bail!("State file invalid: error parsing initial state event: {}", e),
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

pub fn apply_state_event(state: &mut serde_json::Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

/// Replay events, returning the resulting document and the number of events.
pub fn apply_state_events(
    state: &mut serde_json::Value,
    events: impl Iterator<Item = Result<StateEvent>>,
) -> Result<u64> {
    let mut count = 0;
    for event in events {
        let event = event?;
        if event.index != count {
            bail!(
                "State file invalid: expected event index {}, got {}",
                count,
                event.index
            );
        }
        apply_state_event(state, &event)?;
        count += 1;
    }
    Ok(count)
}

/// Monitor a task which may take a long time, and write messages to the console
/// as needed.
/// After SILENT_INTERVAL: print activity
/// After LOG_INTERVAL: print activity and duration
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
            let now = std::time::Instant::now();
            std::thread::sleep(next_log.saturating_duration_since(now));
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            eprintln!(
                "{} ({} s)",
                activity,
                next_log.duration_since(start).as_secs()
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

/// Low level append access to a state file.
pub struct StateHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    /// The file size after our last append, to detect foreign writes.
    expected_size: u64,
}
impl StateHandle {
    pub fn open<P: AsRef<Path>>(name: P, create_new: bool) -> Result<StateHandle> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(name)?;
        let expected_size = file.metadata()?.len();
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        Ok(StateHandle {
            file,
            locking,
            expected_size,
        })
    }
    fn lock_write(locking: &mut fd_lock::RwLock<Arc<File>>) -> Result<fd_lock::RwLockWriteGuard<Arc<File>>> {
        let lock_wait_mon = WaitMonitor::new("Waiting for state file write lock".to_owned());
        let lock = locking.write()?;
        lock_wait_mon.done();
        Ok(lock)
    }
    pub fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        let lock_guard = Self::lock_write(&mut self.locking)?;
        let pos = (&*self.file).seek(io::SeekFrom::End(0))?;
        if pos != self.expected_size {
            warn!(
                "Detected concurrent writing. Foreign bytes: [{}..{})",
                self.expected_size, pos
            );
            bail!("The state file was modified by another process; refusing to append to it");
        }
        let mut writer = io::BufWriter::new(&*self.file);

        for event in events {
            // Pretty printed, so that the log can be read and diffed by humans.
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        self.expected_size = (&*self.file).stream_position()?;

        drop(lock_guard);
        Ok(())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// A state file opened for writing snapshots.
///
/// Keeps the last written snapshot in memory, so that each write only
/// appends the difference. A snapshot is only written when it differs from
/// the previous one, and each written snapshot gets the next serial.
pub struct StateFile {
    path: PathBuf,
    handle: StateHandle,
    last: serde_json::Value,
    next_index: u64,
}

impl StateFile {
    /// Create a new state file holding `initial`. Fails if the file exists.
    pub fn create(path: &Path, initial: &State) -> Result<StateFile> {
        let mut handle = StateHandle::open(path, true)
            .with_context(|| format!("Could not create state file {}", path.display()))?;
        let snapshot = initial.to_json()?;
        handle.append(&[&StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: now(),
                other_fields: serde_json::json!({}),
            },
            patch: json_patch::Patch(vec![json_patch::PatchOperation::Add(json_patch::AddOperation {
                path: "".parse().context("empty JSON pointer")?,
                value: snapshot.clone(),
            })]),
        }])?;
        debug!(path = %path.display(), "created state file");
        Ok(StateFile {
            path: path.to_owned(),
            handle,
            last: snapshot,
            next_index: 1,
        })
    }

    /// Open an existing state file, returning it with its current snapshot.
    pub fn open(path: &Path) -> Result<(StateFile, State)> {
        let (last, next_index) = read_snapshot(path)?;
        let state = State::from_json(last.clone())
            .with_context(|| format!("Could not load state file {}", path.display()))?;
        let handle = StateHandle::open(path, false)
            .with_context(|| format!("Could not open state file {}", path.display()))?;
        Ok((
            StateFile {
                path: path.to_owned(),
                handle,
                last,
                next_index,
            },
            state,
        ))
    }

    /// Open the state file, creating it with an empty state if it does not
    /// exist.
    pub fn open_or_create(path: &Path) -> Result<(StateFile, State)> {
        if path.exists() {
            Self::open(path)
        } else {
            let state = State::new();
            let file = Self::create(path, &state)?;
            Ok((file, state))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The serial of the last written snapshot.
    pub fn serial(&self) -> u64 {
        self.last["serial"].as_u64().unwrap_or(0)
    }

    /// Append `state` if it differs from the last snapshot. Returns the
    /// serial of the snapshot now at the end of the file.
    pub fn persist(&mut self, state: &State) -> Result<u64> {
        if Some(state.lineage.as_str()) != self.last["lineage"].as_str() {
            bail!(
                "Refusing to write state with lineage {} to {}, which holds a different lineage",
                state.lineage,
                self.path.display()
            );
        }
        let mut next = state.to_json()?;
        next["serial"] = self.last["serial"].clone();
        if next == self.last {
            return Ok(self.serial());
        }
        let serial = self.serial() + 1;
        next["serial"] = serde_json::json!(serial);
        let patch = json_patch::diff(&self.last, &next);
        self.handle.append(&[&StateEvent {
            index: self.next_index,
            meta: StateEventMeta {
                time: now(),
                other_fields: serde_json::json!({}),
            },
            patch,
        }])?;
        debug!(serial, index = self.next_index, "persisted state");
        self.next_index += 1;
        self.last = next;
        Ok(serial)
    }
}

fn read_snapshot(path: &Path) -> Result<(serde_json::Value, u64)> {
    let file = File::open(path).with_context(|| format!("Could not open state file {}", path.display()))?;
    let stream = StateEventStream::open_from_reader(io::BufReader::new(file))?;
    let mut snapshot = serde_json::json!({});
    let count = apply_state_events(&mut snapshot, stream)
        .with_context(|| format!("Could not replay state file {}", path.display()))?;
    Ok((snapshot, count))
}

/// Read the current snapshot without opening the file for writing.
pub fn read_state(path: &Path) -> Result<State> {
    let (snapshot, _) = read_snapshot(path)?;
    State::from_json(snapshot).with_context(|| format!("Could not load state file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::{
        addrs::{ProviderAddr, ResourceInstanceAddr},
        states::{ObjectStatus, ResourceInstanceObjectSrc},
    };

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2019-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "_type": "groveState", "format_version": 4, "lineage": "l", "serial": 0, "modules": {} },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2019-03-04T07:41:00Z"},
        "patch": [
            { "op": "replace", "path": "/serial", "value": 1 },
            { "op": "add", "path": "/modules/", "value": { "resources": {}, "outputs": {} } }
        ]
    }
"#;

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(events[0].as_ref().unwrap().meta.time, "2019-03-04T07:40:00Z");
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let mut state = serde_json::json!({});
        let count = apply_state_events(&mut state, stream).unwrap();
        assert_eq!(count, 2);
        let state = State::from_json(state).unwrap();
        assert_eq!(state.serial, 1);
        assert_eq!(state.lineage, "l");
    }

    #[test]
    fn test_open_state_stream_invalid_index() {
        let input = r#"{"index":1,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn test_open_state_stream_no_index() {
        let input = r#"{"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn test_open_state_stream_invalid_json() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn test_open_state_stream_empty() {
        assert!(StateEventStream::open_from_reader("".as_bytes()).is_err());
    }

    #[test]
    fn test_out_of_order_events() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}
{"index":2,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let mut state = serde_json::json!({});
        assert!(apply_state_events(&mut state, stream).is_err());
    }

    #[test]
    fn test_invalid_second() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}
{"meta":{"time":"2019-06-04T07:40:00Z"}}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let vec: Vec<Result<StateEvent>> = stream.collect();
        assert!(vec[1].is_err());
    }

    fn sample_object() -> ResourceInstanceObjectSrc {
        ResourceInstanceObjectSrc {
            status: ObjectStatus::Ready,
            schema_version: 0,
            attributes: serde_json::json!({"id": "abc"}),
            dependencies: Default::default(),
            create_before_destroy: false,
        }
    }

    #[test]
    fn test_state_file_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.state");
        let (mut file, mut state) = StateFile::open_or_create(&path).unwrap();
        assert_eq!(file.serial(), 0);

        let addr: ResourceInstanceAddr = "local_file.a".parse().unwrap();
        state.set_current(&addr, Some(sample_object()), &ProviderAddr::new("local"));
        assert_eq!(file.persist(&state).unwrap(), 1);
        // Unchanged snapshots are not written again
        assert_eq!(file.persist(&state).unwrap(), 1);

        state.set_current(&addr, None, &ProviderAddr::new("local"));
        assert_eq!(file.persist(&state).unwrap(), 2);
        drop(file);

        let reloaded = read_state(&path).unwrap();
        assert_eq!(reloaded.serial, 2);
        assert_eq!(reloaded.lineage, state.lineage);
        assert!(reloaded.current_object(&addr).is_none());

        let (file, reopened) = StateFile::open(&path).unwrap();
        assert_eq!(file.serial(), 2);
        assert_eq!(reopened, reloaded);
    }

    #[test]
    fn test_state_file_rejects_other_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.state");
        let (mut file, _) = StateFile::open_or_create(&path).unwrap();
        assert!(file.persist(&State::new()).is_err());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.state");
        StateFile::create(&path, &State::new()).unwrap();
        assert!(StateFile::create(&path, &State::new()).is_err());
    }

    #[test]
    fn test_concurrent_writer_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.state");
        let (mut first, mut state) = StateFile::open_or_create(&path).unwrap();
        // Opened before the first handle writes
        let (mut second, mut state2) = StateFile::open(&path).unwrap();

        let addr: ResourceInstanceAddr = "local_file.a".parse().unwrap();
        state.set_current(&addr, Some(sample_object()), &ProviderAddr::new("local"));
        first.persist(&state).unwrap();

        let other: ResourceInstanceAddr = "local_file.b".parse().unwrap();
        state2.set_current(&other, Some(sample_object()), &ProviderAddr::new("local"));
        assert!(second.persist(&state2).is_err());
    }

    #[test]
    fn test_persist_waits_for_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.state");
        let (mut file, mut state) = StateFile::open_or_create(&path).unwrap();

        // Another writer holding the lock on its own file description
        let mut foreign = fd_lock::RwLock::new(OpenOptions::new().append(true).open(&path).unwrap());
        let hold = Duration::from_millis(300);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = foreign.write().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(hold);
        });
        locked_rx.recv().unwrap();

        let start = std::time::Instant::now();
        let addr: ResourceInstanceAddr = "local_file.a".parse().unwrap();
        state.set_current(&addr, Some(sample_object()), &ProviderAddr::new("local"));
        assert_eq!(file.persist(&state).unwrap(), 1);
        assert!(start.elapsed() >= hold / 2);
        holder.join().unwrap();

        assert_eq!(read_state(&path).unwrap().serial, 1);
        assert_eq!(file.persist(&state).unwrap(), 1);
    }
}
