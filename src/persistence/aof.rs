//! Append-Only Log
//!
//! Every mutating command is appended to the log as a RESP multi-bulk record,
//! tagged with the database it ran against:
//!
//! ```text
//!  add_aof(db, cmd) ──┬── always ──────────────────────────┐
//!                     │                                    ▼
//!                     └── bounded queue ──> writer ──> [ pausing mutex ]
//!                                          thread      file, current db,
//!                                                      listeners
//!                                                          │
//!                                     SELECT <db> if the db changed
//!                                     then the record, then listeners
//! ```
//!
//! One mutex (the "pausing" mutex) guards the file handle, the database
//! cursor and the listener set. Holding it pauses the log: the writer thread,
//! explicit fsyncs, and both critical phases of a rewrite take it.
//!
//! ## Fsync policies
//!
//! - `always`: the caller writes and fsyncs synchronously, bypassing the queue
//! - `everysec`: a ticker thread fsyncs once per second
//! - `no`: flushing is left to the operating system
//!
//! ## Replay
//!
//! [`replay`] rebuilds a keyspace from a log image. A leading snapshot
//! preamble is decoded first; the rest is applied record by record with log
//! emission suppressed. Malformed records are skipped and a truncated final
//! record ends replay.

use super::snapshot;
use crate::config::{Config, FsyncPolicy};
use crate::error::{PersistError, PersistResult};
use crate::protocol::{encode_command_into, select_command, CmdLine, LogDecoder, LogRecord};
use crate::storage::Keyspace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacity of the queue between producers and the writer thread.
pub const AOF_QUEUE_SIZE: usize = 1 << 16;

/// Interval of the `everysec` fsync ticker.
const FSYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Receives every batch of records after it has been appended.
///
/// A batch holds the record itself, preceded by the synthetic `SELECT` when
/// one was emitted. Callbacks run under the pausing mutex and must not call
/// back into the persister.
pub trait Listener: Send + Sync {
    fn callback(&self, batch: &[CmdLine]);
}

/// Lifecycle state reported by `INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterState {
    /// No file handle: the log is closed.
    Idle,
    Appending,
    Rewriting,
}

impl PersisterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersisterState::Idle => "idle",
            PersisterState::Appending => "appending",
            PersisterState::Rewriting => "rewriting",
        }
    }
}

/// One record on its way to the writer.
#[derive(Debug)]
struct Payload {
    db: usize,
    cmd: CmdLine,
}

/// State guarded by the pausing mutex.
pub(crate) struct AofState {
    pub(crate) file: Option<File>,
    /// Database the log's record stream currently targets.
    pub(crate) current_db: usize,
    listeners: HashMap<u64, Arc<dyn Listener>>,
    buf: Vec<u8>,
}

/// The part of the persister shared with its threads.
pub(crate) struct AofShared {
    pub(crate) state: Mutex<AofState>,
    policy: FsyncPolicy,
}

impl AofShared {
    /// Appends one record, injecting `SELECT` when the database changes.
    fn append(&self, db: usize, cmd: CmdLine) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(file) = state.file.as_mut() else {
            warn!(db, "Append-only log is closed, dropping record");
            return;
        };

        let mut batch = Vec::with_capacity(2);
        state.buf.clear();
        if db != state.current_db {
            let select = select_command(db);
            encode_command_into(&select, &mut state.buf);
            batch.push(select);
        }
        encode_command_into(&cmd, &mut state.buf);
        batch.push(cmd);

        if let Err(e) = file.write_all(&state.buf) {
            warn!(error = %e, "Failed to append to the append-only log");
            return;
        }
        state.current_db = db;

        for listener in state.listeners.values() {
            listener.callback(&batch);
        }

        if self.policy == FsyncPolicy::Always {
            if let Err(e) = file.sync_data() {
                error!(error = %e, "fsync of the append-only log failed");
            }
        }
    }

    fn fsync(&self) {
        let state = self.state.lock();
        if let Some(file) = state.file.as_ref() {
            if let Err(e) = file.sync_data() {
                error!(error = %e, "fsync of the append-only log failed");
            }
        }
    }
}

/// Owner of the append-only log and its background threads.
pub struct Persister {
    pub(crate) config: Config,
    pub(crate) path: PathBuf,
    pub(crate) shared: Arc<AofShared>,
    tx: Mutex<Option<SyncSender<Payload>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<(SyncSender<()>, JoinHandle<()>)>>,
    pub(crate) rewriting: AtomicBool,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("path", &self.path)
            .field("policy", &self.shared.policy)
            .field("state", &self.state())
            .finish()
    }
}

impl Persister {
    /// Opens (or creates) the log and starts the writer thread, plus the
    /// fsync ticker under `everysec`.
    ///
    /// # Arguments
    ///
    /// * `config` - Server configuration; supplies the path and fsync policy
    pub fn open(config: &Config) -> PersistResult<Arc<Self>> {
        let path = config.aof_path();
        let file = open_append(&path)?;

        let shared = Arc::new(AofShared {
            state: Mutex::new(AofState {
                file: Some(file),
                current_db: 0,
                listeners: HashMap::new(),
                buf: Vec::new(),
            }),
            policy: config.appendfsync,
        });

        let (tx, rx) = mpsc::sync_channel(AOF_QUEUE_SIZE);
        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("aof-writer".to_string())
                .spawn(move || writer_loop(shared, rx))?
        };

        let ticker = if config.appendfsync == FsyncPolicy::EverySec {
            let (stop_tx, stop_rx) = mpsc::sync_channel(1);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("aof-fsync".to_string())
                .spawn(move || ticker_loop(shared, stop_rx))?;
            Some((stop_tx, handle))
        } else {
            None
        };

        info!(
            path = %path.display(),
            fsync = config.appendfsync.as_str(),
            "Append-only log opened"
        );

        Ok(Arc::new(Self {
            config: config.clone(),
            path,
            shared,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            ticker: Mutex::new(ticker),
            rewriting: AtomicBool::new(false),
            next_listener_id: AtomicU64::new(1),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.shared.policy
    }

    /// `Idle` once the file handle is gone (after `close`, or a failed
    /// reopen at the end of a rewrite).
    pub fn state(&self) -> PersisterState {
        if self.shared.state.lock().file.is_none() {
            PersisterState::Idle
        } else if self.rewriting.load(Ordering::SeqCst) {
            PersisterState::Rewriting
        } else {
            PersisterState::Appending
        }
    }

    /// Database the log's record stream currently targets.
    pub fn current_db(&self) -> usize {
        self.shared.state.lock().current_db
    }

    /// Logs a command executed against database `db`.
    ///
    /// Under `always` the record is written and fsynced before returning;
    /// otherwise it is queued, blocking while the queue is full.
    pub fn add_aof(&self, db: usize, cmd: CmdLine) {
        if self.shared.policy == FsyncPolicy::Always {
            self.shared.append(db, cmd);
            return;
        }

        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(Payload { db, cmd }).is_err() {
                    warn!(db, "Append-only log writer is gone, dropping record");
                }
            }
            None => debug!(db, "Append-only log is closed, dropping record"),
        }
    }

    /// Flushes the log to disk.
    pub fn fsync(&self) {
        self.shared.fsync();
    }

    /// Registers a listener and returns its id.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().listeners.insert(id, listener);
        id
    }

    /// Removes a listener. Returns `true` if it was registered.
    pub fn unregister_listener(&self, id: u64) -> bool {
        self.shared.state.lock().listeners.remove(&id).is_some()
    }

    /// Stops the log: drains the queue, joins the threads, fsyncs and closes
    /// the file. Calling it again does nothing.
    pub fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                error!("Append-only log writer panicked");
            }
        }

        if let Some((stop_tx, handle)) = self.ticker.lock().take() {
            drop(stop_tx);
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock();
        if let Some(file) = state.file.take() {
            if let Err(e) = file.sync_all() {
                error!(error = %e, "Final fsync of the append-only log failed");
            }
            info!(path = %self.path.display(), "Append-only log closed");
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn open_append(path: &Path) -> PersistResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)?)
}

fn writer_loop(shared: Arc<AofShared>, rx: Receiver<Payload>) {
    debug!("Append-only log writer started");
    for payload in rx {
        shared.append(payload.db, payload.cmd);
    }
    debug!("Append-only log writer drained");
}

fn ticker_loop(shared: Arc<AofShared>, stop_rx: Receiver<()>) {
    loop {
        match stop_rx.recv_timeout(FSYNC_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => shared.fsync(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// What a replay found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Keys restored from a snapshot preamble
    pub preamble_keys: usize,
    /// Command records applied
    pub commands: usize,
    /// Records skipped as malformed or rejected
    pub skipped: usize,
    /// Offset of a truncated final record, if any
    pub truncated_at: Option<usize>,
    /// Bytes of the image examined
    pub bytes: usize,
}

/// Keeps a keyspace in loading mode for the guard's lifetime.
struct LoadingGuard<'a>(&'a Keyspace);

impl<'a> LoadingGuard<'a> {
    fn new(keyspace: &'a Keyspace) -> Self {
        keyspace.set_loading(true);
        Self(keyspace)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_loading(false);
    }
}

/// Replays the log at `path` into `keyspace`.
///
/// With `limit`, only the first `limit` bytes are read. A missing file
/// replays nothing. A corrupt snapshot preamble is an error; a malformed
/// command record is logged and skipped.
pub fn replay(path: &Path, keyspace: &Keyspace, limit: Option<u64>) -> PersistResult<ReplayStats> {
    let mut data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReplayStats::default()),
        Err(e) => return Err(e.into()),
    };
    if let Some(limit) = limit {
        data.truncate(limit.min(data.len() as u64) as usize);
    }
    replay_bytes(&data, keyspace)
}

/// Replays an in-memory log image into `keyspace`.
pub fn replay_bytes(data: &[u8], keyspace: &Keyspace) -> PersistResult<ReplayStats> {
    let _loading = LoadingGuard::new(keyspace);
    let mut stats = ReplayStats {
        bytes: data.len(),
        ..Default::default()
    };

    let mut start = 0;
    if snapshot::has_magic(data) {
        let info = snapshot::decode(data, |record| {
            keyspace
                .restore(record.db, record.key, record.entity, record.expire_at, false)
                .map(|_| ())
                .map_err(|e| PersistError::CorruptSnapshot(e.to_string()))
        })?;
        stats.preamble_keys = info.keys;
        start = info.consumed;
        debug!(keys = info.keys, bytes = info.consumed, "Loaded snapshot preamble");
    }

    let mut db = 0usize;
    let mut decoder = LogDecoder::new(&data[start..]);
    for record in decoder.by_ref() {
        match record {
            LogRecord::Command(cmd) => {
                if cmd
                    .first()
                    .is_some_and(|name| name.eq_ignore_ascii_case(b"select"))
                {
                    match parse_select(&cmd, keyspace.db_count()) {
                        Some(index) => db = index,
                        None => {
                            warn!(record = ?cmd, "Invalid SELECT in append-only log, skipping");
                            stats.skipped += 1;
                        }
                    }
                    continue;
                }

                match keyspace.execute(db, &cmd) {
                    Ok(_) => stats.commands += 1,
                    Err(e) => {
                        warn!(db, error = %e, "Append-only log record rejected, skipping");
                        stats.skipped += 1;
                    }
                }
            }
            LogRecord::Malformed { offset, reason } => {
                warn!(offset = start + offset, reason = %reason, "Malformed append-only log record, skipping");
                stats.skipped += 1;
            }
            LogRecord::Truncated { offset } => {
                warn!(offset = start + offset, "Append-only log ends with a truncated record");
                stats.truncated_at = Some(start + offset);
                break;
            }
        }
    }

    Ok(stats)
}

fn parse_select(cmd: &CmdLine, db_count: usize) -> Option<usize> {
    if cmd.len() != 2 {
        return None;
    }
    let index: usize = std::str::from_utf8(&cmd[1]).ok()?.parse().ok()?;
    (index < db_count).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{cmd_line, encode_command};
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn config(dir: &TempDir, policy: FsyncPolicy) -> Config {
        Config {
            dir: dir.path().to_path_buf(),
            appendonly: true,
            appendfsync: policy,
            ..Config::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        batches: StdMutex<Vec<Vec<CmdLine>>>,
    }

    impl Listener for Recorder {
        fn callback(&self, batch: &[CmdLine]) {
            self.batches.lock().unwrap().push(batch.to_vec());
        }
    }

    #[test]
    fn test_select_is_injected_on_db_change() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, FsyncPolicy::No);
        let persister = Persister::open(&config).unwrap();
        persister.add_aof(0, cmd_line(&["SET", "a", "1"]));
        persister.add_aof(3, cmd_line(&["SET", "b", "2"]));
        persister.add_aof(3, cmd_line(&["SET", "c", "3"]));
        persister.close();

        let data = fs::read(config.aof_path()).unwrap();
        let mut expected = Vec::new();
        expected.extend(encode_command(&cmd_line(&["SET", "a", "1"])));
        expected.extend(encode_command(&select_command(3)));
        expected.extend(encode_command(&cmd_line(&["SET", "b", "2"])));
        expected.extend(encode_command(&cmd_line(&["SET", "c", "3"])));
        assert_eq!(data, expected);
    }

    #[test]
    fn test_always_writes_before_returning() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, FsyncPolicy::Always);
        let persister = Persister::open(&config).unwrap();
        persister.add_aof(0, cmd_line(&["SET", "a", "1"]));

        let data = fs::read(config.aof_path()).unwrap();
        assert_eq!(data, encode_command(&cmd_line(&["SET", "a", "1"])));
        persister.close();
    }

    #[test]
    fn test_listeners_see_select_in_batch() {
        let dir = TempDir::new().unwrap();
        let persister = Persister::open(&config(&dir, FsyncPolicy::Always)).unwrap();
        let recorder = Arc::new(Recorder::default());
        let id = persister.register_listener(recorder.clone());

        persister.add_aof(2, cmd_line(&["DEL", "a"]));
        persister.add_aof(2, cmd_line(&["DEL", "b"]));
        assert!(persister.unregister_listener(id));
        persister.add_aof(2, cmd_line(&["DEL", "c"]));

        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![select_command(2), cmd_line(&["DEL", "a"])]);
        assert_eq!(batches[1], vec![cmd_line(&["DEL", "b"])]);
    }

    #[test]
    fn test_close_is_idempotent_and_drops_late_records() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, FsyncPolicy::EverySec);
        let persister = Persister::open(&config).unwrap();
        persister.add_aof(0, cmd_line(&["SET", "a", "1"]));
        assert_eq!(persister.state(), PersisterState::Appending);
        persister.close();
        assert_eq!(persister.state(), PersisterState::Idle);
        persister.close();
        persister.add_aof(0, cmd_line(&["SET", "b", "2"]));

        let data = fs::read(config.aof_path()).unwrap();
        assert_eq!(data, encode_command(&cmd_line(&["SET", "a", "1"])));
    }

    #[test]
    fn test_replay_tracks_select_and_skips_garbage() {
        let keyspace = Keyspace::new(&Config::default());
        let mut image = Vec::new();
        image.extend(encode_command(&cmd_line(&["SET", "a", "1"])));
        image.extend_from_slice(b"garbage\r\n");
        image.extend(encode_command(&select_command(5)));
        image.extend(encode_command(&cmd_line(&["SET", "b", "2"])));
        image.extend(encode_command(&cmd_line(&["NOSUCHCMD", "x"])));
        image.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nc");

        let stats = replay_bytes(&image, &keyspace).unwrap();
        assert_eq!(stats.commands, 2);
        assert_eq!(stats.skipped, 2);
        assert!(stats.truncated_at.is_some());
        assert!(!keyspace.is_loading());

        assert_eq!(keyspace.db(0).unwrap().len(), 1);
        assert_eq!(keyspace.db(5).unwrap().keys_matching(b"*"), vec![Bytes::from("b")]);
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let keyspace = Keyspace::new(&Config::default());
        let stats = replay(&dir.path().join("missing.aof"), &keyspace, None).unwrap();
        assert_eq!(stats, ReplayStats::default());
    }

    #[test]
    fn test_replay_respects_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.aof");
        let first = encode_command(&cmd_line(&["SET", "a", "1"]));
        let mut image = first.clone();
        image.extend(encode_command(&cmd_line(&["SET", "b", "2"])));
        fs::write(&path, &image).unwrap();

        let keyspace = Keyspace::new(&Config::default());
        let stats = replay(&path, &keyspace, Some(first.len() as u64)).unwrap();
        assert_eq!(stats.commands, 1);
        assert_eq!(keyspace.key_count(), 1);
    }
}
