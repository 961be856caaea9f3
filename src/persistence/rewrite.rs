//! Online log rewrite.
//!
//! Rewriting replaces a long log with a compact equivalent while writes keep
//! flowing. It runs in three phases; only the first and last hold the pausing
//! mutex:
//!
//! ```text
//!  live log:  [ ........ prefix ........ | tail written during rewrite ]
//!                                        ^
//!                                   file_size (recorded at start)
//!
//!  1. start     fsync, record file_size and the current db, create temp file
//!  2. generate  replay prefix into a shadow keyspace, dump it to temp file
//!  3. finish    SELECT <db at start>, copy the tail, fsync, rename over the
//!               live log, reopen it, SELECT <current db>
//! ```
//!
//! The prefix replays to exactly the state the log described at start, and
//! the tail was written by the same cursor that was active at start, so the
//! rewritten log replays to the same state as the old one. A failure in any
//! phase drops the temp file and leaves the live log untouched.

use super::aof::{open_append, replay, AofState, Persister};
use super::snapshot;
use crate::error::{PersistError, PersistResult};
use crate::protocol::{encode_command, encode_command_into, select_command};
use crate::storage::{expire_command, Keyspace};
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// State carried from the start of a rewrite to its end.
#[derive(Debug)]
pub struct RewriteContext {
    tmp: NamedTempFile,
    /// Length of the live log when the rewrite started
    file_size: u64,
    /// Database the live log targeted when the rewrite started
    db_index: usize,
}

impl RewriteContext {
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn db_index(&self) -> usize {
        self.db_index
    }
}

impl Persister {
    /// Rewrites the log. Fails with [`PersistError::RewriteInProgress`] if
    /// another rewrite is running.
    pub fn rewrite(&self) -> PersistResult<()> {
        if self.rewriting.swap(true, Ordering::SeqCst) {
            return Err(PersistError::RewriteInProgress);
        }
        let started = Instant::now();
        let result = self.run_rewrite();
        self.rewriting.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(
                path = %self.path.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Append-only log rewritten"
            ),
            Err(e) => warn!(error = %e, "Append-only log rewrite aborted"),
        }
        result
    }

    fn run_rewrite(&self) -> PersistResult<()> {
        let mut ctx = self.start_rewrite()?;
        self.generate_rewrite(&mut ctx)?;
        self.finish_rewrite(ctx)
    }

    /// Phase 1, under the pausing mutex.
    pub fn start_rewrite(&self) -> PersistResult<RewriteContext> {
        let state = self.shared.state.lock();
        let file = state.file.as_ref().ok_or(PersistError::Closed)?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();
        let tmp = NamedTempFile::new_in(&self.config.dir)?;
        debug!(file_size, db = state.current_db, "Rewrite started");
        Ok(RewriteContext {
            tmp,
            file_size,
            db_index: state.current_db,
        })
    }

    /// Phase 2, without the pausing mutex.
    pub fn generate_rewrite(&self, ctx: &mut RewriteContext) -> PersistResult<()> {
        let shadow = Keyspace::new(&self.config);
        let stats = replay(&self.path, &shadow, Some(ctx.file_size))?;
        debug!(
            commands = stats.commands,
            preamble_keys = stats.preamble_keys,
            keys = shadow.key_count(),
            "Rewrite source replayed"
        );

        let mut out = BufWriter::new(ctx.tmp.as_file_mut());
        if self.config.aof_use_rdb_preamble {
            snapshot::write_keyspace(&shadow, &mut out, true)?;
        } else {
            write_commands(&shadow, &mut out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Phase 3, under the pausing mutex.
    pub fn finish_rewrite(&self, ctx: RewriteContext) -> PersistResult<()> {
        let mut state = self.shared.state.lock();
        if state.file.is_none() {
            return Err(PersistError::Closed);
        }
        let RewriteContext {
            mut tmp,
            file_size,
            db_index,
        } = ctx;

        tmp.write_all(&encode_command(&select_command(db_index)))?;

        let mut live = File::open(&self.path)?;
        live.seek(SeekFrom::Start(file_size))?;
        let copied = io::copy(&mut live, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;

        tmp.persist(&self.path).map_err(|e| PersistError::Io(e.error))?;

        // The old handle now points at an unlinked file.
        let current_db = state.current_db;
        let reopened = open_append(&self.path);
        let file = install_handle(&mut state, &self.path, reopened)?;
        file.write_all(&encode_command(&select_command(current_db)))?;

        debug!(tail_bytes = copied, "Rewrite finished");
        Ok(())
    }
}

/// Swaps the reopened log into the pausing state. If reopening failed the
/// handle is cleared, so later records are dropped with a warning instead of
/// landing in the replaced file.
fn install_handle<'a>(
    state: &'a mut AofState,
    path: &Path,
    reopened: PersistResult<File>,
) -> PersistResult<&'a mut File> {
    match reopened {
        Ok(file) => Ok(state.file.insert(file)),
        Err(e) => {
            state.file = None;
            error!(path = %path.display(), error = %e, "Failed to reopen the rewritten append-only log, appends are disabled");
            Err(e)
        }
    }
}

/// Dumps `keyspace` as commands: a `SELECT` per non-empty database, one
/// reconstructive write per key and a `PEXPIREAT` per key with a deadline.
fn write_commands<W: Write>(keyspace: &Keyspace, out: &mut W) -> PersistResult<()> {
    let mut buf = Vec::new();
    for db in keyspace.databases() {
        if db.is_empty() {
            continue;
        }
        buf.clear();
        encode_command_into(&select_command(db.index()), &mut buf);
        {
            let locked = db.lock_all(false);
            locked.for_each(|key, entity, expire_at| {
                encode_command_into(&entity.to_command(key), &mut buf);
                if let Some(at) = expire_at {
                    encode_command_into(&expire_command(key, at), &mut buf);
                }
            });
        }
        out.write_all(&buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FsyncPolicy};
    use crate::persistence::PersisterState;
    use crate::protocol::cmd_line;
    use crate::storage::unix_ms;
    use std::fs;
    use tempfile::TempDir;

    fn config(dir: &TempDir, preamble: bool) -> Config {
        Config {
            dir: dir.path().to_path_buf(),
            appendonly: true,
            appendfsync: FsyncPolicy::Always,
            aof_use_rdb_preamble: preamble,
            ..Config::default()
        }
    }

    fn replayed(config: &Config) -> Keyspace {
        let ks = Keyspace::new(config);
        replay(&config.aof_path(), &ks, None).unwrap();
        ks
    }

    fn get(ks: &Keyspace, db: usize, key: &str) -> Option<bytes::Bytes> {
        ks.execute(db, &cmd_line(&["GET", key]))
            .unwrap()
            .as_bytes()
            .map(bytes::Bytes::copy_from_slice)
    }

    #[test]
    fn test_rewrite_compacts_log() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);
        let persister = Persister::open(&config).unwrap();
        for i in 0..100 {
            persister.add_aof(0, cmd_line(&["SET", "counter", i.to_string().as_str()]));
        }
        let before = fs::metadata(config.aof_path()).unwrap().len();
        persister.rewrite().unwrap();
        let after = fs::metadata(config.aof_path()).unwrap().len();
        assert!(after < before);

        let ks = replayed(&config);
        assert_eq!(get(&ks, 0, "counter"), Some(bytes::Bytes::from("99")));
        persister.close();
    }

    #[test]
    fn test_writes_between_phases_are_kept() {
        for preamble in [false, true] {
            let dir = TempDir::new().unwrap();
            let config = config(&dir, preamble);
            let persister = Persister::open(&config).unwrap();
            persister.add_aof(0, cmd_line(&["SET", "a", "1"]));
            persister.add_aof(4, cmd_line(&["SET", "x", "1"]));

            let mut ctx = persister.start_rewrite().unwrap();
            assert_eq!(ctx.db_index(), 4);
            // Written after start: must come from the copied tail.
            persister.add_aof(4, cmd_line(&["SET", "y", "2"]));
            persister.generate_rewrite(&mut ctx).unwrap();
            persister.add_aof(0, cmd_line(&["SET", "b", "2"]));
            persister.finish_rewrite(ctx).unwrap();
            // Written after finish: goes to the reopened handle.
            persister.add_aof(0, cmd_line(&["SET", "c", "3"]));
            persister.close();

            let ks = replayed(&config);
            assert_eq!(get(&ks, 0, "a"), Some(bytes::Bytes::from("1")));
            assert_eq!(get(&ks, 0, "b"), Some(bytes::Bytes::from("2")));
            assert_eq!(get(&ks, 0, "c"), Some(bytes::Bytes::from("3")));
            assert_eq!(get(&ks, 4, "x"), Some(bytes::Bytes::from("1")));
            assert_eq!(get(&ks, 4, "y"), Some(bytes::Bytes::from("2")));
            assert_eq!(ks.key_count(), 5, "preamble = {}", preamble);
        }
    }

    #[test]
    fn test_rewrite_keeps_deadlines() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);
        let persister = Persister::open(&config).unwrap();
        let at = unix_ms() + 100_000;
        persister.add_aof(0, cmd_line(&["SET", "a", "1"]));
        persister.add_aof(0, cmd_line(&["PEXPIREAT", "a", at.to_string().as_str()]));
        persister.rewrite().unwrap();
        persister.close();

        let ks = replayed(&config);
        let locked = ks
            .db(0)
            .unwrap()
            .lock(&crate::storage::KeySpec::read(vec![bytes::Bytes::from("a")]));
        assert_eq!(locked.expire_at(b"a").unwrap(), Some(at));
    }

    #[test]
    fn test_concurrent_rewrite_is_rejected() {
        let dir = TempDir::new().unwrap();
        let persister = Persister::open(&config(&dir, false)).unwrap();
        persister.rewriting.store(true, Ordering::SeqCst);
        assert!(matches!(
            persister.rewrite(),
            Err(PersistError::RewriteInProgress)
        ));
        persister.rewriting.store(false, Ordering::SeqCst);
        assert!(persister.rewrite().is_ok());
    }

    #[test]
    fn test_failed_reopen_disables_appends() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);
        let persister = Persister::open(&config).unwrap();
        persister.add_aof(0, cmd_line(&["SET", "a", "1"]));

        {
            let mut state = persister.shared.state.lock();
            let failed = Err(PersistError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "denied",
            )));
            assert!(install_handle(&mut state, &config.aof_path(), failed).is_err());
            assert!(state.file.is_none());
        }
        assert_eq!(persister.state(), PersisterState::Idle);

        // Records are dropped, never written through a stale handle.
        let before = fs::read(config.aof_path()).unwrap();
        persister.add_aof(0, cmd_line(&["SET", "b", "2"]));
        assert_eq!(fs::read(config.aof_path()).unwrap(), before);
        assert!(matches!(persister.start_rewrite(), Err(PersistError::Closed)));
    }

    #[test]
    fn test_rewrite_swaps_in_new_handle() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);
        let persister = Persister::open(&config).unwrap();
        persister.add_aof(3, cmd_line(&["SET", "a", "1"]));
        persister.rewrite().unwrap();
        persister.add_aof(3, cmd_line(&["SET", "b", "2"]));
        persister.close();

        let ks = replayed(&config);
        assert_eq!(get(&ks, 3, "a"), Some(bytes::Bytes::from("1")));
        assert_eq!(get(&ks, 3, "b"), Some(bytes::Bytes::from("2")));
    }

    #[test]
    fn test_failed_rewrite_leaves_log_untouched() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);
        let persister = Persister::open(&config).unwrap();
        persister.add_aof(0, cmd_line(&["SET", "a", "1"]));
        let before = fs::read(config.aof_path()).unwrap();

        let ctx = persister.start_rewrite().unwrap();
        persister.close();
        assert!(matches!(
            persister.finish_rewrite(ctx),
            Err(PersistError::Closed)
        ));
        assert_eq!(fs::read(config.aof_path()).unwrap(), before);

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
