//! Keyspace
//!
//! The [`Keyspace`] owns every logical database together with the services
//! that act on them: the expiration scheduler, the eviction policy's knobs,
//! and (when the append-only log is enabled) the persister.
//!
//! ```text
//!              execute(db, cmd)
//!                    │
//!   ┌────────────────▼─────────────────────────────────────────┐
//!   │ Keyspace                                                 │
//!   │   command table ── arity / key spec / flags              │
//!   │   databases[0..n] ── lock(KeySpec) ──> LockedDb          │
//!   │   scheduler (timing wheel)        persister (optional)   │
//!   └──────────────────────────────────────────────────────────┘
//!          ▲                      ▲
//!   ExpiryDriver ── expire_key    eviction ── evict_key
//! ```
//!
//! Expiration and eviction delete through the same path as `DEL`: they take
//! the key's write lock, remove it from all three tables and emit `DEL key`
//! to the log.

use super::db::Database;
use super::descriptor::LfuPolicy;
use super::entity::{expire_command, Entity};
use super::expiry::{unix_ms, ExpiryScheduler};
use super::lock::{KeySpec, LockedDb};
use crate::commands::CommandTable;
use crate::config::Config;
use crate::error::CommandError;
use crate::persistence::Persister;
use crate::protocol::{cmd_line, CmdLine};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Counters reported by `INFO`.
#[derive(Debug, Default)]
pub struct KeyspaceStats {
    expired_keys: AtomicU64,
    evicted_keys: AtomicU64,
    commands_processed: AtomicU64,
}

impl KeyspaceStats {
    pub fn expired_keys(&self) -> u64 {
        self.expired_keys.load(Ordering::Relaxed)
    }

    pub fn evicted_keys(&self) -> u64 {
        self.evicted_keys.load(Ordering::Relaxed)
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    pub(crate) fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks a background save as running until dropped.
#[derive(Debug)]
pub struct SaveGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SaveGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Result of setting a deadline on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// The key does not exist; nothing changed.
    Missing,
    /// The deadline had already passed, so the key was deleted.
    Deleted,
    /// The deadline was recorded and a deletion job scheduled.
    Scheduled,
}

/// All databases of one server plus the services acting on them.
pub struct Keyspace {
    config: Config,
    databases: Vec<Database>,
    table: Arc<CommandTable>,
    scheduler: ExpiryScheduler,
    persister: OnceLock<Arc<Persister>>,
    loading: AtomicBool,
    saving: Arc<AtomicBool>,
    stats: KeyspaceStats,
    started_at: Instant,
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("databases", &self.databases.len())
            .field("keys", &self.key_count())
            .field("used_memory", &self.used_memory())
            .field("loading", &self.is_loading())
            .finish()
    }
}

impl Keyspace {
    /// Creates an empty keyspace from configuration.
    pub fn new(config: &Config) -> Self {
        Self::with_table(config, Arc::new(CommandTable::new()))
    }

    /// Creates an empty keyspace sharing an existing command table.
    pub fn with_table(config: &Config, table: Arc<CommandTable>) -> Self {
        let lfu = LfuPolicy {
            log_factor: config.lfu_log_factor,
            decay_time: config.lfu_decay_time,
        };
        Self {
            config: config.clone(),
            databases: (0..config.databases).map(|i| Database::new(i, lfu)).collect(),
            table,
            scheduler: ExpiryScheduler::new(config.expire_tick()),
            persister: OnceLock::new(),
            loading: AtomicBool::new(false),
            saving: Arc::new(AtomicBool::new(false)),
            stats: KeyspaceStats::default(),
            started_at: Instant::now(),
        }
    }

    /// An empty keyspace with the same configuration and command table,
    /// without a persister. Used to rebuild state from a log image.
    pub fn shadow(&self) -> Self {
        Self::with_table(&self.config, Arc::clone(&self.table))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    pub fn stats(&self) -> &KeyspaceStats {
        &self.stats
    }

    pub fn db_count(&self) -> usize {
        self.databases.len()
    }

    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    pub fn db(&self, index: usize) -> Result<&Database, CommandError> {
        self.databases
            .get(index)
            .ok_or(CommandError::DbIndexOutOfRange)
    }

    pub fn scheduler(&self) -> &ExpiryScheduler {
        &self.scheduler
    }

    /// Attaches the persister. Only the first call has an effect.
    pub fn attach_persister(&self, persister: Arc<Persister>) {
        if self.persister.set(persister).is_err() {
            debug!("Persister already attached, ignoring");
        }
    }

    pub fn persister(&self) -> Option<&Arc<Persister>> {
        self.persister.get()
    }

    /// While loading, log emission and eviction are suppressed.
    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Marks a save as running. Returns `None` if one already is.
    pub fn begin_save(&self) -> Option<SaveGuard> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(SaveGuard {
            flag: Arc::clone(&self.saving),
        })
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn maxmemory(&self) -> u64 {
        self.config.maxmemory
    }

    pub fn maxmemory_samples(&self) -> usize {
        self.config.maxmemory_samples
    }

    /// Reported memory: the sum of every database's estimate.
    pub fn used_memory(&self) -> usize {
        self.databases.iter().map(Database::used_memory).sum()
    }

    /// Re-measures every database exactly.
    pub fn recompute_memory(&self) -> usize {
        self.databases.iter().map(Database::recompute_memory).sum()
    }

    pub fn key_count(&self) -> usize {
        self.databases.iter().map(Database::len).sum()
    }

    /// Appends a command to the log on behalf of database `db`.
    ///
    /// A no-op while loading or when the log is disabled.
    pub fn add_aof(&self, db: usize, cmd: CmdLine) {
        if self.is_loading() {
            return;
        }
        if let Some(persister) = self.persister() {
            persister.add_aof(db, cmd);
        }
    }

    /// Sets or replaces a key's deadline under an already held write lock.
    ///
    /// A deadline that has already passed deletes the key at once and logs
    /// `DEL`. Logging the expiration itself is left to the caller.
    pub fn expire_locked(
        &self,
        locked: &mut LockedDb<'_>,
        key: &Bytes,
        at_ms: u64,
    ) -> Result<ExpireOutcome, CommandError> {
        if !locked.contains(key)? {
            return Ok(ExpireOutcome::Missing);
        }
        let db = locked.db_index();
        if at_ms <= unix_ms() {
            locked.remove(key)?;
            self.scheduler.cancel(db, key);
            self.stats.expired_keys.fetch_add(1, Ordering::Relaxed);
            self.add_aof(db, cmd_line(&[b"DEL".as_slice(), key.as_ref()]));
            return Ok(ExpireOutcome::Deleted);
        }
        locked.set_expire_at(key, at_ms)?;
        self.scheduler.schedule(db, key.clone(), at_ms);
        Ok(ExpireOutcome::Scheduled)
    }

    /// Runs the expiration job of one key.
    ///
    /// Deletes the key only if its recorded deadline has passed, so a job
    /// outlived by a DEL, SET, PERSIST or a later deadline does nothing.
    /// Returns `true` if the key was deleted.
    pub fn expire_key(&self, db: usize, key: &Bytes) -> bool {
        let Ok(database) = self.db(db) else {
            return false;
        };
        let mut locked = database.lock(&KeySpec::write(vec![key.clone()]));
        let due = match locked.expire_at(key) {
            Ok(Some(at)) => at <= unix_ms(),
            _ => false,
        };
        if !due {
            return false;
        }
        if !matches!(locked.remove(key), Ok(Some(_))) {
            return false;
        }
        self.stats.expired_keys.fetch_add(1, Ordering::Relaxed);
        self.add_aof(db, cmd_line(&[b"DEL".as_slice(), key.as_ref()]));
        trace!(db, key = %String::from_utf8_lossy(key), "Key expired");
        true
    }

    /// Deletes a key chosen by the eviction policy.
    ///
    /// Returns the accounted bytes freed, or `None` if the key was already
    /// gone.
    pub fn evict_key(&self, db: usize, key: &Bytes) -> Option<usize> {
        let database = self.db(db).ok()?;
        let before = database.used_memory();
        let mut locked = database.lock(&KeySpec::write(vec![key.clone()]));
        locked.remove(key).ok()??;
        // DEL must be logged before another writer can recreate the key.
        self.scheduler.cancel(db, key);
        self.add_aof(db, cmd_line(&[b"DEL".as_slice(), key.as_ref()]));
        drop(locked);
        self.stats.evicted_keys.fetch_add(1, Ordering::Relaxed);
        trace!(db, key = %String::from_utf8_lossy(key), "Key evicted");
        Some(before.saturating_sub(database.used_memory()))
    }

    /// Removes every key of one database. Returns the number removed.
    pub fn flush_db(&self, db: usize) -> Result<usize, CommandError> {
        let mut locked = self.db(db)?.lock_all(true);
        locked.clear()
    }

    /// Removes every key of every database.
    pub fn flush_all(&self) -> usize {
        self.databases
            .iter()
            .filter_map(|db| db.lock_all(true).clear().ok())
            .sum()
    }

    /// Installs a key decoded from a snapshot.
    ///
    /// Keys whose deadline has passed are skipped. With `emit`, the key is
    /// re-emitted to the log as its reconstructive command plus `PEXPIREAT`,
    /// regardless of the loading flag. Returns `true` if the key was
    /// installed.
    pub fn restore(
        &self,
        db: usize,
        key: Bytes,
        entity: Entity,
        expire_at: Option<u64>,
        emit: bool,
    ) -> Result<bool, CommandError> {
        if matches!(expire_at, Some(at) if at <= unix_ms()) {
            return Ok(false);
        }
        let database = self.db(db)?;
        let mut locked = database.lock(&KeySpec::write(vec![key.clone()]));

        let record = emit.then(|| entity.to_command(&key));
        locked.put(key.clone(), entity)?;
        if let Some(at) = expire_at {
            locked.set_expire_at(&key, at)?;
            self.scheduler.schedule(db, key.clone(), at);
        }

        if let (Some(record), Some(persister)) = (record, self.persister()) {
            persister.add_aof(db, record);
            if let Some(at) = expire_at {
                persister.add_aof(db, expire_command(&key, at));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn keyspace() -> Keyspace {
        Keyspace::new(&Config::default())
    }

    fn put(ks: &Keyspace, k: &str, v: &str) {
        ks.db(0)
            .unwrap()
            .lock(&KeySpec::write(vec![key(k)]))
            .put(key(k), Entity::String(key(v)))
            .unwrap();
    }

    #[test]
    fn test_db_index_out_of_range() {
        let ks = keyspace();
        assert_eq!(ks.db_count(), 16);
        assert!(ks.db(15).is_ok());
        assert_eq!(ks.db(16).unwrap_err(), CommandError::DbIndexOutOfRange);
    }

    #[test]
    fn test_past_deadline_deletes_immediately() {
        let ks = keyspace();
        put(&ks, "a", "1");
        let db = ks.db(0).unwrap();
        let mut locked = db.lock(&KeySpec::write(vec![key("a")]));
        let outcome = ks.expire_locked(&mut locked, &key("a"), 1).unwrap();
        assert_eq!(outcome, ExpireOutcome::Deleted);
        assert!(!locked.contains(b"a").unwrap());
        drop(locked);
        assert_eq!(ks.stats().expired_keys(), 1);
    }

    #[test]
    fn test_expire_missing_key() {
        let ks = keyspace();
        let db = ks.db(0).unwrap();
        let mut locked = db.lock(&KeySpec::write(vec![key("a")]));
        let outcome = ks
            .expire_locked(&mut locked, &key("a"), unix_ms() + 10_000)
            .unwrap();
        assert_eq!(outcome, ExpireOutcome::Missing);
        assert_eq!(ks.scheduler().pending(), 0);
    }

    #[test]
    fn test_expire_key_checks_deadline() {
        let ks = keyspace();
        put(&ks, "a", "1");
        {
            let db = ks.db(0).unwrap();
            let mut locked = db.lock(&KeySpec::write(vec![key("a")]));
            ks.expire_locked(&mut locked, &key("a"), unix_ms() + 60_000)
                .unwrap();
        }
        // Deadline still in the future: the job is a no-op.
        assert!(!ks.expire_key(0, &key("a")));
        assert_eq!(ks.key_count(), 1);

        // A key without a deadline is never expired.
        put(&ks, "b", "2");
        assert!(!ks.expire_key(0, &key("b")));

        // Deadline moved into the past behind the scheduler's back.
        ks.db(0)
            .unwrap()
            .lock(&KeySpec::write(vec![key("a")]))
            .set_expire_at(&key("a"), 1)
            .unwrap();
        assert!(ks.expire_key(0, &key("a")));
        assert!(!ks.expire_key(0, &key("a")));
        assert_eq!(ks.key_count(), 1);
    }

    #[test]
    fn test_evict_key_reports_freed_bytes() {
        let ks = keyspace();
        put(&ks, "a", &"x".repeat(1000));
        let freed = ks.evict_key(0, &key("a")).unwrap();
        assert!(freed >= 1000);
        assert_eq!(ks.evict_key(0, &key("a")), None);
        assert_eq!(ks.stats().evicted_keys(), 1);
        assert_eq!(ks.used_memory(), 0);
    }

    /// Records, for every logged `DEL`, whether the key's shard was still
    /// write-locked when the record reached the log.
    struct DelLockCheck {
        keyspace: Arc<Keyspace>,
        seen: parking_lot::Mutex<Vec<bool>>,
    }

    impl crate::persistence::Listener for DelLockCheck {
        fn callback(&self, batch: &[CmdLine]) {
            for cmd in batch.iter().filter(|cmd| &cmd[0][..] == b"DEL") {
                let shard = Database::shard_index(&cmd[1]);
                let held = self.keyspace.databases()[0].shards[shard].is_locked_exclusive();
                self.seen.lock().push(held);
            }
        }
    }

    #[test]
    fn test_evict_key_logs_del_under_the_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            dir: dir.path().to_path_buf(),
            appendonly: true,
            appendfsync: crate::config::FsyncPolicy::Always,
            ..Config::default()
        };
        let ks = Arc::new(Keyspace::new(&config));
        let persister = Persister::open(&config).unwrap();
        let check = Arc::new(DelLockCheck {
            keyspace: Arc::clone(&ks),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        persister.register_listener(check.clone());
        ks.attach_persister(Arc::clone(&persister));

        put(&ks, "a", "1");
        ks.evict_key(0, &key("a")).unwrap();
        persister.close();

        assert_eq!(*check.seen.lock(), vec![true]);
    }

    #[test]
    fn test_restore_skips_expired() {
        let ks = keyspace();
        assert!(!ks
            .restore(0, key("old"), Entity::String(key("v")), Some(1), false)
            .unwrap());
        assert!(ks
            .restore(1, key("new"), Entity::String(key("v")), Some(unix_ms() + 60_000), false)
            .unwrap());
        assert_eq!(ks.key_count(), 1);
        assert_eq!(ks.db(1).unwrap().expiring_len(), 1);
        assert_eq!(ks.scheduler().pending(), 1);
        assert!(ks
            .restore(99, key("x"), Entity::String(key("v")), None, false)
            .is_err());
    }

    #[test]
    fn test_save_guard_is_exclusive() {
        let ks = keyspace();
        let guard = ks.begin_save().unwrap();
        assert!(ks.is_saving());
        assert!(ks.begin_save().is_none());
        drop(guard);
        assert!(!ks.is_saving());
        assert!(ks.begin_save().is_some());
    }

    #[test]
    fn test_flush() {
        let ks = keyspace();
        put(&ks, "a", "1");
        put(&ks, "b", "2");
        ks.restore(3, key("c"), Entity::String(key("v")), None, false)
            .unwrap();
        assert_eq!(ks.flush_db(0).unwrap(), 2);
        assert_eq!(ks.key_count(), 1);
        assert_eq!(ks.flush_all(), 1);
        assert_eq!(ks.key_count(), 0);
    }
}
