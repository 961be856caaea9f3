//! Persistence Module
//!
//! Durability for the keyspace: the append-only log with its online rewrite,
//! and the binary snapshot codec.
//!
//! ## Startup recovery
//!
//! ```text
//!  appendonly?
//!     ├── yes ── log file non-empty? ── yes ── replay log (preamble + records)
//!     │                              └─ no ─── load snapshot, re-emit keys
//!     │                                        into the freshly opened log
//!     └── no ─── load snapshot
//! ```
//!
//! A missing file means a fresh start. A corrupt snapshot or preamble is an
//! error: starting empty would silently drop data that is still on disk.

pub mod aof;
pub mod rewrite;
pub mod snapshot;

pub use aof::{replay, replay_bytes, Listener, Persister, PersisterState, ReplayStats, AOF_QUEUE_SIZE};
pub use rewrite::RewriteContext;
pub use snapshot::{SnapshotInfo, SnapshotRecord};

use crate::error::PersistResult;
use crate::storage::Keyspace;
use std::fs::{self, OpenOptions};
use std::sync::Arc;
use tracing::{info, warn};

/// Restores `keyspace` from disk and, when the log is enabled, opens it and
/// attaches the persister.
pub fn recover(keyspace: &Keyspace) -> PersistResult<Option<Arc<Persister>>> {
    let config = keyspace.config().clone();

    if !config.appendonly {
        snapshot::load(&config.snapshot_path(), keyspace, false)?;
        return Ok(None);
    }

    let path = config.aof_path();
    let has_log = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

    if has_log {
        let stats = replay(&path, keyspace, None)?;
        info!(
            path = %path.display(),
            commands = stats.commands,
            preamble_keys = stats.preamble_keys,
            skipped = stats.skipped,
            keys = keyspace.key_count(),
            "Append-only log replayed"
        );
        if let Some(offset) = stats.truncated_at {
            warn!(offset, "Truncating incomplete record at the end of the append-only log");
            OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(offset as u64)?;
        }
    }

    let persister = Persister::open(&config)?;
    keyspace.attach_persister(Arc::clone(&persister));

    if !has_log {
        snapshot::load(&config.snapshot_path(), keyspace, true)?;
    }

    Ok(Some(persister))
}
