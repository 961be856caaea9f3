//! Database Tables
//!
//! A [`Database`] holds three structures that always agree with each other:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Database                               │
//! │                                                                  │
//! │  shards: 64 × RwLock<Shard>          key_index: Mutex<BTreeMap>   │
//! │  ┌───────────────┐ ┌───────────────┐  ┌────────────────────────┐ │
//! │  │ data:    k→v  │ │ data:    k→v  │  │ key → KeyDescriptor     │ │
//! │  │ expires: k→ms │ │ expires: k→ms │  │ (ordered, for KEYS and  │ │
//! │  └───────────────┘ └───────────────┘  │  eviction sampling)     │ │
//! │        ...               ...          └────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A key's value and its deadline live in the same shard, so one shard lock
//! guards both. The key index is a separate ordered map behind a mutex that
//! is only ever taken *after* shard locks and held briefly, never across
//! another lock acquisition.
//!
//! All mutation goes through a [`LockedDb`](super::lock::LockedDb) obtained
//! from the lock coordinator; this module only exposes whole-table reads.

use super::descriptor::{KeyDescriptor, LfuPolicy};
use super::entity::{Entity, KEY_OVERHEAD};
use super::glob::GlobPattern;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};

/// Number of shards per database.
pub const NUM_SHARDS: usize = 64;

/// One shard of a database: values and deadlines (unix ms) for its keys.
#[derive(Debug, Default)]
pub struct Shard {
    pub(crate) data: HashMap<Bytes, Entity>,
    pub(crate) expires: HashMap<Bytes, u64>,
}

/// One logical database.
pub struct Database {
    index: usize,
    pub(crate) shards: Vec<RwLock<Shard>>,
    pub(crate) key_index: Mutex<BTreeMap<Bytes, KeyDescriptor>>,
    used_memory: AtomicI64,
    pub(crate) lfu: LfuPolicy,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("index", &self.index)
            .field("keys", &self.len())
            .field("used_memory", &self.used_memory())
            .finish()
    }
}

/// Accounted size of one key and its value.
#[inline]
pub(crate) fn entry_size(key: &[u8], entity: &Entity) -> usize {
    key.len() + KEY_OVERHEAD + entity.memory_size()
}

impl Database {
    pub fn new(index: usize, lfu: LfuPolicy) -> Self {
        Self {
            index,
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(Shard::default())).collect(),
            key_index: Mutex::new(BTreeMap::new()),
            used_memory: AtomicI64::new(0),
            lfu,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Determines which shard a key belongs to.
    #[inline]
    pub fn shard_index(key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.key_index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_index.lock().is_empty()
    }

    /// Number of keys with a deadline.
    pub fn expiring_len(&self) -> usize {
        self.shards.iter().map(|s| s.read().expires.len()).sum()
    }

    /// Estimated memory used by keys and values.
    pub fn used_memory(&self) -> usize {
        self.used_memory.load(Ordering::Relaxed).max(0) as usize
    }

    pub(crate) fn adjust_memory(&self, delta: i64) {
        if delta != 0 {
            self.used_memory.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset_memory(&self) {
        self.used_memory.store(0, Ordering::Relaxed);
    }

    /// Re-measures every shard and replaces the running estimate.
    ///
    /// Shards are measured one at a time, so concurrent writers are only
    /// blocked for one shard's worth of work.
    pub fn recompute_memory(&self) -> usize {
        let total: usize = self
            .shards
            .iter()
            .map(|shard| {
                let shard = shard.read();
                shard
                    .data
                    .iter()
                    .map(|(k, v)| entry_size(k, v))
                    .sum::<usize>()
            })
            .sum();
        self.used_memory.store(total as i64, Ordering::Relaxed);
        total
    }

    /// Keys matching a glob pattern, in key order.
    pub fn keys_matching(&self, pattern: &[u8]) -> Vec<Bytes> {
        let glob = GlobPattern::new(pattern);
        let index = self.key_index.lock();
        if glob.is_match_all() {
            return index.keys().cloned().collect();
        }
        index
            .keys()
            .filter(|k| glob.matches(k))
            .cloned()
            .collect()
    }

    /// Copy of a key's descriptor, if the key exists.
    pub fn descriptor(&self, key: &[u8]) -> Option<KeyDescriptor> {
        self.key_index.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::lock::KeySpec;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_shard_index_is_stable() {
        let a = Database::shard_index(b"user:1");
        assert_eq!(a, Database::shard_index(b"user:1"));
        assert!(a < NUM_SHARDS);
    }

    #[test]
    fn test_keys_matching_in_order() {
        let db = Database::new(0, LfuPolicy::default());
        {
            let mut locked = db.lock_all(true);
            for k in ["user:2", "user:1", "session:1"] {
                locked.put(key(k), Entity::String(key("v"))).unwrap();
            }
        }
        assert_eq!(db.keys_matching(b"user:*"), vec![key("user:1"), key("user:2")]);
        assert_eq!(db.keys_matching(b"*").len(), 3);
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn test_memory_tracks_puts_and_removes() {
        let db = Database::new(0, LfuPolicy::default());
        let k = key("k");
        {
            let mut locked = db.lock(&KeySpec::write(vec![k.clone()]));
            locked.put(k.clone(), Entity::String(Bytes::from(vec![0u8; 1000]))).unwrap();
        }
        let after_put = db.used_memory();
        assert!(after_put >= 1000);
        assert_eq!(after_put, db.recompute_memory());

        {
            let mut locked = db.lock(&KeySpec::write(vec![k.clone()]));
            locked.remove(&k).unwrap();
        }
        assert_eq!(db.used_memory(), 0);
        assert_eq!(db.recompute_memory(), 0);
    }
}
