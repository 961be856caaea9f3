//! Lock Coordinator
//!
//! Commands declare up front which keys they read and which they write (a
//! [`KeySpec`]). The coordinator turns that declaration into shard locks:
//!
//! ```text
//!  KeySpec { write: [b, a], read: [c, a] }
//!        │
//!        ▼  map keys to shards, dedupe, write wins over read
//!  { 3: Write, 17: Write, 40: Read }
//!        │
//!        ▼  acquire in ascending shard order
//!  LockedDb ── command body runs here ── drop: release in reverse order
//! ```
//!
//! Acquiring in ascending shard order makes the acquisition order independent
//! of argument order, so two commands naming the same keys in different order
//! cannot deadlock.
//!
//! [`LockedDb`] is the only way to read or mutate a database. It refuses to
//! touch a key whose shard was not declared, and it keeps the data map, the
//! expiration map and the key index consistent: every removal clears all
//! three under the shard's write lock.

use super::db::{entry_size, Database, Shard, NUM_SHARDS};
use super::descriptor::{now_minutes, KeyDescriptor};
use super::entity::{DataType, Entity};
use crate::error::CommandError;
use bytes::Bytes;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};

/// Keys a command reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpec {
    pub read: Vec<Bytes>,
    pub write: Vec<Bytes>,
}

impl KeySpec {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read(keys: Vec<Bytes>) -> Self {
        Self {
            read: keys,
            write: Vec::new(),
        }
    }

    pub fn write(keys: Vec<Bytes>) -> Self {
        Self {
            read: Vec::new(),
            write: keys,
        }
    }

    /// Shards to lock, ascending, with `true` for exclusive access.
    pub fn lock_plan(&self) -> Vec<(usize, bool)> {
        let mut plan: BTreeMap<usize, bool> = BTreeMap::new();
        for key in &self.write {
            plan.insert(Database::shard_index(key), true);
        }
        for key in &self.read {
            plan.entry(Database::shard_index(key)).or_insert(false);
        }
        plan.into_iter().collect()
    }
}

enum ShardGuard<'a> {
    Read(RwLockReadGuard<'a, Shard>),
    Write(RwLockWriteGuard<'a, Shard>),
}

impl ShardGuard<'_> {
    fn shard(&self) -> &Shard {
        match self {
            ShardGuard::Read(g) => &**g,
            ShardGuard::Write(g) => &**g,
        }
    }
}

impl Database {
    /// Locks the shards of the declared keys.
    pub fn lock(&self, spec: &KeySpec) -> LockedDb<'_> {
        let guards = spec
            .lock_plan()
            .into_iter()
            .map(|(idx, exclusive)| (idx, self.lock_shard(idx, exclusive)))
            .collect();
        LockedDb::new(self, guards)
    }

    /// Locks every shard, for whole-database operations (FLUSHDB, snapshots).
    pub fn lock_all(&self, exclusive: bool) -> LockedDb<'_> {
        let guards = (0..NUM_SHARDS)
            .map(|idx| (idx, self.lock_shard(idx, exclusive)))
            .collect();
        LockedDb::new(self, guards)
    }

    fn lock_shard(&self, idx: usize, exclusive: bool) -> ShardGuard<'_> {
        if exclusive {
            ShardGuard::Write(self.shards[idx].write())
        } else {
            ShardGuard::Read(self.shards[idx].read())
        }
    }
}

/// A database view holding the locks of one command.
pub struct LockedDb<'a> {
    db: &'a Database,
    /// Sorted by shard index.
    guards: Vec<(usize, ShardGuard<'a>)>,
    /// Keys handed out mutably, with their accounted size at that moment.
    dirty: HashMap<Bytes, usize>,
    now: u16,
}

impl<'a> LockedDb<'a> {
    fn new(db: &'a Database, guards: Vec<(usize, ShardGuard<'a>)>) -> Self {
        Self {
            db,
            guards,
            dirty: HashMap::new(),
            now: now_minutes(),
        }
    }

    pub fn db_index(&self) -> usize {
        self.db.index()
    }

    fn slot(&self, key: &[u8]) -> Result<usize, CommandError> {
        let shard = Database::shard_index(key);
        self.guards
            .binary_search_by_key(&shard, |(idx, _)| *idx)
            .map_err(|_| {
                CommandError::Internal(format!(
                    "key '{}' was not declared by the command",
                    String::from_utf8_lossy(key)
                ))
            })
    }

    fn shard(&self, key: &[u8]) -> Result<&Shard, CommandError> {
        let slot = self.slot(key)?;
        Ok(self.guards[slot].1.shard())
    }

    fn shard_mut(&mut self, key: &[u8]) -> Result<&mut Shard, CommandError> {
        let slot = self.slot(key)?;
        match &mut self.guards[slot].1 {
            ShardGuard::Write(g) => Ok(&mut **g),
            ShardGuard::Read(_) => Err(CommandError::Internal(format!(
                "key '{}' was declared read-only",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn touch(&self, key: &[u8]) {
        if let Some(desc) = self.db.key_index.lock().get_mut(key) {
            desc.touch(self.now, &self.db.lfu, &mut rand::thread_rng());
        }
    }

    /// Accounts for in-place changes made through [`get_mut`](Self::get_mut).
    fn settle(&mut self, key: &[u8]) {
        let Some(before) = self.dirty.remove(key) else {
            return;
        };
        let db = self.db;
        if let Ok(shard) = self.shard(key) {
            let after = shard.data.get(key).map(|e| entry_size(key, e)).unwrap_or(0);
            db.adjust_memory(after as i64 - before as i64);
        }
    }

    /// Looks up a key and records the access.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<&Entity>, CommandError> {
        if !self.shard(key)?.data.contains_key(key) {
            return Ok(None);
        }
        self.touch(key);
        Ok(self.shard(key)?.data.get(key))
    }

    /// Looks up a key without recording an access.
    pub fn peek(&self, key: &[u8]) -> Result<Option<&Entity>, CommandError> {
        Ok(self.shard(key)?.data.get(key))
    }

    /// Looks up a key for in-place modification and records the access.
    pub fn get_mut(&mut self, key: &Bytes) -> Result<Option<&mut Entity>, CommandError> {
        let size = match self.shard_mut(key)?.data.get(key) {
            Some(entity) => entry_size(key, entity),
            None => return Ok(None),
        };
        self.dirty.entry(key.clone()).or_insert(size);
        self.touch(key);
        Ok(self.shard_mut(key)?.data.get_mut(key))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, CommandError> {
        Ok(self.shard(key)?.data.contains_key(key))
    }

    pub fn data_type(&self, key: &[u8]) -> Result<Option<DataType>, CommandError> {
        Ok(self.shard(key)?.data.get(key).map(Entity::data_type))
    }

    /// Stores a value, keeping any existing deadline.
    ///
    /// Returns `true` if the key did not exist before.
    pub fn put(&mut self, key: Bytes, entity: Entity) -> Result<bool, CommandError> {
        self.settle(&key);
        let db = self.db;
        let now = self.now;
        let data_type = entity.data_type();
        let new_size = entry_size(&key, &entity);

        let old = self.shard_mut(&key)?.data.insert(key.clone(), entity);
        let old_size = old.as_ref().map(|e| entry_size(&key, e)).unwrap_or(0);
        db.adjust_memory(new_size as i64 - old_size as i64);

        let mut index = db.key_index.lock();
        match index.get_mut(&key) {
            Some(desc) => {
                desc.set_data_type(data_type);
                desc.touch(now, &db.lfu, &mut rand::thread_rng());
            }
            None => {
                index.insert(key, KeyDescriptor::new(data_type, now));
            }
        }
        Ok(old.is_none())
    }

    /// Removes a key from the data map, the expiration map and the key index.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Entity>, CommandError> {
        self.settle(key);
        let db = self.db;
        let shard = self.shard_mut(key)?;
        let removed = shard.data.remove(key);
        shard.expires.remove(key);
        if let Some(entity) = &removed {
            db.adjust_memory(-(entry_size(key, entity) as i64));
            db.key_index.lock().remove(key);
        }
        Ok(removed)
    }

    /// Deadline of a key in unix milliseconds.
    pub fn expire_at(&self, key: &[u8]) -> Result<Option<u64>, CommandError> {
        Ok(self.shard(key)?.expires.get(key).copied())
    }

    /// Records a deadline. Returns `false` if the key does not exist.
    ///
    /// This only updates the expiration map; scheduling the deletion is the
    /// caller's job.
    pub fn set_expire_at(&mut self, key: &Bytes, at_ms: u64) -> Result<bool, CommandError> {
        let shard = self.shard_mut(key)?;
        if !shard.data.contains_key(key) {
            return Ok(false);
        }
        shard.expires.insert(key.clone(), at_ms);
        Ok(true)
    }

    /// Drops a key's deadline. Returns `true` if one was set.
    pub fn clear_expire(&mut self, key: &[u8]) -> Result<bool, CommandError> {
        Ok(self.shard_mut(key)?.expires.remove(key).is_some())
    }

    /// Removes every key. Requires [`Database::lock_all`] with exclusive access.
    pub fn clear(&mut self) -> Result<usize, CommandError> {
        if self.guards.len() != NUM_SHARDS {
            return Err(CommandError::Internal(
                "clear requires every shard to be locked".to_string(),
            ));
        }
        let mut removed = 0;
        for (_, guard) in self.guards.iter_mut() {
            match guard {
                ShardGuard::Write(shard) => {
                    removed += shard.data.len();
                    shard.data.clear();
                    shard.expires.clear();
                }
                ShardGuard::Read(_) => {
                    return Err(CommandError::Internal(
                        "clear requires exclusive locks".to_string(),
                    ))
                }
            }
        }
        self.dirty.clear();
        self.db.key_index.lock().clear();
        self.db.reset_memory();
        Ok(removed)
    }

    /// Visits every key held by the locked shards, with its deadline.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Bytes, &Entity, Option<u64>),
    {
        for (_, guard) in &self.guards {
            let shard = guard.shard();
            for (key, entity) in &shard.data {
                f(key, entity, shard.expires.get(key).copied());
            }
        }
    }

    /// Settles memory for mutated keys and removes emptied collections.
    fn finish(&mut self) {
        let dirty: Vec<Bytes> = self.dirty.keys().cloned().collect();
        for key in dirty {
            self.settle(&key);
            let emptied = matches!(self.peek(&key), Ok(Some(e)) if e.is_empty_collection());
            if emptied {
                let _ = self.remove(&key);
            }
        }
    }
}

impl Drop for LockedDb<'_> {
    fn drop(&mut self) {
        self.finish();
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::descriptor::LfuPolicy;
    use std::collections::VecDeque;
    use std::sync::{Arc, Barrier};
    use std::time::{Duration, Instant};

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    /// Finds two keys living in different shards.
    fn keys_in_distinct_shards() -> (Bytes, Bytes) {
        let a = key("a");
        let shard_a = Database::shard_index(&a);
        let b = (0..)
            .map(|i| key(&format!("b{}", i)))
            .find(|k| Database::shard_index(k) != shard_a)
            .unwrap();
        (a, b)
    }

    #[test]
    fn test_lock_plan_is_sorted_and_write_wins() {
        let (a, b) = keys_in_distinct_shards();
        let spec = KeySpec {
            read: vec![a.clone(), b.clone()],
            write: vec![b.clone()],
        };
        let plan = spec.lock_plan();
        assert_eq!(plan.len(), 2);
        assert!(plan[0].0 < plan[1].0);
        let b_entry = plan
            .iter()
            .find(|(idx, _)| *idx == Database::shard_index(&b))
            .unwrap();
        assert!(b_entry.1);

        let reversed = KeySpec {
            read: vec![b, a],
            write: vec![],
        };
        assert_eq!(
            reversed.lock_plan().iter().map(|p| p.0).collect::<Vec<_>>(),
            plan.iter().map(|p| p.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_undeclared_key_is_an_error() {
        let db = Database::new(0, LfuPolicy::default());
        let (a, b) = keys_in_distinct_shards();
        let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
        assert!(locked.put(a, Entity::String(key("1"))).is_ok());
        assert!(matches!(
            locked.put(b, Entity::String(key("2"))),
            Err(CommandError::Internal(_))
        ));
    }

    #[test]
    fn test_read_lock_refuses_writes() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("a");
        let mut locked = db.lock(&KeySpec::read(vec![a.clone()]));
        assert_eq!(locked.get(&a).unwrap(), None);
        assert!(matches!(
            locked.put(a, Entity::String(key("1"))),
            Err(CommandError::Internal(_))
        ));
    }

    #[test]
    fn test_remove_clears_all_three_structures() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("a");
        let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
        locked.put(a.clone(), Entity::String(key("1"))).unwrap();
        assert!(locked.set_expire_at(&a, u64::MAX).unwrap());
        drop(locked);
        assert!(db.descriptor(&a).is_some());

        let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
        assert!(locked.remove(&a).unwrap().is_some());
        assert_eq!(locked.expire_at(&a).unwrap(), None);
        drop(locked);
        assert!(db.descriptor(&a).is_none());
        assert_eq!(db.expiring_len(), 0);
    }

    #[test]
    fn test_expire_requires_existing_key() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("a");
        let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
        assert!(!locked.set_expire_at(&a, 1).unwrap());
        assert_eq!(locked.expire_at(&a).unwrap(), None);
    }

    #[test]
    fn test_get_touches_descriptor() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("a");
        db.lock(&KeySpec::write(vec![a.clone()]))
            .put(a.clone(), Entity::String(key("1")))
            .unwrap();
        let before = db.descriptor(&a).unwrap().ref_count();
        db.lock(&KeySpec::read(vec![a.clone()])).get(&a).unwrap();
        assert_eq!(db.descriptor(&a).unwrap().ref_count(), before + 1);

        db.lock(&KeySpec::read(vec![a.clone()])).peek(&a).unwrap();
        assert_eq!(db.descriptor(&a).unwrap().ref_count(), before + 1);
    }

    #[test]
    fn test_emptied_collection_is_removed() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("list");
        {
            let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
            let items: VecDeque<Bytes> = vec![key("x")].into();
            locked.put(a.clone(), Entity::List(items)).unwrap();
        }
        {
            let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
            let list = locked.get_mut(&a).unwrap().unwrap().as_list_mut().unwrap();
            list.pop_front();
        }
        assert!(db.is_empty());
        assert_eq!(db.used_memory(), 0);
    }

    #[test]
    fn test_in_place_growth_is_accounted() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("list");
        {
            let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
            locked
                .put(a.clone(), Entity::List(vec![key("x")].into()))
                .unwrap();
        }
        let before = db.used_memory();
        {
            let mut locked = db.lock(&KeySpec::write(vec![a.clone()]));
            let list = locked.get_mut(&a).unwrap().unwrap().as_list_mut().unwrap();
            list.push_back(Bytes::from(vec![0u8; 500]));
        }
        assert!(db.used_memory() >= before + 500);
        assert_eq!(db.used_memory(), db.recompute_memory());
    }

    #[test]
    fn test_clear_requires_full_lock() {
        let db = Database::new(0, LfuPolicy::default());
        let a = key("a");
        let mut partial = db.lock(&KeySpec::write(vec![a.clone()]));
        assert!(partial.clear().is_err());
        partial.put(a, Entity::String(key("1"))).unwrap();
        drop(partial);

        let mut all = db.lock_all(true);
        assert_eq!(all.clear().unwrap(), 1);
        drop(all);
        assert!(db.is_empty());
    }

    #[test]
    fn test_disjoint_writers_run_concurrently() {
        let db = Arc::new(Database::new(0, LfuPolicy::default()));
        let (a, b) = keys_in_distinct_shards();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|k| {
                let db = Arc::clone(&db);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let _locked = db.lock(&KeySpec::write(vec![k]));
                    // Both threads must hold their lock at the same time to
                    // get past the barrier.
                    barrier.wait();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_same_key_writers_are_serialized() {
        let db = Arc::new(Database::new(0, LfuPolicy::default()));
        let k = key("counter");
        db.lock(&KeySpec::write(vec![k.clone()]))
            .put(k.clone(), Entity::String(key("0")))
            .unwrap();

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                let k = k.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let mut locked = db.lock(&KeySpec::write(vec![k.clone()]));
                        let value = locked.get(&k).unwrap().unwrap().as_string().unwrap().clone();
                        let n: u64 = std::str::from_utf8(&value).unwrap().parse().unwrap();
                        locked
                            .put(k.clone(), Entity::String(Bytes::from((n + 1).to_string())))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(30));

        let mut locked = db.lock(&KeySpec::read(vec![k.clone()]));
        let value = locked.get(&k).unwrap().unwrap().as_string().unwrap().clone();
        assert_eq!(value, Bytes::from("1000"));
    }
}
