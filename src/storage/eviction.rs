//! Eviction Policy (approximated LFU)
//!
//! When the keyspace's reported memory exceeds `maxmemory`, keys are evicted
//! by approximated LFU:
//!
//! 1. From every database, sample a few keys at stratified random positions
//!    of the ordered key index.
//! 2. Score each sample by idleness: `255 - decayed counter`.
//! 3. Merge the samples into a small pool kept sorted by idleness, which
//!    retains the most idle candidates seen so far.
//! 4. Delete candidates from the most idle end, through the normal delete
//!    path (so a `DEL` reaches the log), until memory is under the ceiling.
//! 5. Re-measure memory exactly and repeat while still over.
//!
//! A pass that evicts nothing counts as a failed attempt; after
//! [`EVICTION_MAX_ATTEMPTS`] failures the loop gives up so it can never spin.
//!
//! The [`MemorySampler`] background task periodically re-measures memory and
//! runs the same loop, so memory is reclaimed even when no writes arrive.

use super::descriptor::{now_minutes, KeyDescriptor};
use super::keyspace::Keyspace;
use bytes::Bytes;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Capacity of the candidate pool.
pub const EVPOOL_SIZE: usize = 16;

/// Consecutive passes without progress before eviction gives up.
pub const EVICTION_MAX_ATTEMPTS: usize = 8;

/// A key considered for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: Bytes,
    pub idle: u8,
    pub db: usize,
}

/// Fixed-capacity pool of candidates sorted ascending by idle score.
#[derive(Debug, Default)]
pub struct EvictionPool {
    entries: Vec<EvictionCandidate>,
}

impl EvictionPool {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(EVPOOL_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offers a candidate. Returns `true` if the pool kept it.
    ///
    /// A full pool makes room by dropping its least idle entry, and ignores
    /// candidates that are not more idle than that entry.
    pub fn insert(&mut self, candidate: EvictionCandidate) -> bool {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|c| c.db == candidate.db && c.key == candidate.key)
        {
            self.entries.remove(pos);
        }

        if self.entries.len() >= EVPOOL_SIZE {
            if candidate.idle <= self.entries[0].idle {
                return false;
            }
            self.entries.remove(0);
        }

        let pos = self.entries.partition_point(|c| c.idle <= candidate.idle);
        self.entries.insert(pos, candidate);
        true
    }

    /// Removes and returns the most idle candidate.
    pub fn pop_most_idle(&mut self) -> Option<EvictionCandidate> {
        self.entries.pop()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvictionCandidate> {
        self.entries.iter()
    }
}

/// Picks up to `count` keys at stratified random positions of `index`.
///
/// The index is split into `count` equal ranges and one position is drawn
/// from each, so the sample spreads over the whole key space with one walk.
pub fn sample_keys<R: Rng + ?Sized>(
    index: &BTreeMap<Bytes, KeyDescriptor>,
    count: usize,
    rng: &mut R,
) -> Vec<(Bytes, KeyDescriptor)> {
    let len = index.len();
    if len == 0 || count == 0 {
        return Vec::new();
    }
    if len <= count {
        return index.iter().map(|(k, d)| (k.clone(), d.clone())).collect();
    }

    let positions: Vec<usize> = (0..count)
        .map(|i| {
            let lo = i * len / count;
            let hi = (i + 1) * len / count;
            rng.gen_range(lo..hi)
        })
        .collect();

    let mut picked = Vec::with_capacity(count);
    let mut wanted = positions.into_iter().peekable();
    for (pos, (key, desc)) in index.iter().enumerate() {
        match wanted.peek() {
            Some(&next) if next == pos => {
                picked.push((key.clone(), desc.clone()));
                wanted.next();
            }
            Some(_) => {}
            None => break,
        }
    }
    picked
}

/// Samples every database into `pool`.
fn populate_pool(keyspace: &Keyspace, pool: &mut EvictionPool, samples: usize) {
    let now = now_minutes();
    let mut rng = rand::thread_rng();
    for db in keyspace.databases() {
        let sampled = {
            let index = db.key_index.lock();
            sample_keys(&index, samples, &mut rng)
        };
        for (key, desc) in sampled {
            pool.insert(EvictionCandidate {
                key,
                idle: desc.idle_score(now, db.lfu.decay_time),
                db: db.index(),
            });
        }
    }
}

/// Evicts keys until reported memory is at or under `maxmemory`.
///
/// Returns `true` if memory is under the ceiling on return. Never evicts when
/// eviction is disabled, the keyspace is loading, or memory is already under
/// the ceiling.
pub fn free_memory_if_needed(keyspace: &Keyspace) -> bool {
    let limit = keyspace.maxmemory();
    if limit == 0 || keyspace.is_loading() {
        return true;
    }
    let limit = limit as usize;
    if keyspace.used_memory() <= limit {
        return true;
    }

    let samples = keyspace.maxmemory_samples();
    let mut pool = EvictionPool::new();
    let mut failed_attempts = 0;
    let mut evicted_total = 0usize;
    let mut freed_total = 0usize;

    while keyspace.used_memory() > limit {
        populate_pool(keyspace, &mut pool, samples);

        let mut evicted = 0;
        while keyspace.used_memory() > limit {
            let Some(candidate) = pool.pop_most_idle() else {
                break;
            };
            if let Some(freed) = keyspace.evict_key(candidate.db, &candidate.key) {
                evicted += 1;
                freed_total += freed;
            }
        }
        evicted_total += evicted;

        keyspace.recompute_memory();

        if evicted == 0 {
            failed_attempts += 1;
            if failed_attempts >= EVICTION_MAX_ATTEMPTS {
                warn!(
                    used_memory = keyspace.used_memory(),
                    maxmemory = limit,
                    "Eviction made no progress, giving up"
                );
                return keyspace.used_memory() <= limit;
            }
        } else {
            failed_attempts = 0;
        }
    }

    debug!(
        evicted = evicted_total,
        freed_bytes = freed_total,
        used_memory = keyspace.used_memory(),
        "Eviction pass finished"
    );
    true
}

/// A handle to the running memory sampler.
///
/// When this handle is dropped, the sampler task is stopped.
#[derive(Debug)]
pub struct MemorySampler {
    shutdown_tx: watch::Sender<bool>,
}

impl MemorySampler {
    /// Starts the sampler as a background task.
    ///
    /// # Arguments
    ///
    /// * `keyspace` - The keyspace to measure
    /// * `interval` - Time between measurements
    pub fn start(keyspace: Arc<Keyspace>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sampler_loop(keyspace, interval, shutdown_rx));

        info!(interval_ms = interval.as_millis() as u64, "Memory sampler started");

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        debug!("Memory sampler stopped");
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sampler_loop(
    keyspace: Arc<Keyspace>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let used = keyspace.recompute_memory();
        debug!(
            used_memory = used,
            keys = keyspace.key_count(),
            "Memory sampled"
        );

        if keyspace.maxmemory() > 0 && used > keyspace.maxmemory() as usize {
            let keyspace = Arc::clone(&keyspace);
            let result = tokio::task::spawn_blocking(move || free_memory_if_needed(&keyspace)).await;
            if let Ok(false) = result {
                warn!("Memory is still above maxmemory after eviction");
            }
        }
    }
}
