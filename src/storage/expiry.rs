//! Expiration Scheduler
//!
//! Keys with a TTL get a one-shot deletion job in a hierarchical timing wheel.
//! The wheel has four levels of 64 slots; a slot at level `l` covers `64^l`
//! ticks:
//!
//! ```text
//! level 3 │ 64 slots × 262144 ticks │  cascades into ─┐
//! level 2 │ 64 slots ×   4096 ticks │  cascades into ─┤
//! level 1 │ 64 slots ×     64 ticks │  cascades into ─┤
//! level 0 │ 64 slots ×      1 tick  │  fires  <───────┘
//! ```
//!
//! Scheduling and cancelling are O(1). When the wheel turns past a slot
//! boundary, the timers of the next higher-level slot are re-placed into the
//! lower levels. Deadlines beyond the top level wait in an overflow list.
//!
//! ## Keyed, lazily cancelled jobs
//!
//! Each key has at most one live job. Re-scheduling a key bumps its
//! generation, and the old job is dropped when its slot comes up. The job
//! itself carries no authority: when it fires, the keyspace re-reads the
//! deadline under the key's write lock and only deletes a key whose recorded
//! deadline has passed. A stale job for a deleted, re-written or persisted key
//! is therefore a no-op.
//!
//! ## No lazy expiration
//!
//! Reads never check deadlines. A key past its deadline stays visible until
//! the driver fires its job, which bounds the staleness window to one tick
//! plus driver latency.

use super::keyspace::Keyspace;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

/// Slots per wheel level.
pub const WHEEL_SLOTS: usize = 64;

/// Number of wheel levels.
pub const WHEEL_LEVELS: usize = 4;

const SLOT_BITS: u32 = 6;
const SLOT_MASK: u64 = (WHEEL_SLOTS - 1) as u64;

/// Current wall-clock time in unix milliseconds.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Ticks covered by one slot at `level`.
#[inline]
fn span(level: usize) -> u64 {
    1u64 << (SLOT_BITS * level as u32)
}

/// Identity of an expiration job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub db: usize,
    pub key: Bytes,
}

#[derive(Debug)]
struct Timer {
    key: TimerKey,
    generation: u64,
    deadline: u64,
}

/// Hierarchical timing wheel over abstract ticks.
#[derive(Debug)]
pub struct TimingWheel {
    levels: Vec<Vec<Vec<Timer>>>,
    overflow: Vec<Timer>,
    /// Timers scheduled at or before the current tick.
    ready: Vec<Timer>,
    current: u64,
    /// Generation of each key's live timer.
    live: HashMap<TimerKey, u64>,
    next_generation: u64,
}

impl TimingWheel {
    pub fn new(start_tick: u64) -> Self {
        Self {
            levels: (0..WHEEL_LEVELS)
                .map(|_| (0..WHEEL_SLOTS).map(|_| Vec::new()).collect())
                .collect(),
            overflow: Vec::new(),
            ready: Vec::new(),
            current: start_tick,
            live: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Schedules `key` to fire at `deadline`, replacing any earlier job for
    /// the same key.
    pub fn schedule(&mut self, key: TimerKey, deadline: u64) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(key.clone(), generation);
        self.place(Timer {
            key,
            generation,
            deadline,
        });
    }

    /// Cancels the live job of `key`. Returns `true` if there was one.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.live.remove(key).is_some()
    }

    fn place(&mut self, timer: Timer) {
        if timer.deadline <= self.current {
            self.ready.push(timer);
            return;
        }
        let delta = timer.deadline - self.current;
        for level in 0..WHEEL_LEVELS {
            if delta < span(level + 1) {
                let slot = ((timer.deadline >> (SLOT_BITS * level as u32)) & SLOT_MASK) as usize;
                self.levels[level][slot].push(timer);
                return;
            }
        }
        self.overflow.push(timer);
    }

    /// Turns the wheel up to `now` and returns the keys whose jobs fired.
    pub fn advance(&mut self, now: u64) -> Vec<TimerKey> {
        if self.live.is_empty() {
            // Only dead timers remain; drop them and jump ahead.
            if now > self.current {
                self.clear_slots();
                self.current = now;
            }
            return Vec::new();
        }

        let mut expired = std::mem::take(&mut self.ready);
        while self.current < now {
            self.current += 1;
            let tick = self.current;

            for level in 1..WHEEL_LEVELS {
                if tick % span(level) != 0 {
                    break;
                }
                let slot = ((tick >> (SLOT_BITS * level as u32)) & SLOT_MASK) as usize;
                for timer in std::mem::take(&mut self.levels[level][slot]) {
                    self.place(timer);
                }
            }
            if tick % span(WHEEL_LEVELS - 1) == 0 && !self.overflow.is_empty() {
                for timer in std::mem::take(&mut self.overflow) {
                    self.place(timer);
                }
            }

            let slot = (tick & SLOT_MASK) as usize;
            for timer in std::mem::take(&mut self.levels[0][slot]) {
                if timer.deadline <= tick {
                    expired.push(timer);
                } else {
                    self.place(timer);
                }
            }
            expired.append(&mut self.ready);
        }

        let mut fired = Vec::new();
        for timer in expired {
            if self.live.get(&timer.key) == Some(&timer.generation) {
                self.live.remove(&timer.key);
                fired.push(timer.key);
            }
        }
        fired
    }

    fn clear_slots(&mut self) {
        for level in &mut self.levels {
            for slot in level.iter_mut() {
                slot.clear();
            }
        }
        self.overflow.clear();
        self.ready.clear();
    }
}

/// Thread-safe wheel keyed by wall-clock deadlines in unix milliseconds.
#[derive(Debug)]
pub struct ExpiryScheduler {
    wheel: Mutex<TimingWheel>,
    tick_ms: u64,
}

impl ExpiryScheduler {
    pub fn new(tick: Duration) -> Self {
        let tick_ms = (tick.as_millis() as u64).max(1);
        Self {
            wheel: Mutex::new(TimingWheel::new(unix_ms() / tick_ms)),
            tick_ms,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Schedules the deletion of `key` at `deadline_ms`. The job never fires
    /// before the deadline.
    pub fn schedule(&self, db: usize, key: Bytes, deadline_ms: u64) {
        let tick = deadline_ms.div_ceil(self.tick_ms);
        self.wheel.lock().schedule(TimerKey { db, key }, tick);
    }

    pub fn cancel(&self, db: usize, key: &Bytes) -> bool {
        self.wheel.lock().cancel(&TimerKey {
            db,
            key: key.clone(),
        })
    }

    /// Number of scheduled jobs.
    pub fn pending(&self) -> usize {
        self.wheel.lock().len()
    }

    /// Advances to `now_ms` and returns the jobs that are due.
    pub fn take_due(&self, now_ms: u64) -> Vec<TimerKey> {
        self.wheel.lock().advance(now_ms / self.tick_ms)
    }
}

/// A handle to the running expiration driver.
///
/// When this handle is dropped, the driver task is stopped.
#[derive(Debug)]
pub struct ExpiryDriver {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpiryDriver {
    /// Starts the driver as a background task. It ticks at the scheduler's
    /// resolution and runs every due job through the keyspace's delete path.
    pub fn start(keyspace: Arc<Keyspace>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(driver_loop(keyspace, shutdown_rx));

        info!("Expiration driver started");

        Self { shutdown_tx }
    }

    /// Stops the driver.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        debug!("Expiration driver stopped");
    }
}

impl Drop for ExpiryDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn driver_loop(keyspace: Arc<Keyspace>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(keyspace.scheduler().tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiration driver received shutdown signal");
                    return;
                }
            }
        }

        let due = keyspace.scheduler().take_due(unix_ms());
        if due.is_empty() {
            continue;
        }

        let mut expired = 0usize;
        for timer in due {
            let job = AssertUnwindSafe(|| keyspace.expire_key(timer.db, &timer.key));
            match catch_unwind(job) {
                Ok(true) => expired += 1,
                Ok(false) => trace!(db = timer.db, "Stale expiration job skipped"),
                Err(_) => error!(
                    db = timer.db,
                    key = %String::from_utf8_lossy(&timer.key),
                    "Expiration job panicked"
                ),
            }
        }

        if expired > 0 {
            debug!(
                expired = expired,
                pending = keyspace.scheduler().pending(),
                "Expired keys deleted"
            );
        }
    }
}
