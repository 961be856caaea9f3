//! Per-key metadata and the approximated LFU counter.
//!
//! Every key has a [`KeyDescriptor`] in its database's ordered key index. The
//! descriptor carries the type tag, an access count and a packed LFU word:
//!
//! ```text
//!  31        24 23                          8 7               0
//! ┌────────────┬─────────────────────────────┬─────────────────┐
//! │  unused    │ last access, minutes % 2^16 │ log counter 0-255│
//! └────────────┴─────────────────────────────┴─────────────────┘
//! ```
//!
//! The counter is logarithmic: each access increments it with probability
//! `1 / ((counter - LFU_INIT_VAL) * log_factor + 1)`, and it loses one point
//! per `decay_time` minutes of idleness. Callers never touch the raw bits.

use super::entity::DataType;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Counter value given to newly created keys, so they are not evicted
/// before they have a chance to be accessed.
pub const LFU_INIT_VAL: u8 = 5;

/// Largest counter value.
pub const LFU_COUNTER_MAX: u8 = u8::MAX;

const COUNTER_MASK: u32 = 0xFF;
const MINUTES_SHIFT: u32 = 8;
const MINUTES_MASK: u32 = 0xFFFF;

/// Tuning knobs of the LFU counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfuPolicy {
    /// Higher values make the counter saturate more slowly
    pub log_factor: u32,
    /// Minutes of idleness per decrement, 0 disables decay
    pub decay_time: u32,
}

impl Default for LfuPolicy {
    fn default() -> Self {
        Self {
            log_factor: 10,
            decay_time: 1,
        }
    }
}

/// Current wall-clock time in minutes, truncated to 16 bits.
pub fn now_minutes() -> u16 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ((secs / 60) & MINUTES_MASK as u64) as u16
}

/// Minutes elapsed between two 16-bit minute stamps, handling wraparound.
#[inline]
pub fn elapsed_minutes(now: u16, then: u16) -> u16 {
    now.wrapping_sub(then)
}

/// Applies idle decay to `counter`.
pub fn decay_counter(counter: u8, elapsed: u16, decay_time: u32) -> u8 {
    if decay_time == 0 {
        return counter;
    }
    let periods = elapsed as u32 / decay_time;
    counter.saturating_sub(periods.min(u8::MAX as u32) as u8)
}

/// Probabilistic logarithmic increment.
pub fn log_incr<R: Rng + ?Sized>(counter: u8, log_factor: u32, rng: &mut R) -> u8 {
    if counter == LFU_COUNTER_MAX {
        return counter;
    }
    let baseval = counter.saturating_sub(LFU_INIT_VAL) as f64;
    let p = 1.0 / (baseval * log_factor as f64 + 1.0);
    if rng.gen::<f64>() < p {
        counter + 1
    } else {
        counter
    }
}

/// Metadata kept for every key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    data_type: DataType,
    lfu: u32,
    ref_count: u64,
}

impl KeyDescriptor {
    /// Creates the descriptor for a freshly written key.
    pub fn new(data_type: DataType, now: u16) -> Self {
        Self {
            data_type,
            lfu: pack(now, LFU_INIT_VAL),
            ref_count: 0,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn set_data_type(&mut self, data_type: DataType) {
        self.data_type = data_type;
    }

    /// Raw counter, without decay applied.
    pub fn counter(&self) -> u8 {
        (self.lfu & COUNTER_MASK) as u8
    }

    /// Minute stamp of the last access.
    pub fn access_minutes(&self) -> u16 {
        ((self.lfu >> MINUTES_SHIFT) & MINUTES_MASK) as u16
    }

    /// Number of recorded accesses.
    pub fn ref_count(&self) -> u64 {
        self.ref_count
    }

    /// Counter with idle decay applied as of `now`. Does not modify the
    /// descriptor.
    pub fn decayed_counter(&self, now: u16, decay_time: u32) -> u8 {
        decay_counter(
            self.counter(),
            elapsed_minutes(now, self.access_minutes()),
            decay_time,
        )
    }

    /// Eviction score: higher means a better eviction candidate.
    pub fn idle_score(&self, now: u16, decay_time: u32) -> u8 {
        LFU_COUNTER_MAX - self.decayed_counter(now, decay_time)
    }

    /// Records an access: decay, probabilistic increment, timestamp refresh.
    pub fn touch<R: Rng + ?Sized>(&mut self, now: u16, policy: &LfuPolicy, rng: &mut R) {
        let counter = self.decayed_counter(now, policy.decay_time);
        let counter = log_incr(counter, policy.log_factor, rng);
        self.lfu = pack(now, counter);
        self.ref_count = self.ref_count.saturating_add(1);
    }
}

#[inline]
fn pack(minutes: u16, counter: u8) -> u32 {
    ((minutes as u32 & MINUTES_MASK) << MINUTES_SHIFT) | counter as u32
}
