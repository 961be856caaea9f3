//! Storage Module
//!
//! This module holds the in-memory side of TideKV: the entities, the per-key
//! descriptors, the sharded database tables, the lock coordinator, the
//! expiration scheduler and the eviction policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Keyspace                             │
//! │  ┌────────────┐ ┌────────────┐          ┌────────────┐      │
//! │  │ Database 0 │ │ Database 1 │   ...    │ Database N │      │
//! │  │ 64 shards  │ │ 64 shards  │          │ 64 shards  │      │
//! │  │ key index  │ │ key index  │          │ key index  │      │
//! │  └────────────┘ └────────────┘          └────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲                   ▲                      ▲
//!        │ lock(KeySpec)     │ expire_key           │ evict_key
//!   ┌────┴──────┐     ┌──────┴───────┐      ┌───────┴────────┐
//!   │ commands  │     │ ExpiryDriver │      │ MemorySampler  │
//!   │           │     │ (timing      │      │ (LFU eviction) │
//!   │           │     │  wheel)      │      │                │
//!   └───────────┘     └──────────────┘      └────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Declared locking**: commands name their keys up front and the lock
//!   coordinator takes the matching shard locks in ascending order
//! - **Five value types**: strings, lists, hashes, sets and sorted sets
//! - **Timing wheel expiry**: O(1) schedule and cancel, no lazy expiry on read
//! - **Approximated LFU eviction** under a `maxmemory` ceiling
//!
//! ## Example
//!
//! ```
//! use tidekv::config::Config;
//! use tidekv::storage::{Entity, KeySpec, Keyspace};
//! use bytes::Bytes;
//!
//! let keyspace = Keyspace::new(&Config::default());
//! let key = Bytes::from("name");
//!
//! let db = keyspace.db(0).unwrap();
//! let mut locked = db.lock(&KeySpec::write(vec![key.clone()]));
//! locked.put(key.clone(), Entity::String(Bytes::from("tide"))).unwrap();
//! drop(locked);
//!
//! assert_eq!(keyspace.key_count(), 1);
//! ```

pub mod db;
pub mod descriptor;
pub mod entity;
pub mod eviction;
pub mod expiry;
pub mod glob;
pub mod keyspace;
pub mod lock;

// Re-export commonly used types
pub use db::{Database, NUM_SHARDS};
pub use descriptor::{KeyDescriptor, LfuPolicy, LFU_INIT_VAL};
pub use entity::{expire_command, format_score, DataType, Entity, SortedSet};
pub use eviction::{free_memory_if_needed, MemorySampler, EVICTION_MAX_ATTEMPTS, EVPOOL_SIZE};
pub use expiry::{unix_ms, ExpiryDriver, ExpiryScheduler, TimingWheel};
pub use glob::GlobPattern;
pub use keyspace::{ExpireOutcome, Keyspace, KeyspaceStats, SaveGuard};
pub use lock::{KeySpec, LockedDb};
