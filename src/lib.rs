//! # TideKV - An In-Memory Key-Value Engine with Durable Logging
//!
//! TideKV is a Redis-compatible, in-memory key-value engine. The in-memory
//! keyspace is the source of truth; an append-only command log and a binary
//! snapshot make it recoverable after a crash.
//!
//! ## Features
//!
//! - **Multiple databases** of five value types, behind 64 sharded locks each
//! - **Declared locking**: every command names its keys before it runs
//! - **Timing wheel expiry** driven by a background task
//! - **Approximated LFU eviction** under a `maxmemory` ceiling
//! - **Append-only log** with `always`, `everysec` or `no` fsync and an
//!   online rewrite that never loses concurrent writes
//! - **Snapshots**, standalone or as the preamble of a rewritten log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TideKV                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────┐     │
//! │  │ TCP Server  │───>│ Connection  │───>│ Keyspace::execute        │     │
//! │  │ (Listener)  │    │  Handler    │    │  table ─> locks ─> body  │     │
//! │  └─────────────┘    └─────────────┘    └───────┬─────────┬────────┘     │
//! │                                                │         │ add_aof      │
//! │                                                ▼         ▼              │
//! │  ┌──────────────────────────────────┐   ┌────────────────────────────┐  │
//! │  │ Databases 0..N (64 shards each)  │   │ Persister                  │  │
//! │  │ data │ expires │ key descriptors │   │  queue ─> writer thread    │  │
//! │  └──────────────────────────────────┘   │  fsync ticker, rewrite     │  │
//! │        ▲                    ▲           └────────────────────────────┘  │
//! │  ┌─────┴────────┐   ┌───────┴───────┐                                   │
//! │  │ ExpiryDriver │   │ MemorySampler │                                   │
//! │  │ (wheel)      │   │ (LFU evict)   │                                   │
//! │  └──────────────┘   └───────────────┘                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidekv::config::Config;
//! use tidekv::connection::{handle_connection, ConnectionStats};
//! use tidekv::storage::{ExpiryDriver, Keyspace};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let keyspace = Arc::new(Keyspace::new(&config));
//!     let _persister = tidekv::persistence::recover(&keyspace)?;
//!     let _expiry = ExpiryDriver::start(Arc::clone(&keyspace));
//!
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = TcpListener::bind(config.bind_address()).await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         tokio::spawn(handle_connection(
//!             stream,
//!             addr,
//!             Arc::clone(&keyspace),
//!             Arc::clone(&stats),
//!         ));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Server configuration (JSON file + CLI overrides)
//! - [`error`]: Error types per layer
//! - [`protocol`]: RESP parser, serializer and log record decoder
//! - [`storage`]: Entities, databases, locking, expiry and eviction
//! - [`commands`]: Command table and command bodies
//! - [`persistence`]: Append-only log, rewrite and snapshot codec
//! - [`connection`]: Client connection management
//!
//! ## Design Highlights
//!
//! ### Expiry
//!
//! Deadlines live in each database's expiration map; deletion is driven only
//! by the timing wheel. Reads never check deadlines, so a key can be visible
//! for up to one wheel tick after its deadline.
//!
//! ### Log format
//!
//! The log is a stream of RESP arrays. A `SELECT` record is injected whenever
//! the target database changes, and every deadline is written as an absolute
//! `PEXPIREAT`, so replaying the log never extends a key's life.

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{CommandContext, CommandTable};
pub use config::{Config, FsyncPolicy};
pub use connection::{handle_connection, ConnectionStats};
pub use error::{CommandError, CommandResult, PersistError, PersistResult};
pub use persistence::{recover, Persister};
pub use protocol::{ParseError, RespParser, RespValue};
pub use storage::{ExpiryDriver, Keyspace, MemorySampler};

/// The default port TideKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
