//! Connection Module
//!
//! This module manages client connections to TideKV. Each client connection
//! is handled by its own async task; the tasks share one [`Keyspace`] and
//! each tracks its own selected database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐  │
//! │  │ Read bytes  │───>│ Parse RESP  │───>│ Keyspace        │  │
//! │  └─────────────┘    └─────────────┘    │  ::execute(db,  │  │
//! │                                        │     cmd line)   │  │
//! │                                        └────────┬────────┘  │
//! │                                                 ▼           │
//! │                                        ┌─────────────────┐  │
//! │                                        │ Send reply      │  │
//! │                                        └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tidekv::config::Config;
//! use tidekv::connection::{handle_connection, ConnectionStats};
//! use tidekv::storage::Keyspace;
//! use std::sync::Arc;
//!
//! let keyspace = Arc::new(Keyspace::new(&Config::default()));
//! let stats = Arc::new(ConnectionStats::new());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, Arc::clone(&keyspace), Arc::clone(&stats)));
//! ```
//!
//! [`Keyspace`]: crate::storage::Keyspace

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
