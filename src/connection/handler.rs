//! Connection Handler Module
//!
//! This module handles individual client connections to TideKV.
//! Each client gets its own handler task that runs in a loop,
//! reading requests and sending replies.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned, database 0 selected
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  read bytes ─> parse RESP    │
//!    │        ─> command line       │
//!    │        ─> Keyspace::execute  │
//!    │        ─> send reply         │
//!    │                              │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. QUIT, client disconnects or error
//! ```
//!
//! ## Selected database
//!
//! The selected database is connection state. `SELECT` is validated by the
//! keyspace and, on success, the handler switches its own index; nothing is
//! logged for it, since the log carries its own `SELECT` records.

use crate::error::{CommandError, CommandResult};
use crate::protocol::{ParseError, RespParser, RespValue};
use crate::storage::Keyspace;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer (64 MB)
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests answered
    pub requests: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_answered(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// What the loop should do after answering a request.
enum Flow {
    Continue,
    Close,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    keyspace: Arc<Keyspace>,
    /// Database selected by this client
    db_index: usize,
    parser: RespParser,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The TCP stream for this connection
    /// * `addr` - The client's socket address
    /// * `keyspace` - The shared keyspace commands run against
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        keyspace: Arc<Keyspace>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            keyspace,
            db_index: 0,
            parser: RespParser::new(),
            stats,
        }
    }

    /// Runs the connection until the client quits, disconnects or errors.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(request) = self.try_parse_request()? {
                let (reply, flow) = self.dispatch(request).await;
                self.stats.request_answered();
                self.send_response(&reply).await?;
                if let Flow::Close = flow {
                    return Ok(());
                }
            }

            self.read_more_data().await?;
        }
    }

    /// Turns one parsed request into a reply.
    async fn dispatch(&mut self, request: RespValue) -> (RespValue, Flow) {
        let Some(args) = request.into_cmd_line() else {
            return (
                RespValue::error("ERR Protocol error: expected an array of bulk strings"),
                Flow::Continue,
            );
        };

        let name = args[0].to_ascii_lowercase();
        if name == b"quit" {
            return (RespValue::ok(), Flow::Close);
        }

        let selected = if name == b"select" { args.get(1).cloned() } else { None };
        let reply = match self.execute(args).await {
            Ok(reply) => {
                if let Some(index) = selected {
                    self.select(&index);
                }
                reply
            }
            Err(CommandError::Internal(msg)) => {
                error!(client = %self.addr, error = %msg, "Command failed internally");
                CommandError::Internal(msg).to_resp()
            }
            Err(e) => e.to_resp(),
        };
        (reply, Flow::Continue)
    }

    /// Runs a command, moving it to the blocking pool when it can block.
    async fn execute(&self, args: Vec<Bytes>) -> CommandResult {
        if !self.keyspace.table().may_block(&args[0]) {
            return self.keyspace.execute(self.db_index, &args);
        }

        let keyspace = Arc::clone(&self.keyspace);
        let db_index = self.db_index;
        tokio::task::spawn_blocking(move || keyspace.execute(db_index, &args))
            .await
            .unwrap_or_else(|e| Err(CommandError::Internal(format!("command task failed: {}", e))))
    }

    fn select(&mut self, arg: &Bytes) {
        if let Some(index) = std::str::from_utf8(arg).ok().and_then(|s| s.parse().ok()) {
            trace!(client = %self.addr, db = index, "Database selected");
            self.db_index = index;
        }
    }

    fn try_parse_request(&mut self) -> Result<Option<RespValue>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed request"
                );
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        Ok(())
    }

    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// RESP parse error
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial request)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    keyspace: Arc<Keyspace>,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, keyspace, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
