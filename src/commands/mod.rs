//! Command Module
//!
//! This module holds the command table and the command bodies. Every command
//! is described once, in an immutable [`CommandTable`] shared by `Arc`:
//!
//! ```text
//! Client Request / log record
//!       │
//!       ▼
//! ┌──────────────────────┐
//! │ Keyspace::execute    │  lookup, arity, db index, OOM check
//! └──────────┬───────────┘
//!            │  (keys)(args) -> KeySpec
//!            ▼
//! ┌──────────────────────┐
//! │ Lock Coordinator     │  shard locks in ascending order
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ handler(ctx, args)   │  mutates LockedDb, calls ctx.add_aof(...)
//! └──────────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### String Commands
//! - `SET`, `GET`, `SETNX`, `SETEX`, `PSETEX`, `GETSET`
//! - `INCR`, `INCRBY`, `DECR`, `DECRBY`
//! - `APPEND`, `STRLEN`, `MSET`, `MGET`
//!
//! ### Key Commands
//! - `DEL`, `EXISTS`, `TYPE`, `KEYS`, `RENAME`
//! - `EXPIRE`, `PEXPIRE`, `EXPIREAT`, `PEXPIREAT`
//! - `TTL`, `PTTL`, `PERSIST`
//! - `DBSIZE`, `FLUSHDB`, `FLUSHALL`
//!
//! ### Collections
//! - Lists: `LPUSH`, `RPUSH`, `LPOP`, `RPOP`, `LLEN`, `LINDEX`, `LRANGE`
//! - Hashes: `HSET`, `HMSET`, `HGET`, `HDEL`, `HEXISTS`, `HLEN`, `HGETALL`
//! - Sets: `SADD`, `SREM`, `SISMEMBER`, `SMEMBERS`, `SCARD`
//! - Sorted sets: `ZADD`, `ZSCORE`, `ZREM`, `ZCARD`, `ZRANGE`
//!
//! ### Server Commands
//! - `PING`, `ECHO`, `SELECT`, `INFO`
//! - `SAVE`, `BGSAVE`, `BGREWRITEAOF`

pub mod hash;
pub mod keys;
pub mod list;
pub mod server;
pub mod set;
pub mod string;
pub mod zset;

use crate::error::{CommandError, CommandResult};
use crate::protocol::CmdLine;
use crate::storage::{free_memory_if_needed, ExpireOutcome, KeySpec, Keyspace, LockedDb};
use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// A command body. `args[0]` is the command name.
pub type Handler = fn(&mut CommandContext<'_>, &[Bytes]) -> CommandResult;

/// Declares the keys a command reads and writes, from its arguments alone.
pub type KeySpecFn = fn(&[Bytes]) -> KeySpec;

/// Command flags.
pub mod flags {
    /// The command may modify the keyspace
    pub const WRITE: u8 = 1 << 0;
    /// The command may grow memory and is refused when eviction fails
    pub const DENY_OOM: u8 = 1 << 1;
    /// The command does file I/O or walks a whole database
    pub const BLOCKING: u8 = 1 << 2;
}

/// One entry of the command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub handler: Handler,
    /// Argument count including the name; negative means "at least".
    pub arity: i32,
    pub keys: KeySpecFn,
    pub flags: u8,
}

impl CommandDescriptor {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn arity_ok(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= self.arity.unsigned_abs() as usize
        }
    }
}

/// Immutable table of every command, keyed by lowercase name.
#[derive(Debug)]
pub struct CommandTable {
    commands: HashMap<&'static str, CommandDescriptor>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    /// Builds the table with every supported command.
    pub fn new() -> Self {
        let mut table = Self {
            commands: HashMap::new(),
        };
        string::register(&mut table);
        keys::register(&mut table);
        list::register(&mut table);
        hash::register(&mut table);
        set::register(&mut table);
        zset::register(&mut table);
        server::register(&mut table);
        table
    }

    pub(crate) fn register(
        &mut self,
        name: &'static str,
        handler: Handler,
        arity: i32,
        keys: KeySpecFn,
        flags: u8,
    ) {
        self.commands.insert(
            name,
            CommandDescriptor {
                name,
                handler,
                arity,
                keys,
                flags,
            },
        );
    }

    /// Looks up a command by name, ignoring case.
    pub fn get(&self, name: &[u8]) -> Option<&CommandDescriptor> {
        let lower = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
        self.commands.get(lower.as_str())
    }

    /// Whether running `name` may block the calling thread: writes (eviction,
    /// `always` fsync, a full log queue) and commands flagged `BLOCKING`.
    /// Unknown commands never block.
    pub fn may_block(&self, name: &[u8]) -> bool {
        self.get(name)
            .is_some_and(|cmd| cmd.has(flags::WRITE | flags::BLOCKING))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Keyspace {
    /// Executes one command line against database `db_index`.
    ///
    /// # Arguments
    ///
    /// * `db_index` - The database the command runs against
    /// * `args` - The command line; `args[0]` is the command name
    ///
    /// # Returns
    ///
    /// The reply value, or the error to render to the client.
    pub fn execute(&self, db_index: usize, args: &[Bytes]) -> CommandResult {
        let name = args.first().ok_or(CommandError::EmptyCommand)?;
        let cmd = self.table().get(name).ok_or_else(|| {
            CommandError::UnknownCommand(String::from_utf8_lossy(name).into_owned())
        })?;
        if !cmd.arity_ok(args.len()) {
            return Err(CommandError::WrongArity(cmd.name.to_string()));
        }
        let db = self.db(db_index)?;

        if cmd.has(flags::DENY_OOM) && !free_memory_if_needed(self) {
            return Err(CommandError::OutOfMemory);
        }

        let spec = (cmd.keys)(args);
        let mut ctx = CommandContext {
            keyspace: self,
            db: db.lock(&spec),
        };
        let result = catch_unwind(AssertUnwindSafe(|| (cmd.handler)(&mut ctx, args)));
        drop(ctx);
        self.stats().command_processed();

        match result {
            Ok(reply) => reply,
            Err(_) => {
                error!(command = cmd.name, db = db_index, "Command panicked");
                Err(CommandError::Internal(format!("'{}' command panicked", cmd.name)))
            }
        }
    }
}

/// What a command body sees: the locked database plus the keyspace services.
pub struct CommandContext<'a> {
    pub keyspace: &'a Keyspace,
    pub db: LockedDb<'a>,
}

impl CommandContext<'_> {
    pub fn db_index(&self) -> usize {
        self.db.db_index()
    }

    /// Appends a command line to the log for this database.
    pub fn add_aof(&self, cmd: CmdLine) {
        self.keyspace.add_aof(self.db_index(), cmd);
    }

    /// Logs the command exactly as received.
    pub fn propagate(&self, args: &[Bytes]) {
        self.add_aof(args.to_vec());
    }

    /// Sets a key's deadline, deleting the key if it has already passed.
    pub fn set_expire(&mut self, key: &Bytes, at_ms: u64) -> Result<ExpireOutcome, CommandError> {
        self.keyspace.expire_locked(&mut self.db, key, at_ms)
    }

    /// Drops a key's deadline and its pending job. Returns `true` if one was
    /// set.
    pub fn clear_expire(&mut self, key: &Bytes) -> Result<bool, CommandError> {
        let had = self.db.clear_expire(key)?;
        if had {
            self.keyspace.scheduler().cancel(self.db_index(), key);
        }
        Ok(had)
    }

    /// Deletes a key. Returns `true` if it existed.
    pub fn delete(&mut self, key: &Bytes) -> Result<bool, CommandError> {
        let removed = self.db.remove(key)?.is_some();
        if removed {
            self.keyspace.scheduler().cancel(self.db_index(), key);
        }
        Ok(removed)
    }
}

// ============================================================================
// Key declarations
// ============================================================================

pub fn no_keys(_args: &[Bytes]) -> KeySpec {
    KeySpec::none()
}

pub fn read_first_key(args: &[Bytes]) -> KeySpec {
    KeySpec::read(args.get(1).cloned().into_iter().collect())
}

pub fn write_first_key(args: &[Bytes]) -> KeySpec {
    KeySpec::write(args.get(1).cloned().into_iter().collect())
}

pub fn read_all_keys(args: &[Bytes]) -> KeySpec {
    KeySpec::read(args.iter().skip(1).cloned().collect())
}

pub fn write_all_keys(args: &[Bytes]) -> KeySpec {
    KeySpec::write(args.iter().skip(1).cloned().collect())
}

/// Keys at odd positions: `MSET k1 v1 k2 v2`.
pub fn write_even_keys(args: &[Bytes]) -> KeySpec {
    KeySpec::write(args.iter().skip(1).step_by(2).cloned().collect())
}

// ============================================================================
// Argument helpers
// ============================================================================

pub(crate) fn parse_i64(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

pub(crate) fn parse_f64(arg: &[u8]) -> Result<f64, CommandError> {
    let s = std::str::from_utf8(arg).map_err(|_| CommandError::NotFloat)?;
    let value = match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse().map_err(|_| CommandError::NotFloat)?,
    };
    if value.is_nan() {
        return Err(CommandError::NotFloat);
    }
    Ok(value)
}

/// Resolves a Redis-style index (negative counts from the end) into a
/// position, or `None` if out of range.
pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { len + index } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

/// Clamps a Redis-style `start..=stop` range to `len`. Returns `None` for an
/// empty range.
pub(crate) fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}
