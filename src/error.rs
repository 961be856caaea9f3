//! Error types shared across TideKV.
//!
//! Errors are split by the layer that produces them:
//!
//! - [`CommandError`]: user-visible failures of a single command. These are
//!   rendered to the client as RESP error lines, so each message carries the
//!   conventional prefix (`ERR`, `WRONGTYPE`, `OOM`).
//! - [`PersistError`]: failures of the append-only log, the rewrite protocol
//!   or the snapshot codec.
//! - [`ConfigError`]: failures while loading or validating configuration.

use crate::protocol::RespValue;
use thiserror::Error;

/// Errors returned by command execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("ERR empty command")]
    EmptyCommand,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpireTime(String),

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR DB index is out of range")]
    DbIndexOutOfRange,

    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    #[error("ERR {0}")]
    Persistence(String),

    /// A command body touched a key it never declared, or panicked.
    #[error("ERR internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Renders the error as the RESP error reply sent to clients.
    pub fn to_resp(&self) -> RespValue {
        RespValue::error(self.to_string())
    }
}

impl From<PersistError> for CommandError {
    fn from(err: PersistError) -> Self {
        CommandError::Persistence(err.to_string())
    }
}

/// Result type for command bodies.
pub type CommandResult = Result<RespValue, CommandError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Background append only file rewriting already in progress")]
    RewriteInProgress,

    #[error("append only file is closed")]
    Closed,
}

/// Result type for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_prefixes() {
        assert!(CommandError::WrongType.to_string().starts_with("WRONGTYPE "));
        assert!(CommandError::OutOfMemory.to_string().starts_with("OOM "));
        assert!(CommandError::Syntax.to_string().starts_with("ERR "));
    }

    #[test]
    fn test_to_resp_is_error_line() {
        let resp = CommandError::UnknownCommand("foo".into()).to_resp();
        assert_eq!(resp.serialize(), b"-ERR unknown command 'foo'\r\n");
    }

    #[test]
    fn test_persist_error_converts() {
        let err: CommandError = PersistError::RewriteInProgress.into();
        assert_eq!(
            err.to_string(),
            "ERR Background append only file rewriting already in progress"
        );
    }
}
