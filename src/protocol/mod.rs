//! RESP Protocol Implementation
//!
//! TideKV speaks the Redis Serialization Protocol (RESP) to clients and
//! stores its append-only log in the same encoding.
//!
//! ## Modules
//!
//! - `types`: [`RespValue`], command lines and their log encoding
//! - `parser`: incremental parser for connections, record decoder for replay
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{cmd_line, encode_command, parse_message};
//!
//! let record = encode_command(&cmd_line(&["SET", "name", "tide"]));
//! let (value, consumed) = parse_message(&record).unwrap().unwrap();
//! assert_eq!(consumed, record.len());
//! assert_eq!(value.into_cmd_line(), Some(cmd_line(&["SET", "name", "tide"])));
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, LogDecoder, LogRecord, ParseError, ParseResult, RespParser};
pub use types::{
    cmd_line, encode_command, encode_command_into, select_command, CmdLine, RespValue,
};
