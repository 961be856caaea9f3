//! RESP values and command lines.
//!
//! The same encoding is used in two places:
//!
//! - on the wire, for client requests and replies, and
//! - on disk, where every record of the append-only log is a RESP array of
//!   bulk strings (a *command line*).
//!
//! ```text
//! SET a 1   ──encode──>   *3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n
//! ```

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// One state-mutating operation: the command name followed by its arguments.
///
/// This is the unit written to the append-only log and handed to listeners.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from anything byte-like.
///
/// ```
/// use tidekv::protocol::cmd_line;
/// let cmd = cmd_line(&["SET", "key", "value"]);
/// assert_eq!(cmd.len(), 3);
/// ```
pub fn cmd_line<S: AsRef<[u8]>>(parts: &[S]) -> CmdLine {
    parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// Appends the RESP multi-bulk encoding of `cmd` to `buf`.
pub fn encode_command_into(cmd: &[Bytes], buf: &mut Vec<u8>) {
    buf.push(prefix::ARRAY);
    buf.extend_from_slice(cmd.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for arg in cmd {
        buf.push(prefix::BULK_STRING);
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }
}

/// Encodes a command line as a RESP multi-bulk record.
pub fn encode_command(cmd: &[Bytes]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + cmd.iter().map(|a| a.len() + 16).sum::<usize>());
    encode_command_into(cmd, &mut buf);
    buf
}

/// Builds the synthetic `SELECT <index>` record.
pub fn select_command(db_index: usize) -> CmdLine {
    vec![
        Bytes::from_static(b"SELECT"),
        Bytes::from(db_index.to_string()),
    ]
}

/// A value in the RESP protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`
    SimpleString(String),

    /// `-<message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`, binary safe
    BulkString(Bytes),

    /// Null bulk string (`$-1\r\n`) or null array (`*-1\r\n`)
    Null,

    /// `*<count>\r\n<element>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Builds an array of bulk strings.
    pub fn bulk_array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// `+PONG`
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the value to its wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Converts a request array into a command line.
    ///
    /// Returns `None` unless the value is a non-empty array whose elements
    /// are all bulk or simple strings.
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        let items = match self {
            RespValue::Array(items) if !items.is_empty() => items,
            _ => return None,
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::BulkString(b) => Some(b),
                RespValue::SimpleString(s) => Some(Bytes::from(s)),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let cmd = cmd_line(&["SET", "a", "1"]);
        assert_eq!(
            encode_command(&cmd),
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n"
        );
    }

    #[test]
    fn test_encode_binary_argument() {
        let cmd = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k\r\n")];
        assert_eq!(encode_command(&cmd), b"*2\r\n$3\r\nSET\r\n$3\r\nk\r\n\r\n");
    }

    #[test]
    fn test_select_command() {
        assert_eq!(
            encode_command(&select_command(3)),
            b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n"
        );
    }

    #[test]
    fn test_serialize_replies() {
        assert_eq!(RespValue::ok().serialize(), b"+OK\r\n");
        assert_eq!(RespValue::integer(-42).serialize(), b":-42\r\n");
        assert_eq!(RespValue::null().serialize(), b"$-1\r\n");
        assert_eq!(
            RespValue::error("ERR unknown command").serialize(),
            b"-ERR unknown command\r\n"
        );
    }

    #[test]
    fn test_serialize_nested_array() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("a")),
            RespValue::array(vec![RespValue::integer(2)]),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$1\r\na\r\n*1\r\n:2\r\n");
    }

    #[test]
    fn test_into_cmd_line() {
        let value = RespValue::bulk_array(cmd_line(&["GET", "k"]));
        assert_eq!(value.into_cmd_line(), Some(cmd_line(&["GET", "k"])));

        assert_eq!(RespValue::array(vec![]).into_cmd_line(), None);
        assert_eq!(
            RespValue::array(vec![RespValue::integer(1)]).into_cmd_line(),
            None
        );
        assert_eq!(RespValue::integer(1).into_cmd_line(), None);
    }
}
