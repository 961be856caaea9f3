//! Incremental RESP Parser
//!
//! The parser works on a borrowed buffer and reports how many bytes a
//! complete value occupied:
//!
//! - `Ok(Some((value, consumed)))`: a value was parsed from `buf[..consumed]`
//! - `Ok(None)`: the buffer holds only part of a value, read more
//! - `Err(ParseError)`: the bytes are not valid RESP
//!
//! Connections use [`RespParser`] directly on their read buffer. Log replay
//! uses [`LogDecoder`], which walks a whole log image record by record and
//! resynchronizes on the next array header after a malformed record.

use crate::protocol::types::{prefix, CmdLine, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP parser.
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the front of `buf`.
    ///
    /// Lines that do not start with a type prefix are treated as inline
    /// commands (`PING\r\n`), as sent by telnet-style clients.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::Protocol(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match first {
            prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER => parse_single_line(buf),
            prefix::BULK_STRING => parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            _ => parse_inline(buf),
        }
    }

    /// `*<count>\r\n<element>...`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((line, mut consumed)) = read_line(buf, 1) else {
            return Ok(None);
        };
        let count = parse_int(line)?;
        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        // Cap the preallocation, the count is untrusted.
        let mut elements = Vec::with_capacity((count as usize).min(1024));
        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// `+<string>\r\n`, `-<message>\r\n` and `:<integer>\r\n`
fn parse_single_line(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, next)) = read_line(buf, 1) else {
        return Ok(None);
    };
    let value = match buf[0] {
        prefix::SIMPLE_STRING => RespValue::SimpleString(utf8(line, "simple string")?.to_string()),
        prefix::ERROR => RespValue::Error(utf8(line, "error")?.to_string()),
        _ => RespValue::Integer(parse_int(line)?),
    };
    Ok(Some((value, next)))
}

/// `$<length>\r\n<data>\r\n`
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, data_start)) = read_line(buf, 1) else {
        return Ok(None);
    };
    let length = parse_int(line)?;
    if length == -1 {
        return Ok(Some((RespValue::Null, data_start)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }
    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let data_end = data_start + length;
    if buf.len() < data_end + 2 {
        return Ok(None);
    }
    if &buf[data_end..data_end + 2] != CRLF {
        return Err(ParseError::Protocol(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
    Ok(Some((RespValue::BulkString(data), data_end + 2)))
}

/// `PING\r\n` style commands.
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, next)) = read_line(buf, 0) else {
        return Ok(None);
    };
    let line = utf8(line, "inline command")?;
    let parts: Vec<RespValue> = line
        .split_whitespace()
        .map(|s| RespValue::BulkString(Bytes::copy_from_slice(s.as_bytes())))
        .collect();
    if parts.is_empty() {
        return Err(ParseError::Protocol("empty inline command".to_string()));
    }
    Ok(Some((RespValue::Array(parts), next)))
}

/// Returns the line starting at `start` (without CRLF) and the offset just
/// past its terminator.
#[inline]
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let pos = rest.windows(2).position(|w| w == CRLF)?;
    Some((&rest[..pos], start + pos + 2))
}

fn utf8<'a>(line: &'a [u8], what: &'static str) -> ParseResult<&'a str> {
    std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8(what))
}

fn parse_int(line: &[u8]) -> ParseResult<i64> {
    utf8(line, "integer")?
        .parse()
        .map_err(|_| ParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

/// Helper function to parse a single RESP message from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

/// One item produced while decoding a log image.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A well-formed command record.
    Command(CmdLine),
    /// Bytes at `offset` did not form a command record; they were skipped.
    Malformed { offset: usize, reason: String },
    /// The image ends in the middle of a record starting at `offset`.
    Truncated { offset: usize },
}

/// Iterates over the command records of an append-only log image.
///
/// Unlike the connection parser, only multi-bulk arrays are accepted, so
/// stray bytes are never mistaken for inline commands.
#[derive(Debug)]
pub struct LogDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    parser: RespParser,
}

impl<'a> LogDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            parser: RespParser::new(),
        }
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Skips to the next `*` that starts a line.
    fn resync(&mut self, from: usize) {
        let mut i = from + 1;
        while i < self.buf.len() {
            if self.buf[i] == prefix::ARRAY && self.buf[i - 1] == b'\n' {
                break;
            }
            i += 1;
        }
        self.pos = i.min(self.buf.len());
    }
}

impl Iterator for LogDecoder<'_> {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let offset = self.pos;

        if self.buf[offset] != prefix::ARRAY {
            self.resync(offset);
            return Some(LogRecord::Malformed {
                offset,
                reason: format!("unexpected byte {:#04x}", self.buf[offset]),
            });
        }

        match self.parser.parse(&self.buf[offset..]) {
            Ok(Some((value, consumed))) => {
                self.pos = offset + consumed;
                Some(match value.into_cmd_line() {
                    Some(cmd) => LogRecord::Command(cmd),
                    None => LogRecord::Malformed {
                        offset,
                        reason: "record is not an array of strings".to_string(),
                    },
                })
            }
            Ok(None) => {
                self.pos = self.buf.len();
                Some(LogRecord::Truncated { offset })
            }
            Err(e) => {
                self.resync(offset);
                Some(LogRecord::Malformed {
                    offset,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{cmd_line, encode_command};

    #[test]
    fn test_parse_simple_values() {
        assert_eq!(
            parse_message(b"+OK\r\n").unwrap(),
            Some((RespValue::SimpleString("OK".into()), 5))
        );
        assert_eq!(
            parse_message(b":-12\r\n").unwrap(),
            Some((RespValue::Integer(-12), 6))
        );
        assert_eq!(
            parse_message(b"-ERR bad\r\n").unwrap(),
            Some((RespValue::Error("ERR bad".into()), 10))
        );
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(parse_message(b"+OK").unwrap(), None);
        assert_eq!(parse_message(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse_message(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
    }

    #[test]
    fn test_parse_null_and_empty_bulk() {
        assert_eq!(
            parse_message(b"$-1\r\n").unwrap(),
            Some((RespValue::Null, 5))
        );
        assert_eq!(
            parse_message(b"$0\r\n\r\n").unwrap(),
            Some((RespValue::BulkString(Bytes::new()), 6))
        );
    }

    #[test]
    fn test_parse_command_array() {
        let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        let (value, consumed) = parse_message(data).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(value.into_cmd_line(), Some(cmd_line(&["GET", "name"])));
    }

    #[test]
    fn test_parse_inline_command() {
        let (value, consumed) = parse_message(b"SET k v\r\n").unwrap().unwrap();
        assert_eq!(consumed, 9);
        assert_eq!(value.into_cmd_line(), Some(cmd_line(&["SET", "k", "v"])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_message(b":abc\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b"$-5\r\n"),
            Err(ParseError::InvalidBulkLength(-5))
        ));
        assert!(matches!(
            parse_message(b"$3\r\nabcd\r\n"),
            Err(ParseError::Protocol(_))
        ));
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let data = b"$4\r\n\r\n\0\xff\r\n";
        let (value, _) = parse_message(data).unwrap().unwrap();
        assert_eq!(value.as_bytes(), Some(&b"\r\n\0\xff"[..]));
    }

    #[test]
    fn test_log_decoder_reads_records() {
        let mut log = encode_command(&cmd_line(&["SET", "a", "1"]));
        log.extend(encode_command(&cmd_line(&["DEL", "a"])));

        let records: Vec<LogRecord> = LogDecoder::new(&log).collect();
        assert_eq!(
            records,
            vec![
                LogRecord::Command(cmd_line(&["SET", "a", "1"])),
                LogRecord::Command(cmd_line(&["DEL", "a"])),
            ]
        );
    }

    #[test]
    fn test_log_decoder_skips_garbage() {
        let mut log = encode_command(&cmd_line(&["SET", "a", "1"]));
        log.extend_from_slice(b"garbage\r\n");
        log.extend_from_slice(b"*1\r\n:5\r\n");
        log.extend(encode_command(&cmd_line(&["SET", "b", "2"])));

        let records: Vec<LogRecord> = LogDecoder::new(&log).collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0], LogRecord::Command(cmd_line(&["SET", "a", "1"])));
        assert!(matches!(records[1], LogRecord::Malformed { .. }));
        assert!(matches!(records[2], LogRecord::Malformed { .. }));
        assert_eq!(records[3], LogRecord::Command(cmd_line(&["SET", "b", "2"])));
    }

    #[test]
    fn test_log_decoder_truncated_tail() {
        let mut log = encode_command(&cmd_line(&["SET", "a", "1"]));
        let full = log.len();
        log.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nb");

        let mut decoder = LogDecoder::new(&log);
        assert_eq!(
            decoder.next(),
            Some(LogRecord::Command(cmd_line(&["SET", "a", "1"])))
        );
        assert_eq!(decoder.position(), full);
        assert_eq!(decoder.next(), Some(LogRecord::Truncated { offset: full }));
        assert_eq!(decoder.next(), None);
    }
}
