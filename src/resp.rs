//! RESP (`REdis` Serialization Protocol) parser and encoder
//!
//! The broker server and the remote broker client speak a small subset of
//! RESP2: commands are arrays of bulk strings, replies are any RESP value.
//! Reference: <https://redis.io/docs/reference/protocol-spec/>

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::str;

/// Maximum size for a single RESP message (4MB, room for large item payloads)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum number of elements in an array
const MAX_ARRAY_SIZE: usize = 1024;

/// Maximum length of a header or simple string line
const MAX_LINE_SIZE: usize = 64 * 1024;

/// RESP value types
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Vec<u8>),
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// Null bulk string: $-1\r\n
    NullBulkString,
}

impl RespValue {
    /// Build a command array out of bulk string arguments
    #[must_use]
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        RespValue::Array(
            parts
                .into_iter()
                .map(|p| RespValue::BulkString(p.as_ref().to_vec()))
                .collect(),
        )
    }

    /// Bulk string holding the decimal form of `n`
    #[must_use]
    pub fn bulk_u64(n: u64) -> Self {
        RespValue::BulkString(n.to_string().into_bytes())
    }

    /// Encode RESP value to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => out.extend_from_slice(format!("+{s}\r\n").as_bytes()),
            RespValue::Error(s) => out.extend_from_slice(format!("-{s}\r\n").as_bytes()),
            RespValue::Integer(i) => out.extend_from_slice(format!(":{i}\r\n").as_bytes()),
            RespValue::BulkString(data) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            RespValue::NullBulkString => out.extend_from_slice(b"$-1\r\n"),
        }
    }

    /// Extract bulk string as UTF-8 string
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a bulk string or contains invalid UTF-8.
    pub fn as_string(&self) -> Result<String> {
        match self {
            RespValue::BulkString(data) => str::from_utf8(data)
                .map(std::string::ToString::to_string)
                .map_err(|_| Error::Protocol("Invalid UTF-8 in bulk string".to_string())),
            RespValue::SimpleString(s) => Ok(s.clone()),
            _ => Err(Error::Protocol("Expected bulk string".to_string())),
        }
    }

    /// Extract an unsigned integer from an integer reply or a decimal bulk string
    ///
    /// # Errors
    ///
    /// Returns an error if the value is neither, or is negative.
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            RespValue::Integer(i) => u64::try_from(*i)
                .map_err(|_| Error::Protocol(format!("Expected non-negative integer, got {i}"))),
            RespValue::BulkString(_) => self
                .as_string()?
                .parse::<u64>()
                .map_err(|_| Error::Protocol("Expected decimal integer".to_string())),
            _ => Err(Error::Protocol("Expected integer".to_string())),
        }
    }

    /// Take the raw bytes of a bulk string
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a bulk string.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            RespValue::BulkString(data) => Ok(data),
            _ => Err(Error::Protocol("Expected bulk string".to_string())),
        }
    }
}

/// Streaming RESP parser
///
/// Bytes are fed as they arrive on the socket; `parse` yields complete
/// values and keeps partial ones buffered until the rest arrives.
#[allow(clippy::module_name_repetitions)]
pub struct RespParser {
    buffer: BytesMut,
}

impl RespParser {
    /// Create a new RESP parser
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the parser buffer
    ///
    /// # Security
    /// Enforces maximum message size to prevent `DoS` attacks
    ///
    /// # Errors
    ///
    /// Returns an error if the message would exceed the maximum size limit.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if self.buffer.len() + data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Try to parse a complete RESP value from the buffer
    ///
    /// Returns `Ok(None)` while the buffered bytes are a valid but incomplete
    /// message.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer contains invalid RESP data.
    pub fn parse(&mut self) -> Result<Option<RespValue>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match parse_value(&self.buffer[..], 0)? {
            Some((value, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

type Parsed = Option<(RespValue, usize)>;

/// Parse one value starting at `pos`; on success returns the value and the
/// position just past it.
fn parse_value(buf: &[u8], pos: usize) -> Result<Parsed> {
    let Some(&type_byte) = buf.get(pos) else {
        return Ok(None);
    };
    if !matches!(type_byte, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(Error::Protocol(format!("Unknown RESP type: {type_byte}")));
    }
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match type_byte {
        b'+' => Ok(Some((RespValue::SimpleString(line.to_string()), next))),
        b'-' => Ok(Some((RespValue::Error(line.to_string()), next))),
        b':' => {
            let num = line
                .parse::<i64>()
                .map_err(|_| Error::Protocol("Invalid integer".to_string()))?;
            Ok(Some((RespValue::Integer(num), next)))
        }
        b'$' => parse_bulk_string(buf, line, next),
        b'*' => parse_array(buf, line, next),
        other => Err(Error::Protocol(format!("Unknown RESP type: {other}"))),
    }
}

/// Parse bulk string body after the `$<len>` header
///
/// # Security
/// Validates size before allocating to prevent `DoS`
fn parse_bulk_string(buf: &[u8], header: &str, pos: usize) -> Result<Parsed> {
    let size = header
        .parse::<i64>()
        .map_err(|_| Error::Protocol("Invalid bulk string size".to_string()))?;

    if size == -1 {
        return Ok(Some((RespValue::NullBulkString, pos)));
    }

    let size =
        usize::try_from(size).map_err(|_| Error::Protocol("Invalid bulk string size".to_string()))?;
    if size > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge);
    }

    let end = pos + size;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(Error::Protocol("Missing CRLF after bulk string".to_string()));
    }

    Ok(Some((RespValue::BulkString(buf[pos..end].to_vec()), end + 2)))
}

/// Parse array elements after the `*<len>` header
///
/// # Security
/// Validates array size to prevent `DoS` via oversized structures
fn parse_array(buf: &[u8], header: &str, mut pos: usize) -> Result<Parsed> {
    let size = header
        .parse::<i64>()
        .map_err(|_| Error::Protocol("Invalid array size".to_string()))?;
    let size = usize::try_from(size).map_err(|_| Error::Protocol("Invalid array size".to_string()))?;
    if size > MAX_ARRAY_SIZE {
        return Err(Error::Protocol(format!(
            "Array size {size} exceeds maximum {MAX_ARRAY_SIZE}"
        )));
    }

    let mut items = Vec::with_capacity(size);
    for _ in 0..size {
        match parse_value(buf, pos)? {
            Some((item, next)) => {
                items.push(item);
                pos = next;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(items), pos)))
}

/// Read a line terminated by \r\n starting at `pos`
fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&str, usize)>> {
    let rest = buf.get(pos..).unwrap_or_default();
    let Some(cr) = rest.windows(2).position(|w| w == b"\r\n") else {
        // Security: Prevent unbounded header lines
        if rest.len() > MAX_LINE_SIZE {
            return Err(Error::Protocol("Header line too long".to_string()));
        }
        return Ok(None);
    };

    let line = str::from_utf8(&rest[..cr])
        .map_err(|_| Error::Protocol("Invalid UTF-8 in line".to_string()))?;
    Ok(Some((line, pos + cr + 2)))
}
