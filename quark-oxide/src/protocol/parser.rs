//! Incremental RESP reply decoding
//!
//! The reader loop feeds raw socket bytes into [`ResponseParser`] and pulls
//! complete replies out one at a time. Partial frames stay buffered; a
//! malformed frame poisons the parser until [`ResponseParser::restart`],
//! since nothing after a framing error can be trusted.

use bytes::{Buf, Bytes, BytesMut};
use quark_oxide_core::value::RespValue;
use std::io::Cursor;

/// Outcome of a pull attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Not enough bytes buffered for a complete reply
    Incomplete,
    /// The byte stream violates RESP framing; the parser is poisoned until
    /// restarted
    ProtocolError(String),
    /// One complete reply, removed from the buffer
    Complete(RespValue),
}

/// Streaming RESP2/RESP3 decoder.
pub struct ResponseParser {
    buffer: BytesMut,
    poisoned: Option<String>,
}

impl ResponseParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            poisoned: None,
        }
    }

    /// Append raw bytes from the socket. Never blocks.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Try to pull one complete reply out of the buffer.
    pub fn try_pull(&mut self) -> ParseOutcome {
        if let Some(err) = &self.poisoned {
            return ParseOutcome::ProtocolError(err.clone());
        }

        let mut cursor = Cursor::new(&self.buffer[..]);
        match decode_value(&mut cursor) {
            Ok(Some(value)) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                ParseOutcome::Complete(value)
            }
            Ok(None) => ParseOutcome::Incomplete,
            Err(err) => {
                self.poisoned = Some(err.clone());
                ParseOutcome::ProtocolError(err)
            }
        }
    }

    /// Discard all buffered state and clear any poisoning.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.poisoned = None;
    }

    /// Number of buffered, not yet consumed bytes
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one value. `Ok(None)` means more bytes are needed; the cursor
/// position is only meaningful on `Ok(Some(_))`.
fn decode_value(cursor: &mut Cursor<&[u8]>) -> Result<Option<RespValue>, String> {
    if !cursor.has_remaining() {
        return Ok(None);
    }

    let tag = cursor.chunk()[0];
    cursor.advance(1);
    match tag {
        b'+' => decode_line(cursor, |line| {
            Ok(RespValue::SimpleString(utf8(line, "simple string")?))
        }),
        b'-' => decode_line(cursor, |line| Ok(RespValue::Error(utf8(line, "error")?))),
        b':' => decode_line(cursor, |line| {
            Ok(RespValue::Integer(parse_int(line, "integer")?))
        }),
        b'$' => decode_blob(cursor, false),
        b'!' => decode_blob(cursor, true),
        b'*' => decode_aggregate(cursor, AggregateKind::Array),
        b'>' => decode_aggregate(cursor, AggregateKind::Push),
        b'~' => decode_aggregate(cursor, AggregateKind::Set),
        b'%' => decode_map(cursor),
        b'_' => decode_line(cursor, |line| {
            if line.is_empty() {
                Ok(RespValue::Null)
            } else {
                Err("invalid null frame".to_string())
            }
        }),
        b'#' => decode_line(cursor, |line| match line {
            b"t" => Ok(RespValue::Boolean(true)),
            b"f" => Ok(RespValue::Boolean(false)),
            _ => Err("invalid boolean frame".to_string()),
        }),
        b',' => decode_line(cursor, |line| {
            let text = utf8(line, "double")?;
            text.parse::<f64>()
                .map(RespValue::Double)
                .map_err(|e| format!("invalid double: {e}"))
        }),
        b'(' => decode_line(cursor, |line| {
            let text = utf8(line, "big number")?;
            if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '+')
            {
                return Err(format!("invalid big number: {text:?}"));
            }
            Ok(RespValue::BigNumber(text))
        }),
        b'=' => decode_verbatim(cursor),
        other => Err(format!("unknown RESP type byte: 0x{other:02x}")),
    }
}

enum AggregateKind {
    Array,
    Push,
    Set,
}

fn decode_line<F>(cursor: &mut Cursor<&[u8]>, build: F) -> Result<Option<RespValue>, String>
where
    F: FnOnce(&[u8]) -> Result<RespValue, String>,
{
    match read_line(cursor)? {
        Some(line) => build(&line).map(Some),
        None => Ok(None),
    }
}

fn decode_blob(cursor: &mut Cursor<&[u8]>, is_error: bool) -> Result<Option<RespValue>, String> {
    let len = match read_line(cursor)? {
        Some(line) => parse_int(&line, "bulk length")?,
        None => return Ok(None),
    };

    if len == -1 {
        return Ok(Some(RespValue::Null));
    }
    if len < 0 {
        return Err(format!("negative bulk length: {len}"));
    }

    let len = len as usize;
    if cursor.remaining() < len + 2 {
        return Ok(None);
    }

    let mut data = vec![0u8; len];
    cursor.copy_to_slice(&mut data);
    if cursor.get_u8() != b'\r' || cursor.get_u8() != b'\n' {
        return Err("bulk string not terminated by CRLF".to_string());
    }

    if is_error {
        Ok(Some(RespValue::Error(utf8(&data, "blob error")?)))
    } else {
        Ok(Some(RespValue::BulkString(Bytes::from(data))))
    }
}

fn decode_aggregate(
    cursor: &mut Cursor<&[u8]>,
    kind: AggregateKind,
) -> Result<Option<RespValue>, String> {
    let len = match read_line(cursor)? {
        Some(line) => parse_int(&line, "aggregate length")?,
        None => return Ok(None),
    };

    if len == -1 {
        return Ok(Some(RespValue::Null));
    }
    if len < 0 {
        return Err(format!("negative aggregate length: {len}"));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match decode_value(cursor)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }

    Ok(Some(match kind {
        AggregateKind::Array => RespValue::Array(items),
        AggregateKind::Push => RespValue::Push(items),
        AggregateKind::Set => RespValue::Set(items),
    }))
}

fn decode_map(cursor: &mut Cursor<&[u8]>) -> Result<Option<RespValue>, String> {
    let len = match read_line(cursor)? {
        Some(line) => parse_int(&line, "map length")?,
        None => return Ok(None),
    };
    if len < 0 {
        return Err(format!("negative map length: {len}"));
    }

    let mut pairs = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let key = match decode_value(cursor)? {
            Some(k) => k,
            None => return Ok(None),
        };
        let value = match decode_value(cursor)? {
            Some(v) => v,
            None => return Ok(None),
        };
        pairs.push((key, value));
    }
    Ok(Some(RespValue::Map(pairs)))
}

fn decode_verbatim(cursor: &mut Cursor<&[u8]>) -> Result<Option<RespValue>, String> {
    let len = match read_line(cursor)? {
        Some(line) => parse_int(&line, "verbatim length")?,
        None => return Ok(None),
    };
    if len < 0 {
        return Err(format!("negative verbatim length: {len}"));
    }

    let len = len as usize;
    if cursor.remaining() < len + 2 {
        return Ok(None);
    }

    let mut data = vec![0u8; len];
    cursor.copy_to_slice(&mut data);
    if cursor.get_u8() != b'\r' || cursor.get_u8() != b'\n' {
        return Err("verbatim string not terminated by CRLF".to_string());
    }

    // Layout is `fmt:body` with a three-letter format tag.
    let colon = data
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| "verbatim string missing format separator".to_string())?;
    let format = utf8(&data[..colon], "verbatim format")?;
    let body = data[colon + 1..].to_vec();
    Ok(Some(RespValue::Verbatim {
        format,
        data: Bytes::from(body),
    }))
}

/// Read bytes up to the next CRLF. `Ok(None)` if no complete line is
/// buffered yet.
fn read_line(cursor: &mut Cursor<&[u8]>) -> Result<Option<Vec<u8>>, String> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();

    let mut i = start;
    while i + 1 < data.len() {
        if data[i] == b'\r' {
            if data[i + 1] != b'\n' {
                return Err("CR not followed by LF".to_string());
            }
            let line = data[start..i].to_vec();
            cursor.set_position((i + 2) as u64);
            return Ok(Some(line));
        }
        if data[i] == b'\n' {
            return Err("bare LF in protocol line".to_string());
        }
        i += 1;
    }
    Ok(None)
}

fn parse_int(line: &[u8], what: &str) -> Result<i64, String> {
    let text = utf8(line, what)?;
    text.parse::<i64>()
        .map_err(|e| format!("invalid {what}: {e}"))
}

fn utf8(bytes: &[u8], what: &str) -> Result<String, String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid UTF-8 in {what}: {e}"))
}
