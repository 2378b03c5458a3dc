//! Binary payload layout for the shared layer
//!
//! Everything the communicator and the shared hash put on a pub/sub channel
//! uses one frozen, self-describing layout: **little-endian**, `u32` length
//! prefixes, `i32` status codes.
//!
//! - request: `(uuid_len: u32, uuid, contents_len: u32, contents)`
//! - reply:   `(uuid_len: u32, uuid, status: i32, contents_len: u32, contents)`
//! - batch:   `(count: u32, (len: u32, bytes) * count)` with count strings
//!   alternating key, value
//!
//! Both sides of the exchange must agree on this layout; it is part of the
//! wire contract and must not change.

use crate::shared::vault::CommunicatorReply;
use bytes::{BufMut, Bytes, BytesMut};

/// Incremental writer for the layout above.
pub struct BinarySerializer {
    buf: BytesMut,
}

impl BinarySerializer {
    /// Start with a capacity hint
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append a little-endian u32
    pub fn append_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    /// Append a little-endian i32
    pub fn append_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// Append a length-prefixed byte string
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.append_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    /// Finish and take the payload
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Incremental reader for the layout above. Every consume fails cleanly on
/// truncated input.
pub struct BinaryDeserializer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryDeserializer<'a> {
    /// Wrap a payload
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return None;
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    /// Consume a little-endian u32
    pub fn consume_u32(&mut self) -> Option<u32> {
        let raw = self.take(4)?;
        Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Consume a little-endian i32
    pub fn consume_i32(&mut self) -> Option<i32> {
        let raw = self.take(4)?;
        Some(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Consume a length-prefixed byte string
    pub fn consume_bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.consume_u32()? as usize;
        Some(self.take(len)?.to_vec())
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn bytes_left(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Serialize a communicator request payload.
#[must_use]
pub fn serialize_request(uuid: &str, contents: &[u8]) -> Bytes {
    let mut out = BinarySerializer::with_capacity(8 + uuid.len() + contents.len());
    out.append_bytes(uuid.as_bytes());
    out.append_bytes(contents);
    out.finish()
}

/// Parse a communicator request payload. `None` on any truncation,
/// trailing garbage or a non-UTF-8 uuid.
#[must_use]
pub fn parse_request(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut de = BinaryDeserializer::new(payload);
    let uuid = String::from_utf8(de.consume_bytes()?).ok()?;
    let contents = de.consume_bytes()?;
    if de.bytes_left() != 0 {
        return None;
    }
    Some((uuid, contents))
}

/// Serialize a communicator reply payload.
#[must_use]
pub fn serialize_reply(uuid: &str, reply: &CommunicatorReply) -> Bytes {
    let mut out = BinarySerializer::with_capacity(12 + uuid.len() + reply.contents.len());
    out.append_bytes(uuid.as_bytes());
    out.append_i32(reply.status);
    out.append_bytes(&reply.contents);
    out.finish()
}

/// Parse a communicator reply payload.
#[must_use]
pub fn parse_reply(payload: &[u8]) -> Option<(String, CommunicatorReply)> {
    let mut de = BinaryDeserializer::new(payload);
    let uuid = String::from_utf8(de.consume_bytes()?).ok()?;
    let status = de.consume_i32()?;
    let contents = de.consume_bytes()?;
    if de.bytes_left() != 0 {
        return None;
    }
    Some((uuid, CommunicatorReply { status, contents }))
}

/// Serialize a key/value batch for the shared hash.
#[must_use]
pub fn serialize_batch(batch: &[(String, String)]) -> Bytes {
    let size: usize = batch
        .iter()
        .map(|(k, v)| 8 + k.len() + v.len())
        .sum::<usize>()
        + 4;
    let mut out = BinarySerializer::with_capacity(size);
    out.append_u32((batch.len() * 2) as u32);
    for (key, value) in batch {
        out.append_bytes(key.as_bytes());
        out.append_bytes(value.as_bytes());
    }
    out.finish()
}

/// Parse a key/value batch.
#[must_use]
pub fn parse_batch(payload: &[u8]) -> Option<Vec<(String, String)>> {
    let mut de = BinaryDeserializer::new(payload);
    let elements = de.consume_u32()?;
    if elements % 2 != 0 {
        return None;
    }

    let mut out = Vec::with_capacity((elements / 2) as usize);
    for _ in 0..elements / 2 {
        let key = String::from_utf8(de.consume_bytes()?).ok()?;
        let value = String::from_utf8(de.consume_bytes()?).ok()?;
        out.push((key, value));
    }
    if de.bytes_left() != 0 {
        return None;
    }
    Some(out)
}
