//! RESP encoding
//!
//! Commands always go out as arrays of bulk strings; [`RespEncoder`] can
//! additionally serialize any [`RespValue`], which the test harness uses to
//! play the server side of the protocol.

use bytes::{BufMut, Bytes, BytesMut};
use quark_oxide_core::value::RespValue;

const CRLF: &[u8] = b"\r\n";

/// A command serialized into its RESP wire form, ready to be flushed.
///
/// The payload is an `Arc`-backed [`Bytes`], so cloning for replay after a
/// reconnect does not copy the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
    bytes: Bytes,
}

impl EncodedRequest {
    /// Encode a command from its arguments. Arguments are binary-safe.
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args: Vec<A> = args.into_iter().collect();
        let mut buf = BytesMut::new();
        buf.put_u8(b'*');
        buf.put_slice(args.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        for arg in &args {
            let arg = arg.as_ref();
            buf.put_u8(b'$');
            buf.put_slice(arg.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
        Self {
            bytes: buf.freeze(),
        }
    }

    /// The serialized wire form
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume into the serialized wire form
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Length of the wire form in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the wire form is empty (never the case for a real command)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encodes RESP values into bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value into a buffer
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Array(arr) => {
                buf.put_u8(b'*');
                buf.put_slice(arr.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in arr {
                    Self::encode(item, buf);
                }
            }
            RespValue::Push(arr) => {
                buf.put_u8(b'>');
                buf.put_slice(arr.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in arr {
                    Self::encode(item, buf);
                }
            }
            RespValue::Double(d) => {
                buf.put_u8(b',');
                buf.put_slice(d.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Boolean(b) => {
                buf.put_u8(b'#');
                buf.put_u8(if *b { b't' } else { b'f' });
                buf.put_slice(CRLF);
            }
            RespValue::BigNumber(s) => {
                buf.put_u8(b'(');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Verbatim { format, data } => {
                buf.put_u8(b'=');
                buf.put_slice((format.len() + 1 + data.len()).to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(format.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Map(pairs) => {
                buf.put_u8(b'%');
                buf.put_slice(pairs.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for (k, v) in pairs {
                    Self::encode(k, buf);
                    Self::encode(v, buf);
                }
            }
            RespValue::Set(items) => {
                buf.put_u8(b'~');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in items {
                    Self::encode(item, buf);
                }
            }
        }
    }

    /// Encode a single value into an owned buffer
    #[must_use]
    pub fn encode_to_bytes(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode(value, &mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_commands_as_bulk_string_arrays() {
        let req = EncodedRequest::from_args(["PING", "hello"]);
        assert_eq!(&req.as_bytes()[..], b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n");
    }

    #[test]
    fn arguments_are_binary_safe() {
        let req = EncodedRequest::from_args([b"SET".as_ref(), b"k", b"\x00\xff\r\n"]);
        assert_eq!(
            &req.as_bytes()[..],
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\n\x00\xff\r\n\r\n"
        );
    }

    #[test]
    fn encodes_replies() {
        assert_eq!(
            &RespEncoder::encode_to_bytes(&RespValue::SimpleString("OK".into()))[..],
            b"+OK\r\n"
        );
        assert_eq!(&RespEncoder::encode_to_bytes(&RespValue::Null)[..], b"$-1\r\n");
        assert_eq!(
            &RespEncoder::encode_to_bytes(&RespValue::Push(vec![
                RespValue::from("message"),
                RespValue::from("ch"),
                RespValue::from("payload"),
            ]))[..4],
            b">3\r\n"
        );
    }
}
