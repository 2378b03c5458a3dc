//! RESP (`REdis` Serialization Protocol) value types

use crate::error::{QuarkError, QuarkResult};
use bytes::Bytes;

/// A single decoded RESP reply.
///
/// Covers both the RESP2 frame set and the RESP3 extensions. Push frames are
/// kept distinct from arrays so out-of-band subscription traffic can be
/// routed without consuming a pipelined reply slot.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Null reply: `$-1\r\n`, `*-1\r\n` or `_\r\n`
    Null,
    /// Simple string: `+OK\r\n`
    SimpleString(String),
    /// Error: `-ERR message\r\n`
    Error(String),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar\r\n`
    BulkString(Bytes),
    /// Array: `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`
    Array(Vec<RespValue>),
    /// Out-of-band push frame: `>3\r\n...`
    Push(Vec<RespValue>),
    /// Double: `,1.23\r\n`
    Double(f64),
    /// Boolean: `#t\r\n` / `#f\r\n`
    Boolean(bool),
    /// Arbitrary precision number: `(3492890328409238509\r\n`
    BigNumber(String),
    /// Verbatim string: `=15\r\ntxt:Some string\r\n`
    Verbatim {
        /// Three-letter format tag, e.g. `txt` or `mkd`
        format: String,
        /// The string body
        data: Bytes,
    },
    /// Map: `%2\r\n...` — kept as pairs, the wire order is preserved
    Map(Vec<(RespValue, RespValue)>),
    /// Set: `~3\r\n...` — kept as a vector, the wire order is preserved
    Set(Vec<RespValue>),
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> QuarkResult<String> {
        match self {
            Self::SimpleString(s) | Self::BigNumber(s) => Ok(s.clone()),
            Self::BulkString(b) | Self::Verbatim { data: b, .. } => {
                String::from_utf8(b.to_vec())
                    .map_err(|e| QuarkError::Type(format!("Invalid UTF-8: {e}")))
            }
            Self::Integer(i) => Ok(i.to_string()),
            Self::Null => Err(QuarkError::Type("Value is null".to_string())),
            _ => Err(QuarkError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> QuarkResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Boolean(true) => Ok(1),
            Self::Boolean(false) => Ok(0),
            Self::SimpleString(s) => s
                .parse::<i64>()
                .map_err(|e| QuarkError::Type(format!("Cannot parse integer: {e}"))),
            Self::BulkString(b) => {
                let s = String::from_utf8(b.to_vec())
                    .map_err(|e| QuarkError::Type(format!("Invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| QuarkError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(QuarkError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> QuarkResult<Bytes> {
        match self {
            Self::BulkString(b) | Self::Verbatim { data: b, .. } => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
            Self::Null => Err(QuarkError::Type("Value is null".to_string())),
            _ => Err(QuarkError::Type(format!("Cannot convert {self:?} to bytes"))),
        }
    }

    /// Convert to an array if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value is neither an array nor a push frame.
    pub fn as_array(&self) -> QuarkResult<Vec<Self>> {
        match self {
            Self::Array(arr) | Self::Push(arr) => Ok(arr.clone()),
            _ => Err(QuarkError::Type(format!("Cannot convert {self:?} to array"))),
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error reply
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Check if this is an out-of-band push frame
    #[must_use]
    pub const fn is_push(&self) -> bool {
        matches!(self, Self::Push(_))
    }

    /// Check for the `+OK` status reply
    #[must_use]
    pub fn is_ok_status(&self) -> bool {
        matches!(self, Self::SimpleString(s) if s == "OK")
    }

    /// Extract the error message if this is an error reply
    #[must_use]
    pub fn into_error(self) -> Option<String> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::from(s.as_bytes().to_vec()))
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}

impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}
