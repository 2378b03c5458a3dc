//! RESP wire protocol
//!
//! Encoding of outbound commands and incremental decoding of inbound
//! replies, covering the RESP2 frame set and the RESP3 extensions.

pub mod encoder;
pub mod parser;

pub use encoder::{EncodedRequest, RespEncoder};
pub use parser::{ParseOutcome, ResponseParser};

/// Protocol version enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// RESP2 (Redis Serialization Protocol version 2)
    #[default]
    Resp2,
    /// RESP3 (Redis Serialization Protocol version 3)
    Resp3,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resp2 => write!(f, "RESP2"),
            Self::Resp3 => write!(f, "RESP3"),
        }
    }
}
