//! Error types for client operations

use std::io;
use thiserror::Error;

/// Result type for client operations
pub type QuarkResult<T> = Result<T, QuarkError>;

/// Comprehensive error type for client operations
#[derive(Error, Debug)]
pub enum QuarkError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error
    #[error("Server error: {0}")]
    Server(String),

    /// MOVED redirect, another endpoint owns the requested key
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// No endpoint could even be attempted
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Hostname resolution produced no usable endpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// Handshake stage rejected the server response
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl QuarkError {
    /// Parse a server error message to check for a MOVED redirect
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let moved_str = msg.strip_prefix("MOVED ")?;
        let parts: Vec<&str> = moved_str.split_whitespace().collect();
        if parts.len() != 2 {
            return None;
        }
        let slot = parts[0].parse::<u16>().ok()?;
        let (host, port) = parts[1].rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        Some(Self::Moved {
            slot,
            host: host.to_string(),
            port,
        })
    }

    /// Check if this error is a redirect
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            Self::Moved { host, port, .. } => Some((host.clone(), *port)),
            _ => None,
        }
    }
}
