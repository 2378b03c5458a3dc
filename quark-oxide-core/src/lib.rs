//! Core types shared by the quark-oxide client crates.
//!
//! This crate contains the protocol value type, error type, connection
//! options and endpoint types. It has no networking dependencies and can be
//! used by code that only needs to inspect replies or build configuration.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{BackpressureStrategy, Options, RetryStrategy, TlsConfig};
pub use error::{QuarkError, QuarkResult};
pub use types::{AddressFamily, Endpoint, Members, ServiceEndpoint, SocketType};
pub use value::RespValue;
