//! Async QuarkDB/Redis client for Rust
//!
//! `quark-oxide` keeps a single long-lived, reconnecting, pipelined
//! connection to a Redis-compatible (RESP2/RESP3) server. Requests are
//! staged into a FIFO queue, flushed by a writer loop and matched to replies
//! in flush order by a reader loop. On any transport failure the client
//! reconnects with exponential backoff and, depending on the configured
//! [`RetryStrategy`], replays or fails in-flight requests. Single-hop
//! `MOVED` redirects can be followed transparently.
//!
//! On top of the connection core sit three subsystems:
//!
//! - [`pubsub::Subscriber`] — pub/sub multiplexing on a dedicated
//!   connection, using out-of-band push frames where the server supports
//!   them.
//! - [`flusher::BackgroundFlusher`] — a durable at-least-once write-behind
//!   queue over a pluggable persistency layer.
//! - [`shared`] — request/response exchange over pub/sub with UUID
//!   correlation, plus a transient last-writer-wins shared hash.
//!
//! # Quick Start
//!
//! ```no_run
//! use quark_oxide::{Client, Members, Options};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(Members::new("localhost", 7777), Options::default());
//!
//!     let reply = client.execute(&["SET", "mykey", "myvalue"]).await;
//!     println!("Reply: {:?}", reply);
//!     client.shutdown().await;
//! }
//! ```
//!
//! A completion of `None` always means the library could not guarantee the
//! command reached the server and got an answer; deciding whether a retry is
//! safe is the caller's duty.

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::module_name_repetitions)]

pub mod backpressure;
pub mod client;
pub mod clock;
pub mod executor;
pub mod flusher;
pub mod handshake;
pub mod protocol;
pub mod pubsub;
pub mod resolver;
pub mod shared;
pub mod staging;
pub mod stream;

pub use client::{Client, ClientBuilder, ReplyFuture};
pub use quark_oxide_core::{
    config::{BackpressureStrategy, Options, RetryStrategy, TlsConfig},
    error::{QuarkError, QuarkResult},
    types::{AddressFamily, Endpoint, Members, ServiceEndpoint, SocketType},
    value::RespValue,
};
