//! Pub/sub support
//!
//! A [`Subscriber`] multiplexes any number of channel and pattern
//! subscriptions over one dedicated client connection. On servers that
//! support out-of-band push frames the same connection stays usable for
//! regular commands; on plain RESP2 servers the subscriber runs the
//! connection in full-listener fallback mode instead.

pub mod message;
pub mod subscriber;

pub use message::{parse_message, Message, MessageType};
pub use subscriber::{Subscriber, Subscription};
