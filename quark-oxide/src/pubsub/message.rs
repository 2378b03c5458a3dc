//! Pub/sub message parsing
//!
//! Subscription traffic arrives either as plain arrays (RESP2 subscription
//! mode) or as `>` push frames (with push types active). QuarkDB prefixes
//! push frames with a `pubsub` marker element; both the prefixed and the
//! bare layout are accepted.

use quark_oxide_core::value::RespValue;

/// Kind of pub/sub message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Subscription confirmation
    Subscribe,
    /// Unsubscription confirmation
    Unsubscribe,
    /// Payload on a subscribed channel
    Message,
    /// Pattern subscription confirmation
    PatternSubscribe,
    /// Pattern unsubscription confirmation
    PatternUnsubscribe,
    /// Payload matching a subscribed pattern
    PatternMessage,
}

impl MessageType {
    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "message" => Some(Self::Message),
            "psubscribe" => Some(Self::PatternSubscribe),
            "punsubscribe" => Some(Self::PatternUnsubscribe),
            "pmessage" => Some(Self::PatternMessage),
            _ => None,
        }
    }
}

/// One decoded pub/sub message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// What kind of message this is
    pub message_type: MessageType,
    /// The channel the message concerns
    pub channel: String,
    /// The matched pattern, for pattern messages
    pub pattern: Option<String>,
    /// The payload; binary-safe
    pub payload: Vec<u8>,
    /// Number of active subscriptions, on (un)subscribe confirmations
    pub active_subscriptions: Option<i64>,
}

impl Message {
    /// Build a plain channel message, e.g. for test injection
    pub fn message(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type: MessageType::Message,
            channel: channel.into(),
            pattern: None,
            payload: payload.into(),
            active_subscriptions: None,
        }
    }

    /// The payload as UTF-8, lossy
    #[must_use]
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn extract_string(value: &RespValue) -> Option<String> {
    match value {
        RespValue::SimpleString(s) => Some(s.clone()),
        RespValue::BulkString(b) => String::from_utf8(b.to_vec()).ok(),
        _ => None,
    }
}

fn extract_bytes(value: &RespValue) -> Option<Vec<u8>> {
    match value {
        RespValue::SimpleString(s) => Some(s.as_bytes().to_vec()),
        RespValue::BulkString(b) => Some(b.to_vec()),
        _ => None,
    }
}

fn extract_integer(value: &RespValue) -> Option<i64> {
    match value {
        RespValue::Integer(i) => Some(*i),
        _ => None,
    }
}

/// Parse a reply as a pub/sub message. `None` if the reply does not look
/// like one.
#[must_use]
pub fn parse_message(reply: &RespValue) -> Option<Message> {
    let items = match reply {
        RespValue::Array(items) | RespValue::Push(items) => items,
        _ => return None,
    };

    // QuarkDB push frames carry a leading "pubsub" marker.
    let base = match items.first().and_then(extract_string) {
        Some(marker) if marker == "pubsub" => 1,
        _ => 0,
    };

    let kind = extract_string(items.get(base)?)?;
    let message_type = MessageType::from_kind(&kind)?;

    match message_type {
        MessageType::Message => {
            if items.len() != base + 3 {
                return None;
            }
            Some(Message {
                message_type,
                channel: extract_string(&items[base + 1])?,
                pattern: None,
                payload: extract_bytes(&items[base + 2])?,
                active_subscriptions: None,
            })
        }
        MessageType::PatternMessage => {
            if items.len() != base + 4 {
                return None;
            }
            Some(Message {
                message_type,
                pattern: Some(extract_string(&items[base + 1])?),
                channel: extract_string(&items[base + 2])?,
                payload: extract_bytes(&items[base + 3])?,
                active_subscriptions: None,
            })
        }
        MessageType::Subscribe | MessageType::Unsubscribe => {
            if items.len() != base + 3 {
                return None;
            }
            Some(Message {
                message_type,
                channel: extract_string(&items[base + 1])?,
                pattern: None,
                payload: Vec::new(),
                active_subscriptions: Some(extract_integer(&items[base + 2])?),
            })
        }
        MessageType::PatternSubscribe | MessageType::PatternUnsubscribe => {
            if items.len() != base + 3 {
                return None;
            }
            Some(Message {
                message_type,
                pattern: Some(extract_string(&items[base + 1])?),
                channel: String::new(),
                payload: Vec::new(),
                active_subscriptions: Some(extract_integer(&items[base + 2])?),
            })
        }
    }
}
