//! Connection handshakes
//!
//! A handshake is the first traffic on every new connection, ahead of any
//! user request. Multi-stage handshakes run one stage at a time: the next
//! request is provided only after the previous reply validated as
//! incomplete-but-valid, and any invalid reply tears the connection down as
//! a transport failure.
//!
//! Each handshake can produce a fresh copy of itself via
//! [`Handshake::clone_fresh`], which the client driver uses on every
//! reconnect.

use crate::protocol::encoder::EncodedRequest;
use hmac::{Hmac, Mac};
use quark_oxide_core::value::RespValue;
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Verdict on a handshake-stage reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The reply is unacceptable; shut the connection down
    Invalid,
    /// The reply is fine and another stage follows
    ValidIncomplete,
    /// The reply is fine and the handshake is finished
    ValidComplete,
}

/// A (possibly multi-stage) connection handshake.
pub trait Handshake: Send {
    /// The next request to send. Called once at connection start, and again
    /// after every `ValidIncomplete` validation.
    fn provide(&mut self) -> EncodedRequest;

    /// Validate the reply to the most recently provided request.
    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus;

    /// Reset all per-connection state.
    fn restart(&mut self);

    /// A fresh, restarted copy for the next connection.
    fn clone_fresh(&self) -> Box<dyn Handshake>;
}

/// `AUTH <password>`, expects `+OK`.
pub struct AuthHandshake {
    password: String,
}

impl AuthHandshake {
    /// Create with the given password
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl Handshake for AuthHandshake {
    fn provide(&mut self) -> EncodedRequest {
        EncodedRequest::from_args([b"AUTH".as_ref(), self.password.as_bytes()])
    }

    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus {
        if reply.is_ok_status() {
            HandshakeStatus::ValidComplete
        } else {
            HandshakeStatus::Invalid
        }
    }

    fn restart(&mut self) {}

    fn clone_fresh(&self) -> Box<dyn Handshake> {
        Box::new(Self::new(self.password.clone()))
    }
}

/// Number of random bytes contributed by the client side of the HMAC
/// challenge.
pub const HMAC_RANDOM_BYTES: usize = 32;

/// Challenge-response authentication without sending the password over the
/// wire.
///
/// Stage one sends random bytes and receives a challenge; stage two sends
/// the hex-encoded HMAC-SHA256 signature of `random || challenge`, keyed
/// with the password, and expects `+OK`.
pub struct HmacAuthHandshake {
    password: String,
    initiated: bool,
    received_challenge: bool,
    random_bytes: Vec<u8>,
    challenge: Vec<u8>,
}

impl HmacAuthHandshake {
    /// Create with the given password
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            initiated: false,
            received_challenge: false,
            random_bytes: Vec::new(),
            challenge: Vec::new(),
        }
    }

    fn generate_signature(&self) -> String {
        let mut mac = HmacSha256::new_from_slice(self.password.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(&self.random_bytes);
        mac.update(&self.challenge);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl Handshake for HmacAuthHandshake {
    fn provide(&mut self) -> EncodedRequest {
        if !self.initiated {
            self.initiated = true;
            let mut random = vec![0u8; HMAC_RANDOM_BYTES];
            rand::rngs::OsRng.fill_bytes(&mut random);
            self.random_bytes = random;
            return EncodedRequest::from_args([
                b"HMAC-AUTH-GENERATE-CHALLENGE".as_ref(),
                self.random_bytes.as_slice(),
            ]);
        }

        EncodedRequest::from_args([
            b"HMAC-AUTH-VALIDATE-CHALLENGE".as_ref(),
            self.generate_signature().as_bytes(),
        ])
    }

    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus {
        if !self.received_challenge {
            let RespValue::BulkString(challenge) = reply else {
                warn!("unexpected reply type to HMAC challenge request");
                return HandshakeStatus::Invalid;
            };
            self.challenge = challenge.to_vec();
            self.received_challenge = true;
            return HandshakeStatus::ValidIncomplete;
        }

        if reply.is_ok_status() {
            HandshakeStatus::ValidComplete
        } else {
            warn!(?reply, "HMAC signature rejected");
            HandshakeStatus::Invalid
        }
    }

    fn restart(&mut self) {
        self.initiated = false;
        self.received_challenge = false;
        self.random_bytes.clear();
        self.challenge.clear();
    }

    fn clone_fresh(&self) -> Box<dyn Handshake> {
        Box::new(Self::new(self.password.clone()))
    }
}

/// `PING [text]`, expects a matching bulk string, or `PONG` when no text was
/// given.
pub struct PingHandshake {
    text: Option<String>,
}

impl PingHandshake {
    /// Plain `PING`
    #[must_use]
    pub fn new() -> Self {
        Self { text: None }
    }

    /// `PING <text>` echoing the given payload
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

impl Default for PingHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake for PingHandshake {
    fn provide(&mut self) -> EncodedRequest {
        match &self.text {
            Some(text) => EncodedRequest::from_args([b"PING".as_ref(), text.as_bytes()]),
            None => EncodedRequest::from_args([b"PING".as_ref()]),
        }
    }

    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus {
        let expected = self.text.as_deref().unwrap_or("PONG");
        let matches = match reply {
            RespValue::SimpleString(s) => s == expected,
            RespValue::BulkString(b) => b.as_ref() == expected.as_bytes(),
            _ => false,
        };
        if matches {
            HandshakeStatus::ValidComplete
        } else {
            HandshakeStatus::Invalid
        }
    }

    fn restart(&mut self) {}

    fn clone_fresh(&self) -> Box<dyn Handshake> {
        Box::new(Self {
            text: self.text.clone(),
        })
    }
}

/// `ACTIVATE-PUSH-TYPES`, expects `+OK`.
///
/// Enables out-of-band `>` push frames for subscription traffic on servers
/// that support the command. On servers that do not, the subscriber should
/// be run in fallback mode instead of chaining this handshake.
pub struct ActivatePushTypesHandshake;

impl Handshake for ActivatePushTypesHandshake {
    fn provide(&mut self) -> EncodedRequest {
        EncodedRequest::from_args([b"ACTIVATE-PUSH-TYPES".as_ref()])
    }

    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus {
        if reply.is_ok_status() {
            HandshakeStatus::ValidComplete
        } else {
            HandshakeStatus::Invalid
        }
    }

    fn restart(&mut self) {}

    fn clone_fresh(&self) -> Box<dyn Handshake> {
        Box::new(Self)
    }
}

/// `CLIENT SETNAME <name>`. Failure is ignored by default, so the handshake
/// stays compatible with servers that lack the command.
pub struct SetClientNameHandshake {
    name: String,
    ignore_failure: bool,
}

impl SetClientNameHandshake {
    /// Create in compatibility mode (failures ignored)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ignore_failure: true,
        }
    }

    /// Treat a failure reply as a handshake rejection
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.ignore_failure = false;
        self
    }
}

impl Handshake for SetClientNameHandshake {
    fn provide(&mut self) -> EncodedRequest {
        EncodedRequest::from_args([b"CLIENT".as_ref(), b"SETNAME", self.name.as_bytes()])
    }

    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus {
        if reply.is_ok_status() || self.ignore_failure {
            HandshakeStatus::ValidComplete
        } else {
            HandshakeStatus::Invalid
        }
    }

    fn restart(&mut self) {}

    fn clone_fresh(&self) -> Box<dyn Handshake> {
        Box::new(Self {
            name: self.name.clone(),
            ignore_failure: self.ignore_failure,
        })
    }
}

/// Runs two handshakes back to back.
pub struct ChainedHandshake {
    first: Box<dyn Handshake>,
    second: Box<dyn Handshake>,
    first_done: bool,
}

impl ChainedHandshake {
    /// Chain `first` then `second`
    #[must_use]
    pub fn new(first: Box<dyn Handshake>, second: Box<dyn Handshake>) -> Self {
        Self {
            first,
            second,
            first_done: false,
        }
    }
}

impl Handshake for ChainedHandshake {
    fn provide(&mut self) -> EncodedRequest {
        if self.first_done {
            self.second.provide()
        } else {
            self.first.provide()
        }
    }

    fn validate(&mut self, reply: &RespValue) -> HandshakeStatus {
        if self.first_done {
            return self.second.validate(reply);
        }
        match self.first.validate(reply) {
            HandshakeStatus::Invalid => HandshakeStatus::Invalid,
            HandshakeStatus::ValidIncomplete => HandshakeStatus::ValidIncomplete,
            HandshakeStatus::ValidComplete => {
                self.first_done = true;
                // The chain as a whole continues with the second stage.
                HandshakeStatus::ValidIncomplete
            }
        }
    }

    fn restart(&mut self) {
        self.first.restart();
        self.second.restart();
        self.first_done = false;
    }

    fn clone_fresh(&self) -> Box<dyn Handshake> {
        Box::new(Self::new(self.first.clone_fresh(), self.second.clone_fresh()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ok() -> RespValue {
        RespValue::SimpleString("OK".into())
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn auth_flow() {
        let mut hs = AuthHandshake::new("hunter2");
        let req = hs.provide();
        assert_eq!(&req.as_bytes()[..], b"*2\r\n$4\r\nAUTH\r\n$7\r\nhunter2\r\n");
        assert_eq!(hs.validate(&ok()), HandshakeStatus::ValidComplete);

        let mut hs = AuthHandshake::new("hunter2");
        hs.provide();
        assert_eq!(
            hs.validate(&RespValue::Error("ERR invalid password".into())),
            HandshakeStatus::Invalid
        );
    }

    #[test]
    fn hmac_two_step_flow() {
        let mut hs = HmacAuthHandshake::new("secret");
        let first = hs.provide();
        assert!(contains(first.as_bytes(), b"HMAC-AUTH-GENERATE-CHALLENGE"));

        let challenge = b"server-challenge".to_vec();
        assert_eq!(
            hs.validate(&RespValue::BulkString(Bytes::from(challenge.clone()))),
            HandshakeStatus::ValidIncomplete
        );

        // The second request must carry the hex signature of random||challenge.
        let second = hs.provide();
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(&hs.random_bytes);
        mac.update(&challenge);
        let expected = hex::encode(mac.finalize().into_bytes());
        assert!(contains(second.as_bytes(), expected.as_bytes()));

        assert_eq!(hs.validate(&ok()), HandshakeStatus::ValidComplete);
    }

    #[test]
    fn hmac_restart_clears_state() {
        let mut hs = HmacAuthHandshake::new("secret");
        hs.provide();
        hs.validate(&RespValue::BulkString(Bytes::from_static(b"challenge")));
        hs.restart();
        assert!(!hs.initiated);
        assert!(!hs.received_challenge);
        assert!(hs.random_bytes.is_empty());
        assert!(hs.challenge.is_empty());
    }

    #[test]
    fn hmac_rejects_non_string_challenge() {
        let mut hs = HmacAuthHandshake::new("secret");
        hs.provide();
        assert_eq!(
            hs.validate(&RespValue::Integer(5)),
            HandshakeStatus::Invalid
        );
    }

    #[test]
    fn ping_matches_text_or_pong() {
        let mut hs = PingHandshake::with_text("ping #0");
        hs.provide();
        assert_eq!(
            hs.validate(&RespValue::from("ping #0")),
            HandshakeStatus::ValidComplete
        );

        let mut hs = PingHandshake::new();
        hs.provide();
        assert_eq!(
            hs.validate(&RespValue::SimpleString("PONG".into())),
            HandshakeStatus::ValidComplete
        );
        assert_eq!(
            hs.validate(&RespValue::SimpleString("NOPE".into())),
            HandshakeStatus::Invalid
        );
    }

    #[test]
    fn setname_ignores_failure_by_default() {
        let mut hs = SetClientNameHandshake::new("flusher-1");
        hs.provide();
        assert_eq!(
            hs.validate(&RespValue::Error("ERR unknown command".into())),
            HandshakeStatus::ValidComplete
        );

        let mut strict = SetClientNameHandshake::new("flusher-1").strict();
        strict.provide();
        assert_eq!(
            strict.validate(&RespValue::Error("ERR unknown command".into())),
            HandshakeStatus::Invalid
        );
    }

    #[test]
    fn chained_runs_stages_in_order() {
        let mut hs = ChainedHandshake::new(
            Box::new(AuthHandshake::new("pw")),
            Box::new(ActivatePushTypesHandshake),
        );

        let first = hs.provide();
        assert!(contains(first.as_bytes(), b"AUTH"));
        assert_eq!(hs.validate(&ok()), HandshakeStatus::ValidIncomplete);

        let second = hs.provide();
        assert!(contains(second.as_bytes(), b"ACTIVATE-PUSH-TYPES"));
        assert_eq!(hs.validate(&ok()), HandshakeStatus::ValidComplete);

        // A fresh clone starts over from stage one.
        let mut fresh = hs.clone_fresh();
        let req = fresh.provide();
        assert!(contains(req.as_bytes(), b"AUTH"));
    }

    #[test]
    fn chained_propagates_invalid() {
        let mut hs = ChainedHandshake::new(
            Box::new(AuthHandshake::new("pw")),
            Box::new(ActivatePushTypesHandshake),
        );
        hs.provide();
        assert_eq!(
            hs.validate(&RespValue::Error("ERR nope".into())),
            HandshakeStatus::Invalid
        );
    }
}
