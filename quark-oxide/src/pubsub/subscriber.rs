//! Channel multiplexing over a dedicated connection

use crate::client::Client;
use crate::handshake::{ActivatePushTypesHandshake, ChainedHandshake, Handshake};
use crate::protocol::encoder::EncodedRequest;
use crate::pubsub::message::{Message, MessageType};
use futures_util::Stream;
use quark_oxide_core::config::Options;
use quark_oxide_core::types::Members;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct Registry {
    channels: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    patterns: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
}

/// Handle to one channel or pattern subscription. Messages on the same
/// channel arrive in the order the server sent them; there is no
/// cross-channel ordering guarantee.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Receive the next message. `None` once the subscriber is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Owns a dedicated client connection for pub/sub traffic and fans incoming
/// messages out to [`Subscription`] handles.
pub struct Subscriber {
    client: Client,
    registry: Arc<Mutex<Registry>>,
    feed_tx: mpsc::UnboundedSender<Message>,
    dispatch: JoinHandle<()>,
    resubscriber: JoinHandle<()>,
}

impl Subscriber {
    /// Subscriber for servers supporting out-of-band push frames: the
    /// connection handshake chains `ACTIVATE-PUSH-TYPES` and the connection
    /// stays usable for regular commands.
    pub fn new(members: Members, options: Options) -> Self {
        Self::build(members, options, Some(Box::new(ActivatePushTypesHandshake)), false)
    }

    /// Like [`Subscriber::new`], with a user handshake running before
    /// `ACTIVATE-PUSH-TYPES` (e.g. authentication).
    pub fn with_handshake(
        members: Members,
        options: Options,
        handshake: Box<dyn Handshake>,
    ) -> Self {
        let chained = Box::new(ChainedHandshake::new(
            handshake,
            Box::new(ActivatePushTypesHandshake),
        ));
        Self::build(members, options, Some(chained), false)
    }

    /// Fallback for plain RESP2 servers: the connection is dedicated to
    /// subscription traffic and every reply is treated as a pub/sub
    /// message.
    pub fn without_push_types(members: Members, options: Options) -> Self {
        Self::build(members, options, None, true)
    }

    fn build(
        members: Members,
        options: Options,
        handshake: Option<Box<dyn Handshake>>,
        full_listener: bool,
    ) -> Self {
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<Message>();
        let registry = Arc::new(Mutex::new(Registry::default()));

        let mut builder = Client::builder(members, options).listener(feed_tx.clone(), full_listener);
        if let Some(handshake) = handshake {
            builder = builder.handshake(handshake);
        }
        let client = builder.build();

        let dispatch = tokio::spawn({
            let registry = registry.clone();
            async move {
                while let Some(msg) = feed_rx.recv().await {
                    dispatch_message(&registry, msg);
                }
            }
        });

        let resubscriber = tokio::spawn({
            let registry = registry.clone();
            let client = client.clone();
            let mut epochs = client.reconnection_watch();
            async move {
                while epochs.changed().await.is_ok() {
                    let (channels, patterns) = {
                        let reg = lock(&registry);
                        (
                            reg.channels.keys().cloned().collect::<Vec<_>>(),
                            reg.patterns.keys().cloned().collect::<Vec<_>>(),
                        )
                    };
                    debug!(
                        channels = channels.len(),
                        patterns = patterns.len(),
                        "re-issuing subscriptions after reconnect"
                    );
                    for channel in channels {
                        client
                            .enqueue_discard(EncodedRequest::from_args([
                                b"SUBSCRIBE".as_ref(),
                                channel.as_bytes(),
                            ]))
                            .await;
                    }
                    for pattern in patterns {
                        client
                            .enqueue_discard(EncodedRequest::from_args([
                                b"PSUBSCRIBE".as_ref(),
                                pattern.as_bytes(),
                            ]))
                            .await;
                    }
                }
            }
        });

        Self {
            client,
            registry,
            feed_tx,
            dispatch,
            resubscriber,
        }
    }

    /// Subscribe to a channel.
    pub async fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry)
            .channels
            .entry(channel.clone())
            .or_default()
            .push(tx);
        self.client
            .enqueue_discard(EncodedRequest::from_args([
                b"SUBSCRIBE".as_ref(),
                channel.as_bytes(),
            ]))
            .await;
        Subscription { rx }
    }

    /// Subscribe to a glob-style pattern.
    pub async fn psubscribe(&self, pattern: impl Into<String>) -> Subscription {
        let pattern = pattern.into();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry)
            .patterns
            .entry(pattern.clone())
            .or_default()
            .push(tx);
        self.client
            .enqueue_discard(EncodedRequest::from_args([
                b"PSUBSCRIBE".as_ref(),
                pattern.as_bytes(),
            ]))
            .await;
        Subscription { rx }
    }

    /// Drop all local subscriptions for a channel and tell the server.
    pub async fn unsubscribe(&self, channel: &str) {
        lock(&self.registry).channels.remove(channel);
        self.client
            .enqueue_discard(EncodedRequest::from_args([
                b"UNSUBSCRIBE".as_ref(),
                channel.as_bytes(),
            ]))
            .await;
    }

    /// Inject a synthetic message, as if the server had sent it. Test
    /// plumbing.
    pub fn feed_fake_message(&self, msg: Message) {
        let _ = self.feed_tx.send(msg);
    }

    /// The underlying client. With push types active it can be used for
    /// regular commands, e.g. `PUBLISH`.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.client.close();
        self.dispatch.abort();
        self.resubscriber.abort();
    }
}

fn lock(registry: &Arc<Mutex<Registry>>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dispatch_message(registry: &Arc<Mutex<Registry>>, msg: Message) {
    let mut reg = lock(registry);
    let sinks = match msg.message_type {
        MessageType::Message | MessageType::Subscribe | MessageType::Unsubscribe => {
            reg.channels.get_mut(&msg.channel)
        }
        MessageType::PatternMessage
        | MessageType::PatternSubscribe
        | MessageType::PatternUnsubscribe => match &msg.pattern {
            Some(pattern) => reg.patterns.get_mut(pattern),
            None => None,
        },
    };

    if let Some(sinks) = sinks {
        sinks.retain(|sink| sink.send(msg.clone()).is_ok());
    }
}
