//! Transient shared hash
//!
//! An eventually-consistent map maintained by broadcasting every mutation
//! on a pub/sub channel. Writers publish a serialized batch and apply it
//! locally; every participant applies incoming batches under a writer lock.
//! Conflict resolution is last-writer-wins by arrival order; loss and
//! reordering are acceptable. Intended for heartbeats and high-churn stats,
//! not for anything that must survive.

use crate::client::Client;
use crate::protocol::encoder::EncodedRequest;
use crate::pubsub::message::MessageType;
use crate::pubsub::subscriber::Subscriber;
use crate::shared::binary;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;

/// Map replica fed by pub/sub broadcasts.
pub struct TransientSharedHash {
    client: Client,
    channel: String,
    map: Arc<RwLock<HashMap<String, String>>>,
    dispatch: JoinHandle<()>,
}

impl TransientSharedHash {
    /// Subscribe to the channel and start applying incoming updates.
    pub async fn new(subscriber: &Subscriber, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let client = subscriber.client().clone();
        let map: Arc<RwLock<HashMap<String, String>>> = Arc::new(RwLock::new(HashMap::new()));

        let mut subscription = subscriber.subscribe(channel.clone()).await;
        let dispatch = tokio::spawn({
            let map = map.clone();
            let channel = channel.clone();
            async move {
                while let Some(msg) = subscription.next().await {
                    if msg.message_type != MessageType::Message || msg.channel != channel {
                        continue;
                    }
                    let Some(batch) = binary::parse_batch(&msg.payload) else {
                        continue;
                    };
                    let mut locked = map.write().unwrap_or_else(PoisonError::into_inner);
                    for (key, value) in batch {
                        locked.insert(key, value);
                    }
                }
            }
        });

        Self {
            client,
            channel,
            map,
            dispatch,
        }
    }

    /// Set a single key.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.set_batch(vec![(key.into(), value.into())]).await;
    }

    /// Broadcast a batch of updates and apply it locally.
    pub async fn set_batch(&self, batch: Vec<(String, String)>) {
        if batch.is_empty() {
            return;
        }
        let payload = binary::serialize_batch(&batch);
        let request = EncodedRequest::from_args([
            b"PUBLISH".as_ref(),
            self.channel.as_bytes(),
            &payload[..],
        ]);
        let _ = self.client.enqueue(request).await;

        let mut locked = self.map.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in batch {
            locked.insert(key, value);
        }
    }

    /// Read a key from the local replica.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Number of keys in the local replica
    pub fn len(&self) -> usize {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the local replica is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TransientSharedHash {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}
