//! Request/response over pub/sub
//!
//! A [`Communicator`] publishes UUID-tagged requests on a channel and
//! resolves the matching futures when the reply, tagged with the same UUID,
//! comes back on the same channel. Unanswered requests are re-published
//! every `retry_interval` and abandoned after `hard_deadline` with a
//! synthetic deadline-exceeded reply.
//!
//! The other side of the exchange is a [`CommunicatorListener`]: it
//! collects incoming requests in arrival order, suppresses re-deliveries of
//! retried requests it has already seen, and sends replies by publishing
//! them back on the channel.
//!
//! This is meant for infrequent coordination traffic; for high-volume
//! messaging a direct connection always beats this contraption.

use crate::client::Client;
use crate::clock::{Clock, SystemClock};
use crate::protocol::encoder::EncodedRequest;
use crate::pubsub::message::MessageType;
use crate::pubsub::subscriber::Subscriber;
use crate::shared::binary;
use crate::shared::vault::{CommunicatorReply, PendingRequestVault};
use std::collections::{HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default spacing between retry passes
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Default age at which a request is abandoned
pub const DEFAULT_HARD_DEADLINE: Duration = Duration::from_secs(30);

async fn publish(client: &Client, channel: &str, payload: &[u8]) {
    // Fire-and-forget: the PUBLISH reply (the subscriber count) is not
    // interesting, but the command still pipelines in order.
    let request =
        EncodedRequest::from_args([b"PUBLISH".as_ref(), channel.as_bytes(), payload]);
    let _ = client.enqueue(request).await;
}

/// One retry pass: expire over-deadline requests, then re-publish every
/// entry whose last retry is at least `retry_interval` old.
async fn retry_pass(
    client: &Client,
    channel: &str,
    vault: &PendingRequestVault,
    retry_interval: Duration,
    hard_deadline: Duration,
    now: Duration,
) -> usize {
    if let Some(cutoff) = now.checked_sub(hard_deadline) {
        let dropped = vault.expire(cutoff);
        if dropped > 0 {
            debug!(dropped, "expired communicator requests past hard deadline");
        }
    }

    let mut republished = 0;
    while let Some(last_retry) = vault.earliest_retry() {
        if last_retry + retry_interval > now {
            break;
        }
        let Some(item) = vault.retry_front(now) else {
            break;
        };
        publish(
            client,
            channel,
            &binary::serialize_request(&item.id, &item.contents),
        )
        .await;
        republished += 1;
    }
    republished
}

/// The requesting side of the exchange.
///
/// Borrows the subscriber's connection for publishing; the subscriber must
/// be running with push types active so the connection accepts regular
/// commands.
pub struct Communicator {
    client: Client,
    channel: String,
    vault: Arc<PendingRequestVault>,
    clock: Arc<dyn Clock>,
    retry_interval: Duration,
    hard_deadline: Duration,
    dispatch: JoinHandle<()>,
    retry_timer: JoinHandle<()>,
}

impl Communicator {
    /// Create with the default retry interval and hard deadline, driven by
    /// the wall clock.
    pub async fn new(subscriber: &Subscriber, channel: impl Into<String>) -> Self {
        Self::with_timing(
            subscriber,
            channel,
            Arc::new(SystemClock::new()),
            DEFAULT_RETRY_INTERVAL,
            DEFAULT_HARD_DEADLINE,
        )
        .await
    }

    /// Full control over the clock and the retry/deadline parameters.
    pub async fn with_timing(
        subscriber: &Subscriber,
        channel: impl Into<String>,
        clock: Arc<dyn Clock>,
        retry_interval: Duration,
        hard_deadline: Duration,
    ) -> Self {
        let channel = channel.into();
        let client = subscriber.client().clone();
        let vault = Arc::new(PendingRequestVault::new());

        let mut subscription = subscriber.subscribe(channel.clone()).await;
        let dispatch = tokio::spawn({
            let vault = vault.clone();
            let channel = channel.clone();
            async move {
                while let Some(msg) = subscription.next().await {
                    if msg.message_type != MessageType::Message || msg.channel != channel {
                        continue;
                    }
                    if let Some((uuid, reply)) = binary::parse_reply(&msg.payload) {
                        vault.satisfy(&uuid, reply);
                    }
                    // Requests and unknown UUIDs are ignored; this side
                    // only consumes replies.
                }
            }
        });

        let retry_timer = tokio::spawn(retry_loop(
            client.clone(),
            channel.clone(),
            vault.clone(),
            clock.clone(),
            retry_interval,
            hard_deadline,
        ));

        Self {
            client,
            channel,
            vault,
            clock,
            retry_interval,
            hard_deadline,
            dispatch,
            retry_timer,
        }
    }

    /// Publish a request and return the future for its reply.
    pub async fn issue(
        &self,
        contents: impl Into<Vec<u8>>,
    ) -> oneshot::Receiver<CommunicatorReply> {
        self.issue_tracked(contents).await.1
    }

    /// Like [`Communicator::issue`], also returning the assigned UUID.
    pub async fn issue_tracked(
        &self,
        contents: impl Into<Vec<u8>>,
    ) -> (String, oneshot::Receiver<CommunicatorReply>) {
        let contents = contents.into();
        let (id, rx) =
            self.vault
                .insert(self.channel.as_str(), contents.clone(), self.clock.now());
        publish(
            &self.client,
            &self.channel,
            &binary::serialize_request(&id, &contents),
        )
        .await;
        (id, rx)
    }

    /// Run one retry pass at the given instant. The background timer calls
    /// this with the wall clock; tests drive it with a simulated one.
    pub async fn retry_pass(&self, now: Duration) -> usize {
        retry_pass(
            &self.client,
            &self.channel,
            &self.vault,
            self.retry_interval,
            self.hard_deadline,
            now,
        )
        .await
    }

    /// Number of requests still awaiting a reply
    pub fn pending(&self) -> usize {
        self.vault.size()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.vault.set_blocking_mode(false);
        self.dispatch.abort();
        self.retry_timer.abort();
    }
}

async fn retry_loop(
    client: Client,
    channel: String,
    vault: Arc<PendingRequestVault>,
    clock: Arc<dyn Clock>,
    retry_interval: Duration,
    hard_deadline: Duration,
) {
    loop {
        // Blocks while the vault is empty; None once blocking mode is off.
        let Some(earliest) = vault.wait_earliest_retry().await else {
            return;
        };

        let now = clock.now();
        let due = earliest + retry_interval;
        if due > now {
            tokio::time::sleep(due - now).await;
            continue;
        }

        retry_pass(&client, &channel, &vault, retry_interval, hard_deadline, now).await;
    }
}

/// A request received by a [`CommunicatorListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorRequest {
    id: String,
    contents: Vec<u8>,
}

impl CommunicatorRequest {
    /// The correlation UUID to reply with
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The request payload
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }
}

/// Bounded remember-the-last-N set for duplicate suppression: retried
/// requests arrive again and must not be processed twice.
struct LastNSet {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl LastNSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// True if the value was not seen before
    fn insert(&mut self, value: String) -> bool {
        if self.seen.contains(&value) {
            return false;
        }
        self.seen.insert(value.clone());
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct ListenerInner {
    queue: Mutex<VecDeque<CommunicatorRequest>>,
    seen: Mutex<LastNSet>,
    arrivals: Notify,
}

impl ListenerInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<CommunicatorRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The serving side of the exchange: receives requests, replies by UUID.
pub struct CommunicatorListener {
    client: Client,
    channel: String,
    inner: Arc<ListenerInner>,
    dispatch: JoinHandle<()>,
}

/// How many processed request ids the listener remembers for duplicate
/// suppression.
const LISTENER_DEDUP_CAPACITY: usize = 1024;

impl CommunicatorListener {
    /// Subscribe to the channel and start collecting requests.
    pub async fn new(subscriber: &Subscriber, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let client = subscriber.client().clone();
        let inner = Arc::new(ListenerInner {
            queue: Mutex::new(VecDeque::new()),
            seen: Mutex::new(LastNSet::new(LISTENER_DEDUP_CAPACITY)),
            arrivals: Notify::new(),
        });

        let mut subscription = subscriber.subscribe(channel.clone()).await;
        let dispatch = tokio::spawn({
            let inner = inner.clone();
            let channel = channel.clone();
            async move {
                while let Some(msg) = subscription.next().await {
                    if msg.message_type != MessageType::Message || msg.channel != channel {
                        continue;
                    }
                    let Some((id, contents)) = binary::parse_request(&msg.payload) else {
                        // Replies on the same channel parse as requests only
                        // by accident; anything unparseable is not for us.
                        continue;
                    };
                    let newly_seen = inner
                        .seen
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id.clone());
                    if !newly_seen {
                        continue;
                    }
                    inner.queue().push_back(CommunicatorRequest { id, contents });
                    inner.arrivals.notify_waiters();
                }
            }
        });

        Self {
            client,
            channel,
            inner,
            dispatch,
        }
    }

    /// Requests waiting to be processed
    pub fn size(&self) -> usize {
        self.inner.queue().len()
    }

    /// The oldest waiting request, without removing it
    pub fn front(&self) -> Option<CommunicatorRequest> {
        self.inner.queue().front().cloned()
    }

    /// Remove and return the oldest waiting request
    pub fn pop_front(&self) -> Option<CommunicatorRequest> {
        self.inner.queue().pop_front()
    }

    /// Wait for the next request.
    pub async fn next(&self) -> CommunicatorRequest {
        loop {
            let mut notified = pin!(self.inner.arrivals.notified());
            notified.as_mut().enable();
            if let Some(request) = self.pop_front() {
                return request;
            }
            notified.await;
        }
    }

    /// Publish a reply for the given request UUID.
    pub async fn send_reply(&self, status: i32, uuid: &str, contents: impl Into<Vec<u8>>) {
        let reply = CommunicatorReply {
            status,
            contents: contents.into(),
        };
        publish(
            &self.client,
            &self.channel,
            &binary::serialize_reply(uuid, &reply),
        )
        .await;
    }
}

impl Drop for CommunicatorListener {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}
