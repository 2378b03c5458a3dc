//! Pending-request bookkeeping for the communicator
//!
//! The vault keeps every outstanding request twice: in a deque ordered by
//! retry eligibility (front = retried longest ago) and in a map keyed by
//! UUID for O(1) satisfaction. The retry scheduler's unit of work is
//! [`PendingRequestVault::retry_front`]: take the front, stamp it, move it
//! to the back.

use crate::clock::Clock;
use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Status code used when a request outlives the hard deadline.
pub const DEADLINE_EXCEEDED_STATUS: i32 = -1;

/// The other side's answer to a communicator request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorReply {
    /// Application status code; negative values are reserved for synthetic
    /// replies generated by this library.
    pub status: i32,
    /// Application payload
    pub contents: Vec<u8>,
}

impl CommunicatorReply {
    /// The synthetic reply delivered to expired requests.
    #[must_use]
    pub fn deadline_exceeded() -> Self {
        Self {
            status: DEADLINE_EXCEEDED_STATUS,
            contents: b"deadline exceeded".to_vec(),
        }
    }
}

struct PendingItem {
    channel: String,
    contents: Vec<u8>,
    first_issued: Duration,
    last_retry: Duration,
    tx: oneshot::Sender<CommunicatorReply>,
}

/// Data handed back by [`PendingRequestVault::retry_front`].
#[derive(Debug, Clone)]
pub struct RetryItem {
    /// Request UUID
    pub id: String,
    /// Channel the request goes out on
    pub channel: String,
    /// Request payload
    pub contents: Vec<u8>,
}

#[derive(Default)]
struct VaultInner {
    order: VecDeque<String>,
    items: HashMap<String, PendingItem>,
    blocking: bool,
}

/// Tracks outstanding communicator requests.
pub struct PendingRequestVault {
    inner: Mutex<VaultInner>,
    wakeup: Notify,
}

impl PendingRequestVault {
    /// Create an empty vault in blocking mode
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VaultInner {
                blocking: true,
                ..VaultInner::default()
            }),
            wakeup: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VaultInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pending request with a fresh v4 UUID. Returns the id and
    /// the future for its reply.
    pub fn insert(
        &self,
        channel: impl Into<String>,
        contents: impl Into<Vec<u8>>,
        now: Duration,
    ) -> (String, oneshot::Receiver<CommunicatorReply>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            inner.items.insert(
                id.clone(),
                PendingItem {
                    channel: channel.into(),
                    contents: contents.into(),
                    first_issued: now,
                    last_retry: now,
                    tx,
                },
            );
            inner.order.push_back(id.clone());
        }
        self.wakeup.notify_waiters();
        (id, rx)
    }

    /// Fulfil the request with the given id. True if it was pending; a
    /// second satisfy for the same id, or an unknown id, returns false.
    pub fn satisfy(&self, id: &str, reply: CommunicatorReply) -> bool {
        let item = {
            let mut inner = self.lock();
            let Some(item) = inner.items.remove(id) else {
                return false;
            };
            inner.order.retain(|queued| queued != id);
            item
        };
        let _ = item.tx.send(reply);
        true
    }

    /// Move the front entry to the back with `last_retry = now` and return
    /// its data for re-publication. `None` on an empty vault.
    pub fn retry_front(&self, now: Duration) -> Option<RetryItem> {
        let mut inner = self.lock();
        let id = inner.order.pop_front()?;
        inner.order.push_back(id.clone());
        let item = inner.items.get_mut(&id).expect("order entry has an item");
        item.last_retry = now;
        Some(RetryItem {
            id,
            channel: item.channel.clone(),
            contents: item.contents.clone(),
        })
    }

    /// `last_retry` of the entry eligible for the next retry pass, i.e. the
    /// front of the deque.
    pub fn earliest_retry(&self) -> Option<Duration> {
        let inner = self.lock();
        let id = inner.order.front()?;
        Some(inner.items[id].last_retry)
    }

    /// Like [`PendingRequestVault::earliest_retry`], but waits while the
    /// vault is empty. Returns `None` once blocking mode is switched off.
    pub async fn wait_earliest_retry(&self) -> Option<Duration> {
        loop {
            let mut notified = pin!(self.wakeup.notified());
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if let Some(id) = inner.order.front() {
                    return Some(inner.items[id].last_retry);
                }
                if !inner.blocking {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Drop every request with `first_issued <= cutoff`, fulfilling its
    /// future with a deadline-exceeded reply. Returns how many were
    /// dropped.
    pub fn expire(&self, cutoff: Duration) -> usize {
        let expired = {
            let mut inner = self.lock();
            let ids: Vec<String> = inner
                .items
                .iter()
                .filter(|(_, item)| item.first_issued <= cutoff)
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(item) = inner.items.remove(&id) {
                    inner.order.retain(|queued| queued != &id);
                    expired.push(item);
                }
            }
            expired
        };

        let count = expired.len();
        for item in expired {
            let _ = item.tx.send(CommunicatorReply::deadline_exceeded());
        }
        count
    }

    /// Number of outstanding requests
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    /// Turning blocking mode off wakes every waiter; used at shutdown.
    pub fn set_blocking_mode(&self, blocking: bool) {
        self.lock().blocking = blocking;
        self.wakeup.notify_waiters();
    }

    /// Convenience for callers holding a [`Clock`].
    pub fn insert_with_clock(
        &self,
        channel: impl Into<String>,
        contents: impl Into<Vec<u8>>,
        clock: &dyn Clock,
    ) -> (String, oneshot::Receiver<CommunicatorReply>) {
        self.insert(channel, contents, clock.now())
    }
}

impl Default for PendingRequestVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn satisfy_fulfils_exactly_once() {
        let vault = PendingRequestVault::new();
        let (id, mut rx) = vault.insert("ch1", b"123".to_vec(), secs(1));
        assert_eq!(vault.size(), 1);

        assert!(vault.satisfy(
            &id,
            CommunicatorReply {
                status: 0,
                contents: b"answer".to_vec(),
            }
        ));
        assert_eq!(vault.size(), 0);
        assert_eq!(rx.try_recv().unwrap().contents, b"answer");

        // Second satisfy for the same id, and unknown ids, are rejected.
        assert!(!vault.satisfy(
            &id,
            CommunicatorReply {
                status: 0,
                contents: Vec::new(),
            }
        ));
        assert!(!vault.satisfy(
            "11111111-2222-3333-4444-555555555555",
            CommunicatorReply {
                status: 0,
                contents: Vec::new(),
            }
        ));
    }

    #[test]
    fn retry_rotation_updates_earliest() {
        let vault = PendingRequestVault::new();
        let (_id1, _rx1) = vault.insert("ch1", b"123".to_vec(), secs(1));
        let (_id2, _rx2) = vault.insert("ch1", b"1234".to_vec(), secs(2));

        assert_eq!(vault.earliest_retry(), Some(secs(1)));

        let retried = vault.retry_front(secs(3)).unwrap();
        assert_eq!(retried.contents, b"123");
        assert_eq!(vault.earliest_retry(), Some(secs(2)));

        let retried = vault.retry_front(secs(4)).unwrap();
        assert_eq!(retried.contents, b"1234");
        // The original first entry is at the front again, stamped t=3.
        assert_eq!(vault.earliest_retry(), Some(secs(3)));
    }

    #[test]
    fn expire_drops_old_requests() {
        let vault = PendingRequestVault::new();
        let (_id1, mut rx1) = vault.insert("ch", b"old".to_vec(), secs(1));
        let (_id2, mut rx2) = vault.insert("ch", b"new".to_vec(), secs(10));

        assert_eq!(vault.expire(secs(5)), 1);
        assert_eq!(vault.size(), 1);

        let reply = rx1.try_recv().unwrap();
        assert_eq!(reply.status, DEADLINE_EXCEEDED_STATUS);
        assert!(rx2.try_recv().is_err());

        // Retrying never resurrects the expired entry.
        let retried = vault.retry_front(secs(11)).unwrap();
        assert_eq!(retried.contents, b"new");
    }

    #[test]
    fn ids_are_unique_v4_uuids() {
        let vault = PendingRequestVault::new();
        let (id1, _rx1) = vault.insert("ch", b"a".to_vec(), secs(1));
        let (id2, _rx2) = vault.insert("ch", b"b".to_vec(), secs(1));
        assert_ne!(id1, id2);
        assert_eq!(Uuid::parse_str(&id1).unwrap().get_version_num(), 4);
    }

    #[tokio::test]
    async fn unblocking_wakes_waiters() {
        let vault = std::sync::Arc::new(PendingRequestVault::new());
        let waiter = tokio::spawn({
            let vault = vault.clone();
            async move { vault.wait_earliest_retry().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        vault.set_blocking_mode(false);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_wakes_waiters() {
        let vault = std::sync::Arc::new(PendingRequestVault::new());
        let waiter = tokio::spawn({
            let vault = vault.clone();
            async move { vault.wait_earliest_retry().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_id, _rx) = vault.insert("ch", b"x".to_vec(), secs(7));
        assert_eq!(waiter.await.unwrap(), Some(secs(7)));
    }
}
