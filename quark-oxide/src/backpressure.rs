//! Producer throttling
//!
//! With [`BackpressureStrategy::RateLimitPendingRequests`], `execute()`
//! blocks cooperatively once the configured number of requests is
//! unacknowledged, and unblocks as acknowledgements release slots. A client
//! shutting down aborts the wait promptly.

use quark_oxide_core::config::BackpressureStrategy;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::Semaphore;

/// Gate applied on every `execute()`.
pub(crate) struct BackpressureGate {
    semaphore: Option<Arc<Semaphore>>,
}

impl BackpressureGate {
    pub(crate) fn new(strategy: BackpressureStrategy) -> Self {
        Self {
            semaphore: strategy.limit().map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Reserve one slot, waiting if the limit is reached. Returns `false`
    /// if the shutdown signal fired first.
    pub(crate) async fn acquire(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let Some(semaphore) = &self.semaphore else {
            return !*shutdown.borrow();
        };

        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            permit = semaphore.acquire() => {
                // The semaphore is never closed, so acquisition can only
                // succeed here.
                permit.expect("backpressure semaphore closed").forget();
                true
            }
            _ = wait_true(&mut shutdown) => false,
        }
    }

    /// Release one slot.
    pub(crate) fn release(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.add_permits(1);
        }
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn limits_pending_slots() {
        let (_tx, rx) = no_shutdown();
        let gate = BackpressureGate::new(BackpressureStrategy::RateLimitPendingRequests(2));

        assert!(gate.acquire(rx.clone()).await);
        assert!(gate.acquire(rx.clone()).await);

        // Third acquisition must block.
        let blocked = timeout(Duration::from_millis(50), gate.acquire(rx.clone())).await;
        assert!(blocked.is_err());

        // One release unblocks exactly one waiter.
        gate.release();
        assert!(timeout(Duration::from_millis(50), gate.acquire(rx))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn infinite_strategy_never_blocks() {
        let (_tx, rx) = no_shutdown();
        let gate = BackpressureGate::new(BackpressureStrategy::Infinite);
        for _ in 0..10_000 {
            assert!(gate.acquire(rx.clone()).await);
        }
    }

    #[tokio::test]
    async fn shutdown_aborts_blocked_acquire() {
        let (tx, rx) = no_shutdown();
        let gate = BackpressureGate::new(BackpressureStrategy::RateLimitPendingRequests(1));
        assert!(gate.acquire(rx.clone()).await);

        let waiter = tokio::spawn({
            let rx = rx.clone();
            let gate_sem = gate.semaphore.clone();
            async move {
                let gate = BackpressureGate {
                    semaphore: gate_sem,
                };
                gate.acquire(rx).await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn acquire_fails_fast_when_already_shut_down() {
        let (tx, rx) = no_shutdown();
        tx.send(true).unwrap();
        let gate = BackpressureGate::new(BackpressureStrategy::RateLimitPendingRequests(8));
        assert!(!gate.acquire(rx).await);
    }
}
