//! Request staging queue
//!
//! The stager owns the FIFO of in-flight requests and the two write-side
//! cursors. Sequence numbers are monotonic over the lifetime of the client:
//!
//! ```text
//! base_seq <= acked_seq <= flushed_seq <= next_seq
//! ```
//!
//! `queue[0]` carries sequence number `base_seq`; acknowledged entries are
//! trimmed off the front immediately, so `base_seq == acked_seq` outside of
//! the trim itself. Replies are matched to requests purely by flush order,
//! which is what makes pipelining work.
//!
//! Handshake requests live in a separate queue that is always flushed ahead
//! of user traffic; user entries are only flushed once the handshake has
//! completed.

use crate::backpressure::BackpressureGate;
use crate::executor::{CallbackExecutor, Completion};
use bytes::Bytes;
use quark_oxide_core::config::RetryStrategy;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;

/// One staged request: its wire form, who to tell about the reply, and when
/// it was accepted (for age-based retry expiry).
pub(crate) struct StagedRequest {
    pub(crate) serialized: Bytes,
    pub(crate) completion: Completion,
    pub(crate) issued_at: Instant,
}

struct StagerState {
    queue: VecDeque<StagedRequest>,
    base_seq: u64,
    acked_seq: u64,
    flushed_seq: u64,
    next_seq: u64,

    handshake_queue: VecDeque<Bytes>,
    handshake_flushed: usize,
    in_handshake: bool,

    /// Full-listener (pub/sub fallback) mode: replies no longer match
    /// requests, so flushed entries are trimmed eagerly.
    trim_after_flush: bool,

    closed: bool,
}

impl StagerState {
    fn check_invariants(&self) {
        debug_assert!(self.base_seq <= self.acked_seq);
        debug_assert!(self.acked_seq <= self.flushed_seq);
        debug_assert!(self.flushed_seq <= self.next_seq);
        debug_assert_eq!(self.queue.len() as u64, self.next_seq - self.base_seq);
    }
}

pub(crate) struct RequestStager {
    state: Mutex<StagerState>,
    write_notify: Notify,
}

impl RequestStager {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(StagerState {
                queue: VecDeque::new(),
                base_seq: 0,
                acked_seq: 0,
                flushed_seq: 0,
                next_seq: 0,
                handshake_queue: VecDeque::new(),
                handshake_flushed: 0,
                in_handshake: false,
                trim_after_flush: false,
                closed: false,
            }),
            write_notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put the stager into full-listener trimming mode. Set once, before
    /// the first connection, by subscribers running without push types.
    pub(crate) fn enable_trim_after_flush(&self) {
        self.lock().trim_after_flush = true;
    }

    /// Stage a user request. Returns the completion back if the client is
    /// already closed, so the caller can fail it promptly.
    pub(crate) fn stage(&self, serialized: Bytes, completion: Completion) -> Result<(), Completion> {
        {
            let mut st = self.lock();
            if st.closed {
                return Err(completion);
            }
            st.queue.push_back(StagedRequest {
                serialized,
                completion,
                issued_at: Instant::now(),
            });
            st.next_seq += 1;
            st.check_invariants();
        }
        self.write_notify.notify_one();
        Ok(())
    }

    /// Reset per-connection state: rewind the flush cursor so retained
    /// entries are replayed, and install the first handshake request, if
    /// any.
    pub(crate) fn begin_connection(&self, first_handshake: Option<Bytes>) {
        {
            let mut st = self.lock();
            st.handshake_queue.clear();
            st.handshake_flushed = 0;
            match first_handshake {
                Some(req) => {
                    st.handshake_queue.push_back(req);
                    st.in_handshake = true;
                }
                None => st.in_handshake = false,
            }
            st.flushed_seq = st.base_seq;
            st.check_invariants();
        }
        self.write_notify.notify_one();
    }

    /// Stage the next request of a multi-stage handshake.
    pub(crate) fn stage_handshake(&self, serialized: Bytes) {
        {
            let mut st = self.lock();
            st.handshake_queue.push_back(serialized);
        }
        self.write_notify.notify_one();
    }

    /// Unlock user traffic once the handshake has fully validated.
    pub(crate) fn handshake_completed(&self) {
        {
            let mut st = self.lock();
            st.in_handshake = false;
        }
        self.write_notify.notify_one();
    }

    /// The writer loop's blocking dequeue: the next buffer to flush, in
    /// order, handshake traffic first. `None` once the stager is closed.
    pub(crate) async fn next_to_write(&self, gate: &BackpressureGate) -> Option<Bytes> {
        loop {
            {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }

                if st.handshake_flushed < st.handshake_queue.len() {
                    let buf = st.handshake_queue[st.handshake_flushed].clone();
                    st.handshake_flushed += 1;
                    return Some(buf);
                }

                if !st.in_handshake {
                    let idx = (st.flushed_seq - st.base_seq) as usize;
                    if idx < st.queue.len() {
                        let buf = st.queue[idx].serialized.clone();
                        st.flushed_seq += 1;

                        if st.trim_after_flush {
                            while st.base_seq < st.flushed_seq {
                                // Completions of trimmed entries are
                                // dropped, not invoked; replies will never
                                // match them in listener mode.
                                st.queue.pop_front();
                                st.base_seq += 1;
                                gate.release();
                            }
                            st.acked_seq = st.base_seq;
                        }

                        st.check_invariants();
                        return Some(buf);
                    }
                }
            }
            self.write_notify.notified().await;
        }
    }

    /// Whether a flushed request is awaiting its reply.
    pub(crate) fn has_pending(&self) -> bool {
        let st = self.lock();
        st.acked_seq < st.flushed_seq
    }

    /// Match a reply to the oldest in-flight request and complete it.
    /// Fails if the server sent more replies than there were requests.
    pub(crate) fn acknowledge(
        &self,
        reply: quark_oxide_core::value::RespValue,
        executor: &CallbackExecutor,
        gate: &BackpressureGate,
    ) -> Result<(), ()> {
        let completion = {
            let mut st = self.lock();
            if st.acked_seq >= st.flushed_seq {
                return Err(());
            }
            let entry = st.queue.pop_front().ok_or(())?;
            st.base_seq += 1;
            st.acked_seq += 1;
            st.check_invariants();
            entry.completion
        };
        gate.release();
        executor.submit(completion, Some(reply));
        Ok(())
    }

    /// Apply the retry strategy after a genuine transport failure. Failed
    /// entries complete with `None`; retained entries will be replayed from
    /// the front on the next connection.
    pub(crate) fn handle_disconnect(
        &self,
        strategy: RetryStrategy,
        executor: &CallbackExecutor,
        gate: &BackpressureGate,
    ) {
        let failed = {
            let mut st = self.lock();
            st.handshake_queue.clear();
            st.handshake_flushed = 0;
            st.in_handshake = false;

            let mut failed = Vec::new();
            match strategy {
                RetryStrategy::NoRetries => {
                    while let Some(entry) = st.queue.pop_front() {
                        st.base_seq += 1;
                        failed.push(entry.completion);
                    }
                }
                RetryStrategy::WithTimeout(max_age) => {
                    let now = Instant::now();
                    while let Some(front) = st.queue.front() {
                        if now.duration_since(front.issued_at) < max_age {
                            break;
                        }
                        let entry = st.queue.pop_front().expect("front exists");
                        st.base_seq += 1;
                        failed.push(entry.completion);
                    }
                }
                RetryStrategy::InfiniteRetries => {}
            }
            st.acked_seq = st.base_seq;
            st.flushed_seq = st.base_seq;
            st.check_invariants();
            failed
        };

        for completion in failed {
            gate.release();
            executor.submit(completion, None);
        }
    }

    /// Rewind the flush cursor without failing anything. Used for MOVED
    /// redirects: the in-flight requests are replayed verbatim against the
    /// redirect target, whatever the retry strategy says.
    pub(crate) fn rewind(&self) {
        let mut st = self.lock();
        st.handshake_queue.clear();
        st.handshake_flushed = 0;
        st.in_handshake = false;
        st.flushed_seq = st.base_seq;
        st.check_invariants();
    }

    /// Final teardown: fail every remaining handle with `None` and refuse
    /// any further staging.
    pub(crate) fn fail_all(&self, executor: &CallbackExecutor, gate: &BackpressureGate) {
        let failed = {
            let mut st = self.lock();
            st.closed = true;
            st.handshake_queue.clear();
            st.handshake_flushed = 0;
            st.in_handshake = false;
            let mut failed = Vec::new();
            while let Some(entry) = st.queue.pop_front() {
                st.base_seq += 1;
                failed.push(entry.completion);
            }
            st.acked_seq = st.base_seq;
            st.flushed_seq = st.base_seq;
            st.check_invariants();
            failed
        };

        self.write_notify.notify_one();
        for completion in failed {
            gate.release();
            executor.submit(completion, None);
        }
    }

    /// Number of staged, not yet acknowledged entries.
    pub(crate) fn pending_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Flush cursor relative to the queue front, for invariant checks.
    #[cfg(test)]
    pub(crate) fn flushed_offset(&self) -> u64 {
        let st = self.lock();
        st.flushed_seq - st.base_seq
    }

    /// Ack cursor relative to the queue front, for invariant checks.
    #[cfg(test)]
    pub(crate) fn acked_offset(&self) -> u64 {
        let st = self.lock();
        st.acked_seq - st.base_seq
    }
}
