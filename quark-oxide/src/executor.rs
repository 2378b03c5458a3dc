//! Completion delivery
//!
//! Completion handles are never invoked while any internal lock is held.
//! The reader loop hands finished `(completion, reply)` pairs to a dedicated
//! executor task; application callbacks can therefore safely call back into
//! the client without deadlocking.

use quark_oxide_core::value::RespValue;
use tokio::sync::{mpsc, oneshot};

/// Callback form of a completion handle.
pub type ReplyCallback = Box<dyn FnOnce(Option<RespValue>) + Send + 'static>;

/// The completion handle of a staged request. Consumed exactly once; a
/// `None` reply always means the library could not guarantee the command
/// reached the server and got an answer.
pub enum Completion {
    /// Resolve a one-shot future
    Future(oneshot::Sender<Option<RespValue>>),
    /// Invoke a callback
    Callback(ReplyCallback),
    /// Fire-and-forget; the reply is dropped
    Discard,
}

impl Completion {
    /// Consume the handle with the given reply.
    pub fn complete(self, reply: Option<RespValue>) {
        match self {
            Self::Future(tx) => {
                let _ = tx.send(reply);
            }
            Self::Callback(cb) => cb(reply),
            Self::Discard => {}
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Future(_) => f.write_str("Completion::Future"),
            Self::Callback(_) => f.write_str("Completion::Callback"),
            Self::Discard => f.write_str("Completion::Discard"),
        }
    }
}

/// Serializes completion delivery onto one dedicated task.
pub(crate) struct CallbackExecutor {
    tx: mpsc::UnboundedSender<(Completion, Option<RespValue>)>,
}

impl CallbackExecutor {
    /// Spawn the executor task. Must be called within a tokio runtime.
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Completion, Option<RespValue>)>();
        tokio::spawn(async move {
            while let Some((completion, reply)) = rx.recv().await {
                completion.complete(reply);
            }
        });
        Self { tx }
    }

    /// Enqueue a completion. Delivery order matches submission order.
    pub(crate) fn submit(&self, completion: Completion, reply: Option<RespValue>) {
        if let Err(mpsc::error::SendError((completion, reply))) =
            self.tx.send((completion, reply))
        {
            // Executor already gone; complete inline rather than dropping
            // the handle on the floor.
            completion.complete(reply);
        }
    }
}
