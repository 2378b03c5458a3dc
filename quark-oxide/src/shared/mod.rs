//! Distributed coordination over pub/sub
//!
//! Point-to-point request/response ([`Communicator`] /
//! [`CommunicatorListener`]) with UUID correlation, retries and a hard
//! deadline, plus an eventually-consistent [`TransientSharedHash`]
//! maintained by broadcasting mutations.

pub mod binary;
pub mod communicator;
pub mod hash;
pub mod vault;

pub use communicator::{Communicator, CommunicatorListener, CommunicatorRequest};
pub use hash::TransientSharedHash;
pub use vault::{CommunicatorReply, PendingRequestVault};
