//! Nonce-aware transaction submission.
//!
//! [`TransactionQueue`] serializes submissions for a single account through one
//! gate so nonces are handed out strictly in sequence, retries once on nonce
//! conflicts and caches gas estimates per call shape. [`ActionTracker`] wraps
//! each submitted intent in an observable [`Action`] record.

use std::sync::{
    Mutex,
    MutexGuard,
    PoisonError,
};

pub mod actions;
pub mod gas_cache;
pub mod nonce;
pub mod priority_queue;
pub mod queue;
pub mod signer;
pub mod systems;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use actions::{
    Action,
    ActionIndex,
    ActionRequest,
    ActionState,
    ActionTracker,
    ActionUpdate,
};
pub use gas_cache::{
    GasCacheConfig,
    GasEstimationCache,
    KeyOptions,
};
pub use nonce::{
    NonceManager,
    NonceSnapshot,
};
pub use priority_queue::PriorityQueue;
pub use queue::{
    QueueConfig,
    QueuedCall,
    TransactionQueue,
};
pub use signer::{
    RpcProvider,
    Signer,
    SubmissionError,
    TxOverrides,
    TxReceipt,
    TxRequest,
    TxResult,
};
pub use systems::{
    CallEncoder,
    CallOptions,
    SystemClient,
    Systems,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("transaction queue dropped the request before it resolved")]
    QueueClosed,
    #[error("nonce state is no longer available")]
    NonceUnavailable,
    #[error("unknown action {0}")]
    UnknownAction(ActionIndex),
    #[error("unknown system {0}")]
    UnknownSystem(String),
    #[error("failed to encode {system}.{method}: {reason}")]
    Encode {
        system: String,
        method: String,
        reason: String,
    },
}

impl Error {
    pub fn as_submission(&self) -> Option<&SubmissionError> {
        match self {
            Error::Submission(err) => Some(err),
            _ => None,
        }
    }
}

// Advisory state only; a panicked holder never leaves it half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
