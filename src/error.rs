//! Error types for fetch executions.

use std::sync::Arc;

use thiserror::Error;

/// Terminal outcome error of a fetch execution.
///
/// Cloneable so a deduplicated execution can hand the same outcome to every
/// waiter that joined it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The fetch function rejected and the retry policy was exhausted.
    ///
    /// Carries the user's failure reason verbatim.
    #[error("{0}")]
    Rejected(Arc<anyhow::Error>),

    /// The owning query was removed while the execution was in flight.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// The user-supplied failure reason, if this is a rejection.
    pub fn reason(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            FetchError::Rejected(reason) => Some(reason),
            FetchError::Cancelled => None,
        }
    }

    /// Attempt to downcast the rejection reason to a concrete error type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.reason().and_then(|reason| reason.downcast_ref::<E>())
    }
}
