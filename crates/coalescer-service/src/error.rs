use std::time::Duration;

use thiserror::Error;

/// An error that terminates a request.
///
/// Errors are fanned out to every caller waiting on the same execution, which is why this type
/// is [`Clone`]. Errors coming out of an [`Executor`](crate::executor::Executor) are normalized
/// through [`CoalescerError::from_executor`], so callers always see this shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalescerError {
    /// The executor failed to perform the request, e.g. because of connection loss or DNS
    /// resolution.
    ///
    /// The attached string contains the innermost error message.
    #[error("transport error: {0}")]
    Transport(String),
    /// The transport answered with a non-success status code.
    #[error("HTTP {0}")]
    Status(u16),
    /// A single attempt did not finish within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// All retries were used up. Contains the error of the last attempt.
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// The total number of attempts, including the first one.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        last: Box<CoalescerError>,
    },
    /// The request was cancelled explicitly or because the coalescer was shut down.
    #[error("request cancelled")]
    Cancelled,
    /// The request was rejected before being scheduled.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The request was evicted from the offline queue to make room for a newer one.
    #[error("evicted from the full offline queue")]
    OfflineQueueFull,
    /// The coalescer no longer accepts requests.
    #[error("coalescer is shut down")]
    ShutDown,
}

impl CoalescerError {
    /// Normalizes an error coming out of an executor.
    ///
    /// A [`CoalescerError`] that was converted into an [`anyhow::Error`] is recovered as is,
    /// anything else becomes a [`Transport`](Self::Transport) error carrying the message of the
    /// root cause.
    pub fn from_executor(error: anyhow::Error) -> Self {
        match error.downcast::<CoalescerError>() {
            Ok(error) => error,
            Err(error) => Self::Transport(error.root_cause().to_string()),
        }
    }

    /// Whether another attempt could plausibly produce a different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Status(_) | Self::Timeout(_)
        )
    }

    /// Whether this error signals cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the underlying error, looking through [`RetriesExhausted`](Self::RetriesExhausted).
    pub fn root(&self) -> &CoalescerError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// A short, static name used to tag metrics.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Status(_) => "status",
            Self::Timeout(_) => "timeout",
            Self::RetriesExhausted { .. } => "exhausted",
            Self::Cancelled => "cancelled",
            Self::Validation(_) => "validation",
            Self::OfflineQueueFull => "offline_full",
            Self::ShutDown => "shutdown",
        }
    }
}
