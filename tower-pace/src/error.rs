use std::time::Duration;

use pace_limit::LimitError;

/// Errors produced by the Tower Pace middleware stack.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PaceError {
    /// The request waited for capacity longer than the configured timeout.
    #[error("Request timed out waiting for rate limit capacity")]
    Timeout,

    /// The local limiter refused the request and fail-fast is enabled.
    ///
    /// The duration indicates when capacity is expected.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// The remote resource throttled the request.
    ///
    /// Inner services return this so a [`crate::RetryLayer`] can back off,
    /// passing through any retry-after value the resource supplied.
    #[error("Throttled by the remote resource; retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    /// The cross-process lock could not be taken in time.
    #[error("Rate limit lock unavailable after {waited:?}")]
    LockUnavailable { waited: Duration },

    /// The limiter rejected the request outright, e.g. it can never fit.
    #[error("Rate limiter error: {0}")]
    Limiter(String),

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl From<LimitError> for PaceError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::AcquisitionTimeout { .. } => PaceError::Timeout,
            LimitError::LockUnavailable { waited, .. } => PaceError::LockUnavailable { waited },
            other => PaceError::Limiter(other.to_string()),
        }
    }
}
