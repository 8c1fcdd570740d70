use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by `pace-limit` limiters.
///
/// An ordinary acquisition timeout is *not* an error for [`crate::Limiter::acquire`];
/// it is reported as [`crate::Acquisition::TimedOut`]. The `AcquisitionTimeout` and
/// `LockUnavailable` variants are raised by the scoped wrappers, which refuse to
/// run guarded work without a grant.
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    /// Invalid rate, capacity, window or retry parameters.
    #[error("invalid limiter configuration: {0}")]
    Configuration(String),

    /// A single request asked for more tokens than the limiter can ever hold.
    #[error("requested {requested} tokens but capacity is {capacity}")]
    ExceedsCapacity {
        /// Tokens requested.
        requested: u32,
        /// Burst capacity or window limit.
        capacity: u32,
    },

    /// No capacity became available before the caller's timeout.
    #[error("rate limit exceeded; no capacity for {tokens} token(s) within {waited:?}")]
    AcquisitionTimeout {
        /// Tokens requested.
        tokens: u32,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The cross-process advisory lock could not be obtained in time.
    #[error("lock on {} unavailable after {waited:?}", path.display())]
    LockUnavailable {
        /// Path of the lock file.
        path: PathBuf,
        /// Time spent waiting for the lock.
        waited: Duration,
    },

    /// Persisted state could not be decoded. Coordinators recover from this by
    /// starting from an empty window.
    #[error("state file {} is corrupt: {reason}", path.display())]
    StateCorruption {
        /// Path of the state file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The lock or state file could not be created or opened.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration JSON could not be parsed.
    #[error("unable to parse limiter configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl LimitError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
