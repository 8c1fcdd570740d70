//! # pace-limit
//!
//! `pace-limit` governs how fast a process, or a cooperating set of processes on
//! one machine, may call a rate-limited external resource.
//!
//! ## Key Concepts
//!
//! * **Token Bucket**: [`TokenBucketLimiter`] smooths bursty demand inside one process.
//!   Tokens accrue continuously and lazily, at the moment of each call; there is no
//!   background timer thread.
//! * **Sliding Window across processes**: [`CrossProcessCoordinator`] enforces one budget
//!   for every process sharing a state file, using an advisory file lock held only for a
//!   read-modify-write cycle.
//! * **Retry Backoff**: [`RetryPolicy`] computes the delay before the next attempt when the
//!   resource itself throttles, honouring a server supplied retry-after value.
//! * **Limiter Trait**: [`Limiter`] is the single `acquire`-shaped interface that
//!   [`Scoped`] and [`LimiterRegistry`] compose over.
//!
//! Timeouts are outcomes, not errors: [`Limiter::acquire`] returns an [`Acquisition`]
//! that distinguishes a grant from a timeout so callers choose their own escalation.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use pace_limit::Acquisition;
//! use pace_limit::BucketConfig;
//! use pace_limit::Limiter;
//! use pace_limit::TokenBucketLimiter;
//!
//! let limiter = TokenBucketLimiter::new(BucketConfig::per_minute(60.0, 10)).unwrap();
//!
//! match limiter.acquire(1, Some(Duration::from_secs(2))).unwrap() {
//!     Acquisition::Granted { .. } => { /* call the resource */ }
//!     _ => { /* defer or abort */ }
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

mod config;
mod cross_process;
mod error;
mod lock;
mod registry;
mod retry;
mod scoped;
mod state;
mod token_bucket;
mod wait;
mod window;

pub use config::BucketConfig;
pub use config::LimiterConfig;
pub use config::RegistryConfig;
pub use config::RetryConfig;
pub use config::WindowConfig;
pub use cross_process::CrossProcessCoordinator;
pub use cross_process::HealthReport;
pub use cross_process::HealthStatus;
pub use cross_process::StateHealth;
pub use cross_process::WindowStatus;
pub use error::LimitError;
pub use registry::LimiterRegistry;
pub use retry::Failure;
pub use retry::RetryPolicy;
pub use scoped::Permit;
pub use scoped::Scoped;
pub use token_bucket::BucketStats;
pub use token_bucket::TokenBucketLimiter;

/// Why a single check did not grant the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Not enough budget; capacity is expected after `retry_after`.
    Overloaded { retry_after: Duration },
    /// The cross-process lock was held elsewhere for the whole of this check's
    /// lock budget. `retry_after` is the lock polling interval.
    LockUnavailable {
        path: PathBuf,
        waited: Duration,
        retry_after: Duration,
    },
}

impl Reason {
    /// How long to pause before checking again.
    pub fn retry_after(&self) -> Duration {
        match self {
            Reason::Overloaded { retry_after } | Reason::LockUnavailable { retry_after, .. } => {
                *retry_after
            }
        }
    }

    pub(crate) fn into_denial(self, waited: Duration) -> Acquisition {
        match self {
            Reason::Overloaded { .. } => Acquisition::TimedOut { waited },
            Reason::LockUnavailable { path, .. } => Acquisition::LockUnavailable { path, waited },
        }
    }
}

/// Terminal outcome of one [`Limiter::acquire`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// Tokens were deducted. `waited` is zero when no wait was needed.
    Granted { waited: Duration },
    /// The timeout elapsed before capacity became available.
    TimedOut { waited: Duration },
    /// The timeout elapsed while the cross-process lock was contended.
    LockUnavailable { path: PathBuf, waited: Duration },
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Granted { .. })
    }

    pub fn waited(&self) -> Duration {
        match self {
            Acquisition::Granted { waited }
            | Acquisition::TimedOut { waited }
            | Acquisition::LockUnavailable { waited, .. } => *waited,
        }
    }

    /// Escalate a denial into the matching [`LimitError`].
    pub fn into_result(self, tokens: u32) -> Result<Duration, LimitError> {
        match self {
            Acquisition::Granted { waited } => Ok(waited),
            Acquisition::TimedOut { waited } => {
                Err(LimitError::AcquisitionTimeout { tokens, waited })
            }
            Acquisition::LockUnavailable { path, waited } => {
                Err(LimitError::LockUnavailable { path, waited })
            }
        }
    }
}

/// Read-only report for operational tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterStatus {
    TokenBucket(BucketStats),
    CrossProcess(WindowStatus),
}

/// The interface shared by every limiter.
///
/// Limiters must be `Send` and `Sync` so one instance can be shared across
/// threads via `Arc`.
pub trait Limiter: Debug + Send + Sync {
    /// Perform one non-blocking check for `tokens`, deducting them on success.
    ///
    /// This never sleeps or waits on a contended lock; a cross-process limiter
    /// makes a single attempt at its file lock.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::ExceedsCapacity`] if `tokens` can never be granted.
    fn process(&self, tokens: u32) -> Result<ControlFlow<Reason>, LimitError>;

    /// One check that may spend up to `budget` waiting on a contended lock.
    ///
    /// Limiters without such a lock ignore the budget.
    fn process_within(
        &self,
        tokens: u32,
        _budget: Duration,
    ) -> Result<ControlFlow<Reason>, LimitError> {
        self.process(tokens)
    }

    /// The largest number of tokens one request may ask for.
    fn capacity(&self) -> u32;

    /// Snapshot for reporting.
    fn status(&self) -> LimiterStatus;

    /// Block until `tokens` are granted or `timeout` elapses.
    ///
    /// `None` waits until granted, one bounded pause at a time.
    fn acquire(&self, tokens: u32, timeout: Option<Duration>) -> Result<Acquisition, LimitError> {
        wait::acquire(self, tokens, timeout)
    }

    /// Single check without waiting for capacity.
    fn try_acquire(&self, tokens: u32) -> Result<bool, LimitError> {
        match self.process(tokens)? {
            ControlFlow::Continue(()) => Ok(true),
            ControlFlow::Break(Reason::Overloaded { .. }) => Ok(false),
            ControlFlow::Break(Reason::LockUnavailable { path, waited, .. }) => {
                Err(LimitError::LockUnavailable { path, waited })
            }
        }
    }
}
