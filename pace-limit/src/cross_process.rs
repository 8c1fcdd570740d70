//! Sliding-window limiter shared by every process using the same state file.
//!
//! One state file plus one lock file per logical resource. There is no
//! server and no database: each acquisition takes the advisory lock, reads the
//! window, prunes it, records the grant if it fits, writes the file back and
//! releases the lock before anyone sleeps. Durability is best effort and
//! admission is not FIFO; the only guarantee is the aggregate one, that grants
//! inside any rolling window never exceed the limit.

use std::ops::ControlFlow;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::LimitError;
use crate::Limiter;
use crate::LimiterStatus;
use crate::Reason;
use crate::WindowConfig;
use crate::lock::FileLock;
use crate::state;
use crate::wait;
use crate::window::UsageLog;

/// Upper bound on how long `health_check` probes the lock.
const HEALTH_PROBE: Duration = Duration::from_millis(250);

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateHealth {
    Valid,
    Missing,
    Corrupt,
}

/// Result of [`CrossProcessCoordinator::health_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// `Degraded` when the lock could not be taken promptly.
    pub status: HealthStatus,
    pub lock_acquired: bool,
    pub lock_wait_ms: u64,
    /// Corrupt state heals on the next acquisition, so it does not degrade status.
    pub state: StateHealth,
    pub detail: Option<String>,
}

/// Read-only snapshot returned by [`CrossProcessCoordinator::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub state_path: PathBuf,
    pub current_count: u64,
    pub limit: u32,
    pub utilization_percent: f64,
    /// Seconds until every recorded grant has left the window.
    pub time_to_reset_secs: f64,
    pub window_length_secs: f64,
}

/// Multi-process rate limiter over a lock-protected state file.
#[derive(Debug)]
pub struct CrossProcessCoordinator {
    limit: u32,
    window: f64,
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl CrossProcessCoordinator {
    /// Build a coordinator, creating the state file's directory if needed.
    ///
    /// Nothing is locked or written until the first acquisition.
    pub fn new(config: WindowConfig) -> Result<Self, LimitError> {
        config.validate()?;
        if let Some(dir) = config.state_path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(|e| LimitError::io(dir, e))?;
        }

        Ok(Self {
            limit: config.limit,
            window: config.window_secs,
            lock_path: config.lock_path(),
            lock_timeout: config.lock_timeout(),
            poll_interval: config.poll_interval(),
            state_path: config.state_path,
        })
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Take the lock, waiting at most `timeout` for another holder to let go.
    fn lock(&self, timeout: Duration) -> Result<FileLock, LimitError> {
        let start = Instant::now();
        FileLock::acquire(&self.lock_path, timeout, self.poll_interval)?.ok_or_else(|| {
            LimitError::LockUnavailable {
                path: self.lock_path.clone(),
                waited: start.elapsed(),
            }
        })
    }

    fn snapshot(&self) -> UsageLog {
        match state::load(&self.state_path, self.window, self.limit) {
            Ok(log) => log.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "status read found corrupt state");
                UsageLog::default()
            }
        }
    }

    /// Probe the lock and the state file.
    ///
    /// A lock that cannot be taken within a short bound usually means a live
    /// holder has stalled inside its critical section.
    pub fn health_check(&self) -> HealthReport {
        let probe = self.lock_timeout.min(HEALTH_PROBE);
        let start = Instant::now();
        let (lock_acquired, mut detail) = match self.lock(probe) {
            Ok(_held) => (true, None),
            Err(LimitError::LockUnavailable { .. }) => (
                false,
                Some(format!(
                    "lock {} held for more than {probe:?}",
                    self.lock_path.display()
                )),
            ),
            Err(e) => (false, Some(e.to_string())),
        };
        let lock_wait_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let state = match state::load(&self.state_path, self.window, self.limit) {
            Ok(Some(_)) => StateHealth::Valid,
            Ok(None) => StateHealth::Missing,
            Err(e) => {
                detail.get_or_insert_with(|| e.to_string());
                StateHealth::Corrupt
            }
        };

        HealthReport {
            status: if lock_acquired {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            lock_acquired,
            lock_wait_ms,
            state,
            detail,
        }
    }

    /// Usage in the current window.
    ///
    /// Reads without the lock, so the figures may be a moment stale.
    pub fn get_status(&self) -> WindowStatus {
        let now = unix_now();
        let mut log = self.snapshot();
        log.prune(now, self.window);
        let current_count = log.count();

        WindowStatus {
            state_path: self.state_path.clone(),
            current_count,
            limit: self.limit,
            utilization_percent: current_count as f64 / f64::from(self.limit) * 100.0,
            time_to_reset_secs: log.time_to_reset(now, self.window).as_secs_f64(),
            window_length_secs: self.window,
        }
    }

    /// Forget all recorded usage.
    pub fn reset(&self) -> Result<(), LimitError> {
        let _lock = self.lock(self.lock_timeout)?;
        let mut log = state::load_or_fresh(&self.state_path, self.window, self.limit);
        log.clear();
        state::store(&self.state_path, &log, self.window, self.limit)
            .map_err(|e| LimitError::io(&self.state_path, e))
    }
}

impl Limiter for CrossProcessCoordinator {
    fn process(&self, tokens: u32) -> Result<ControlFlow<Reason>, LimitError> {
        self.process_within(tokens, Duration::ZERO)
    }

    /// Waits for the file lock for at most `budget`, capped by the configured
    /// lock timeout.
    fn process_within(
        &self,
        tokens: u32,
        budget: Duration,
    ) -> Result<ControlFlow<Reason>, LimitError> {
        if wait::check_request(tokens, self.limit)? {
            return Ok(ControlFlow::Continue(()));
        }
        let _lock = match self.lock(budget.min(self.lock_timeout)) {
            Ok(lock) => lock,
            Err(LimitError::LockUnavailable { path, waited }) => {
                return Ok(ControlFlow::Break(Reason::LockUnavailable {
                    path,
                    waited,
                    retry_after: self.poll_interval,
                }));
            }
            Err(e) => return Err(e),
        };

        let now = unix_now();
        let mut log = state::load_or_fresh(&self.state_path, self.window, self.limit);
        log.prune(now, self.window);
        let count = log.count();

        if count + u64::from(tokens) > u64::from(self.limit) {
            let retry_after = log.time_until_capacity(now, self.window, self.limit, tokens);
            return Ok(ControlFlow::Break(Reason::Overloaded { retry_after }));
        }

        log.record(now, tokens);
        if let Err(e) = state::store(&self.state_path, &log, self.window, self.limit) {
            warn!(
                path = %self.state_path.display(),
                error = %e,
                "unable to persist rate limit state; grant stands"
            );
        }
        trace!(tokens, count = count + u64::from(tokens), limit = self.limit, "window grant");
        Ok(ControlFlow::Continue(()))
    }

    fn capacity(&self) -> u32 {
        self.limit
    }

    fn status(&self) -> LimiterStatus {
        LimiterStatus::CrossProcess(self.get_status())
    }
}
