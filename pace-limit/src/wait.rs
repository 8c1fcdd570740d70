use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::trace;

use crate::Acquisition;
use crate::LimitError;
use crate::Limiter;

/// Shortest pause between two checks, so a zero retry hint cannot spin.
pub(crate) const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Validate a request size against a limiter's capacity.
///
/// Returns `Ok(true)` for the trivially satisfiable zero-token request.
pub(crate) fn check_request(tokens: u32, capacity: u32) -> Result<bool, LimitError> {
    if tokens > capacity {
        return Err(LimitError::ExceedsCapacity {
            requested: tokens,
            capacity,
        });
    }
    Ok(tokens == 0)
}

/// Blocking acquisition shared by every limiter.
///
/// Each iteration is one CHECKING step through [`Limiter::process_within`],
/// which takes and releases whatever lock the limiter uses and may wait on it
/// for no longer than the caller's remaining timeout. Sleeping only ever
/// happens here, with nothing held, and likewise never past the deadline.
pub(crate) fn acquire<L>(
    limiter: &L,
    tokens: u32,
    timeout: Option<Duration>,
) -> Result<Acquisition, LimitError>
where
    L: Limiter + ?Sized,
{
    let start = Instant::now();
    let deadline = timeout.and_then(|t| start.checked_add(t));
    let remaining = || deadline.map(|d| d.saturating_duration_since(Instant::now()));
    let mut slept = false;
    // A grant that took no noticeable time reports no wait.
    let waited = |slept: bool| {
        let elapsed = start.elapsed();
        if slept || elapsed >= MIN_PAUSE {
            elapsed
        } else {
            Duration::ZERO
        }
    };

    loop {
        let budget = remaining().unwrap_or(Duration::MAX);
        let reason = match limiter.process_within(tokens, budget)? {
            ControlFlow::Continue(()) => {
                return Ok(Acquisition::Granted {
                    waited: waited(slept),
                });
            }
            ControlFlow::Break(reason) => reason,
        };

        let mut pause = reason.retry_after().max(MIN_PAUSE);
        if let Some(remaining) = remaining() {
            if remaining.is_zero() {
                return Ok(reason.into_denial(waited(slept)));
            }
            pause = pause.min(remaining);
        }

        trace!(tokens, ?pause, "waiting for capacity");
        thread::sleep(pause);
        slept = true;
    }
}
