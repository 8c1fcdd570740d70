use std::sync::Arc;
use std::time::Duration;

use pace_limit::Limiter;
use tower::Layer;

use crate::service::RateLimitService;

/// Applies a [`Limiter`] to requests.
#[derive(Debug)]
pub struct RateLimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    tokens: u32,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl<L> Clone for RateLimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            tokens: self.tokens,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
        }
    }
}

impl<L> RateLimitLayer<L>
where
    L: Limiter + ?Sized,
{
    /// Create a RateLimitLayer charging one token per request.
    pub fn new(limiter: Arc<L>) -> Self {
        RateLimitLayer {
            limiter,
            tokens: 1,
            fail_fast: false,
            timeout: None,
        }
    }

    /// Charge `tokens` per request.
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    /// Set whether the service should fail immediately when overloaded.
    ///
    /// If `true`, the service will return `PaceError::RateLimited` (or
    /// `PaceError::LockUnavailable`) immediately instead of waiting.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified timeout for both waiting for a permit and request execution.
    ///
    /// If the total time exceeds this duration, the service
    /// will return `PaceError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<L, S> Layer<S> for RateLimitLayer<L>
where
    L: ?Sized,
{
    type Service = RateLimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = RateLimitService::new(service, self.limiter.clone())
            .with_tokens(self.tokens)
            .with_fail_fast(self.fail_fast);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
