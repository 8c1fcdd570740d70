use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::Timeout;
use tokio::time::sleep;
use tokio::time::timeout;
use tower::BoxError;
use tower::Service;
use tracing::trace;

use pace_limit::Limiter;
use pace_limit::Reason;

use crate::error::PaceError;

#[derive(Clone, Debug)]
struct RateLimitServiceMetrics {
    early_wake: Counter<u64>,
    denied: Counter<u64>,
}

/// Waits in `poll_ready` until the limiter grants `tokens` for the next call.
///
/// `poll_ready` runs one [`Limiter::process`] check inline, which never waits:
/// a [`pace_limit::TokenBucketLimiter`] takes a short mutex hold and a
/// [`pace_limit::CrossProcessCoordinator`] makes one attempt at its file lock.
/// A contended lock is retried after the coordinator's poll interval on a
/// tokio timer.
#[derive(Debug)]
pub struct RateLimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    tokens: u32,
    sleep: Option<Pin<Box<Sleep>>>,
    permit_acquired: bool,
    fail_fast: bool,
    timeout: Option<Duration>,
    wait_start: Option<Instant>,
    instruments: RateLimitServiceMetrics,
}

pin_project! {
    /// A future that wraps the inner service future with a timeout.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: Timeout<F>,
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::from(Box::new(PaceError::Timeout)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

// Manually implement Clone because Pin<Box<Sleep>> cannot be cloned
impl<L, S> Clone for RateLimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            tokens: self.tokens,
            // We start with a fresh sleep state for the new clone
            sleep: None,
            permit_acquired: false,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            wait_start: None,
            instruments: self.instruments.clone(),
        }
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: Limiter + ?Sized,
{
    fn timed_out(&mut self) -> Poll<Result<(), BoxError>> {
        self.wait_start = None;
        Poll::Ready(Err(Box::new(PaceError::Timeout)))
    }

    fn deny(&mut self, reason: Reason) -> Poll<Result<(), BoxError>> {
        self.wait_start = None;
        let err = match reason {
            Reason::Overloaded { retry_after } => PaceError::RateLimited { retry_after },
            Reason::LockUnavailable { waited, .. } => PaceError::LockUnavailable { waited },
        };
        Poll::Ready(Err(Box::new(err)))
    }
}

impl<L, S, Req> Service<Req> for RateLimitService<L, S>
where
    L: Limiter + ?Sized + 'static,
    S: Service<Req, Error = BoxError>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. If we are currently sleeping, check if we're done
        if let Some(ref mut fut) = self.sleep {
            match fut.as_mut().poll(cx) {
                Poll::Ready(_) => {
                    self.sleep = None;
                    if let Some(timeout) = self.timeout
                        && let Some(start) = self.wait_start
                        && start.elapsed() >= timeout
                    {
                        return self.timed_out();
                    }
                }
                Poll::Pending => {
                    self.instruments.early_wake.add(
                        1,
                        &[KeyValue::new("limiter", std::any::type_name::<L>())],
                    );
                    return Poll::Pending;
                }
            }
        }

        // 2. Check inner service readiness FIRST to avoid over-consuming tokens
        match self.inner.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        // 3. Ask the limiter if we don't have a permit yet
        if !self.permit_acquired {
            if let Some(timeout) = self.timeout {
                let start = *self.wait_start.get_or_insert(Instant::now());
                if start.elapsed() >= timeout {
                    return self.timed_out();
                }
            }

            match self.limiter.process(self.tokens) {
                Err(e) => {
                    self.wait_start = None;
                    return Poll::Ready(Err(Box::new(PaceError::from(e))));
                }
                Ok(ControlFlow::Continue(())) => {
                    self.permit_acquired = true;
                }
                Ok(ControlFlow::Break(reason)) => {
                    self.instruments.denied.add(
                        1,
                        &[KeyValue::new("limiter", std::any::type_name::<L>())],
                    );
                    if self.fail_fast {
                        return self.deny(reason);
                    }

                    let retry_after = reason.retry_after();
                    let start = *self.wait_start.get_or_insert(Instant::now());
                    let sleep_duration = if let Some(timeout) = self.timeout {
                        let remaining = timeout.saturating_sub(start.elapsed());
                        if remaining.is_zero() {
                            return self.timed_out();
                        }
                        retry_after.min(remaining)
                    } else {
                        retry_after
                    };
                    trace!(tokens = self.tokens, ?sleep_duration, "waiting for capacity");

                    let mut sleep_fut = Box::pin(sleep(sleep_duration));
                    match sleep_fut.as_mut().poll(cx) {
                        Poll::Pending => {
                            self.sleep = Some(sleep_fut);
                            return Poll::Pending;
                        }
                        Poll::Ready(_) => {
                            // Zero hint: the limiter expects capacity right away.
                            if let Some(timeout) = self.timeout
                                && start.elapsed() >= timeout
                            {
                                return self.timed_out();
                            }

                            cx.waker().wake_by_ref();
                            return Poll::Pending;
                        }
                    }
                }
            }
        }

        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permit_acquired = false;
        let start = self.wait_start.take();
        let timeout_duration = match (self.timeout, start) {
            (Some(t), Some(s)) => t.saturating_sub(s.elapsed()),
            (Some(t), None) => t,
            (None, _) => Duration::from_secs(3600 * 24 * 365), // Effective infinity
        };

        ResponseFuture {
            inner: timeout(timeout_duration, self.inner.call(req)),
        }
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        let meter = global::meter("pace_rate_limit_service");
        let instruments = RateLimitServiceMetrics {
            early_wake: meter.u64_counter("early_wake").build(),
            denied: meter.u64_counter("denied").build(),
        };

        Self {
            inner,
            limiter,
            tokens: 1,
            sleep: None,
            permit_acquired: false,
            fail_fast: false,
            timeout: None,
            wait_start: None,
            instruments,
        }
    }

    /// Tokens each request costs. Defaults to one.
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
