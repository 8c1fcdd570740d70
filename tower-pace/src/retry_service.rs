use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use pace_limit::RetryPolicy;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tracing::debug;
use tracing::warn;

use crate::PaceError;

#[derive(Debug)]
pub struct RetryService<S> {
    pub(crate) inner: S,
    pub(crate) policy: RetryPolicy,
}

impl<S: Clone> Clone for RetryService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy,
        }
    }
}

/// The retry-after carried by a retryable error, or `None` if it is not retryable.
fn retryable(err: &BoxError) -> Option<Option<Duration>> {
    match err.downcast_ref::<PaceError>()? {
        PaceError::RateLimited { retry_after } => Some(Some(*retry_after)),
        PaceError::Throttled { retry_after } => Some(*retry_after),
        _ => None,
    }
}

impl<S, Req> Service<Req> for RetryService<S>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    // We return a BoxFuture because we are creating an async block
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.inner.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => {
                if let Some(PaceError::RateLimited { .. }) = err.downcast_ref::<PaceError>() {
                    // Pretend we are ready, so call() gets invoked.
                    // We will handle the retry logic (and sleep) inside call().
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy;

        Box::pin(async move {
            let mut attempt = 0;
            loop {
                let outcome = match inner.ready().await {
                    Ok(svc) => svc.call(req.clone()).await,
                    Err(err) => Err(err),
                };
                let err = match outcome {
                    Ok(response) => return Ok(response),
                    Err(err) => err,
                };
                let Some(retry_after) = retryable(&err) else {
                    return Err(err);
                };

                let hint = retry_after.map(|d| d.as_secs_f64());
                let Some(delay) = policy.get_retry_delay(attempt, hint) else {
                    warn!(attempts = attempt + 1, error = %err, "still throttled; giving up");
                    return Err(err);
                };
                debug!(attempt, ?delay, error = %err, "throttled; backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        })
    }
}
