use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::trace;

use crate::LimitError;
use crate::Limiter;

/// Runs units of work only after a limiter has granted them.
///
/// This is a thin composition over [`Limiter::acquire`]: denial surfaces as
/// [`LimitError::AcquisitionTimeout`] or [`LimitError::LockUnavailable`] and
/// the work is never started without a grant.
#[derive(Debug)]
pub struct Scoped<L: Limiter + ?Sized> {
    limiter: Arc<L>,
    tokens: u32,
    timeout: Option<Duration>,
}

impl<L: Limiter + ?Sized> Clone for Scoped<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            tokens: self.tokens,
            timeout: self.timeout,
        }
    }
}

/// Proof that tokens were granted.
///
/// Dropping it does not return the tokens; they are spent.
#[derive(Debug)]
#[must_use = "the permit marks the scope of the granted work"]
pub struct Permit {
    tokens: u32,
    waited: Duration,
    acquired_at: Instant,
}

impl Permit {
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// How long acquisition blocked.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        trace!(tokens = self.tokens, held = ?self.acquired_at.elapsed(), "permit released");
    }
}

impl<L: Limiter + ?Sized> Scoped<L> {
    /// One token per unit of work, waiting as long as it takes.
    pub fn new(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            tokens: 1,
            timeout: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    fn grant(&self, tokens: u32) -> Result<Permit, LimitError> {
        let waited = self
            .limiter
            .acquire(tokens, self.timeout)?
            .into_result(tokens)?;
        Ok(Permit {
            tokens,
            waited,
            acquired_at: Instant::now(),
        })
    }

    /// Acquire the configured tokens and hold a [`Permit`] for the scope.
    pub fn enter(&self) -> Result<Permit, LimitError> {
        self.grant(self.tokens)
    }

    /// Acquire, then run `f`.
    pub fn run<T, F>(&self, f: F) -> Result<T, LimitError>
    where
        F: FnOnce() -> T,
    {
        let _permit = self.enter()?;
        Ok(f())
    }

    /// Run `f` over every item, acquiring tokens for groups of items at once.
    ///
    /// Items are taken in chunks whose combined tokens fit in the limiter's
    /// capacity; each chunk is granted in a single acquisition (with its own
    /// timeout) before any of its items run. If a chunk is denied the error
    /// is returned and the remaining items are not run. Work done for earlier
    /// chunks is not undone.
    pub fn run_batch<I, T, F>(&self, items: I, mut f: F) -> Result<Vec<T>, LimitError>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> T,
    {
        let per_chunk = match self.tokens {
            0 => usize::MAX,
            n => (self.limiter.capacity() / n).max(1) as usize,
        };

        let mut items = items.into_iter();
        let mut results = Vec::new();
        loop {
            let chunk: Vec<I::Item> = items.by_ref().take(per_chunk).collect();
            if chunk.is_empty() {
                return Ok(results);
            }
            // per_chunk keeps this within capacity, or it is a single oversized
            // item which acquire rejects.
            let tokens = self.tokens.saturating_mul(chunk.len() as u32);
            let permit = self.grant(tokens)?;
            trace!(items = chunk.len(), tokens, "batch granted");
            results.extend(chunk.into_iter().map(&mut f));
            drop(permit);
        }
    }
}
