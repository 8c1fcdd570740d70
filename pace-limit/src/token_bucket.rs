use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use serde::Serialize;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::Acquisition;
use crate::BucketConfig;
use crate::LimitError;
use crate::Limiter;
use crate::LimiterStatus;
use crate::Reason;
use crate::config::saturating_secs;
use crate::wait;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Mutable bucket state. Only ever touched under `TokenBucketLimiter::bucket`.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Nanoseconds from the anchor. Header reconciliation may push this into
    /// the future, which suspends accrual until then.
    last_refill: u64,
    above_high_water: bool,
    total_requests: u64,
    total_waits: u64,
    total_wait_time: Duration,
    warning_count: u64,
}

/// In-process, thread-safe token bucket.
///
/// Tokens accrue continuously at `refill_rate` up to `capacity` and are computed
/// lazily when the bucket is touched. All bookkeeping happens under one mutex
/// which is never held while sleeping.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    burst: u32,
    capacity: f64,
    refill_rate: f64,
    high_water: f64,
    bucket: Mutex<Bucket>,
    clock: Clock,
    anchor: Instant,
}

/// Statistics snapshot returned by [`TokenBucketLimiter::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketStats {
    pub total_requests: u64,
    pub total_waits: u64,
    /// Percentage of requests that waited or were refused, in `[0, 100]`.
    pub wait_percentage: f64,
    /// Mean wait of the requests that waited.
    pub avg_wait_time_secs: f64,
    pub total_wait_time_secs: f64,
    pub current_tokens: f64,
    pub capacity: u32,
    pub refill_rate: f64,
    pub rate_limit_warning_count: u64,
}

impl TokenBucketLimiter {
    pub fn new(config: BucketConfig) -> Result<Self, LimitError> {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: BucketConfig, clock: Clock) -> Result<Self, LimitError> {
        config.validate()?;
        let anchor = clock.now();
        let capacity = f64::from(config.burst);

        Ok(Self {
            burst: config.burst,
            capacity,
            refill_rate: config.refill_rate(),
            high_water: config.high_water,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: 0,
                above_high_water: false,
                total_requests: 0,
                total_waits: 0,
                total_wait_time: Duration::ZERO,
                warning_count: 0,
            }),
            clock,
            anchor,
        })
    }

    fn now(&self) -> u64 {
        u64::try_from(self.clock.now().duration_since(self.anchor).as_nanos()).unwrap_or(u64::MAX)
    }

    fn refill(&self, bucket: &mut Bucket, now: u64) {
        if now > bucket.last_refill {
            let elapsed = (now - bucket.last_refill) as f64 / NANOS_PER_SEC;
            bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
            bucket.last_refill = now;
        }
        if bucket.above_high_water && self.consumed(bucket) <= self.high_water {
            bucket.above_high_water = false;
        }
    }

    fn consumed(&self, bucket: &Bucket) -> f64 {
        1.0 - bucket.tokens / self.capacity
    }

    fn wait_hint(&self, bucket: &Bucket, now: u64, needed: f64) -> Duration {
        let deficit = (needed - bucket.tokens).max(0.0);
        let suspended = Duration::from_nanos(bucket.last_refill.saturating_sub(now));
        suspended.saturating_add(saturating_secs(deficit / self.refill_rate))
    }

    fn record(&self, outcome: &Acquisition) {
        let waited = outcome.waited();
        let mut bucket = self.bucket.lock();
        bucket.total_requests += 1;
        if !outcome.is_granted() || !waited.is_zero() {
            bucket.total_waits += 1;
            bucket.total_wait_time += waited;
        }
    }

    /// Non-blocking acquisition. Never sleeps.
    ///
    /// Requests larger than the burst capacity are refused.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let granted = matches!(self.process(tokens), Ok(ControlFlow::Continue(())));
        let outcome = if granted {
            Acquisition::Granted {
                waited: Duration::ZERO,
            }
        } else {
            Acquisition::TimedOut {
                waited: Duration::ZERO,
            }
        };
        self.record(&outcome);
        granted
    }

    /// Reconcile with a server reported remaining quota and reset time.
    ///
    /// Only tightens: when the server reports fewer remaining requests than the
    /// bucket holds, the bucket drops to that count and accrual is suspended so the
    /// next whole token arrives no earlier than the server's reset. Tokens are never
    /// raised. Non-finite input is ignored.
    pub fn update_from_headers(&self, remaining: f64, reset_in_secs: f64) {
        if !remaining.is_finite() {
            return;
        }
        let remaining = remaining.max(0.0);
        let now = self.now();

        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        if remaining >= bucket.tokens {
            return;
        }

        let local = bucket.tokens;
        bucket.tokens = remaining;
        if reset_in_secs.is_finite() && reset_in_secs > 0.0 {
            let first_token = saturating_secs(reset_in_secs - 1.0 / self.refill_rate);
            let horizon =
                now.saturating_add(u64::try_from(first_token.as_nanos()).unwrap_or(u64::MAX));
            bucket.last_refill = bucket.last_refill.max(horizon);
        }
        debug!(
            local,
            remaining, reset_in_secs, "server reported less headroom; bucket tightened"
        );
    }

    /// How long until `tokens` could be granted, ignoring other callers.
    pub fn time_until_available(&self, tokens: u32) -> Duration {
        let now = self.now();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        if bucket.tokens >= f64::from(tokens) {
            Duration::ZERO
        } else {
            self.wait_hint(&bucket, now, f64::from(tokens))
        }
    }

    /// Tokens currently banked.
    pub fn available(&self) -> f64 {
        let now = self.now();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        bucket.tokens
    }

    pub fn get_stats(&self) -> BucketStats {
        let now = self.now();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);

        let total_wait_time_secs = bucket.total_wait_time.as_secs_f64();
        let wait_percentage = if bucket.total_requests > 0 {
            bucket.total_waits as f64 / bucket.total_requests as f64 * 100.0
        } else {
            0.0
        };
        let avg_wait_time_secs = if bucket.total_waits > 0 {
            total_wait_time_secs / bucket.total_waits as f64
        } else {
            0.0
        };

        BucketStats {
            total_requests: bucket.total_requests,
            total_waits: bucket.total_waits,
            wait_percentage,
            avg_wait_time_secs,
            total_wait_time_secs,
            current_tokens: bucket.tokens,
            capacity: self.burst,
            refill_rate: self.refill_rate,
            rate_limit_warning_count: bucket.warning_count,
        }
    }
}

impl Limiter for TokenBucketLimiter {
    fn process(&self, tokens: u32) -> Result<ControlFlow<Reason>, LimitError> {
        if wait::check_request(tokens, self.burst)? {
            return Ok(ControlFlow::Continue(()));
        }
        let needed = f64::from(tokens);
        let now = self.now();

        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);

        if bucket.tokens < needed {
            let retry_after = self.wait_hint(&bucket, now, needed);
            return Ok(ControlFlow::Break(Reason::Overloaded { retry_after }));
        }

        bucket.tokens -= needed;
        trace!(tokens, remaining = bucket.tokens, "tokens granted");

        if !bucket.above_high_water && self.consumed(&bucket) > self.high_water {
            bucket.above_high_water = true;
            bucket.warning_count += 1;
            warn!(
                remaining = bucket.tokens,
                capacity = self.burst,
                high_water = self.high_water,
                "token bucket utilisation above high-water mark"
            );
        }
        Ok(ControlFlow::Continue(()))
    }

    fn capacity(&self) -> u32 {
        self.burst
    }

    fn status(&self) -> LimiterStatus {
        LimiterStatus::TokenBucket(self.get_stats())
    }

    fn acquire(&self, tokens: u32, timeout: Option<Duration>) -> Result<Acquisition, LimitError> {
        let outcome = wait::acquire(self, tokens, timeout)?;
        self.record(&outcome);
        Ok(outcome)
    }

    fn try_acquire(&self, tokens: u32) -> Result<bool, LimitError> {
        wait::check_request(tokens, self.burst)?;
        Ok(TokenBucketLimiter::try_acquire(self, tokens))
    }
}
