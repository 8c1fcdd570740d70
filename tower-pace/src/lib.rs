//! # Tower Pace
//!
//! `tower-pace` puts the limiters from [`pace_limit`] in front of
//! [Tower](https://github.com/tower-rs/tower) services.
//!
//! ## Layers
//!
//! 1. [`RateLimitLayer`]: waits in `poll_ready` until the limiter grants the
//!    request's tokens. With fail-fast it rejects with `PaceError::RateLimited`
//!    instead, and with a timeout it bounds the combined wait and execution time,
//!    failing with `PaceError::Timeout`.
//! 2. [`RetryLayer`]: when the stack reports `PaceError::RateLimited`, or the
//!    remote resource reports `PaceError::Throttled`, sleeps for the delay a
//!    [`pace_limit::RetryPolicy`] computes and re-issues a clone of the request.
//!
//! Any [`pace_limit::Limiter`] works, including the cross-process coordinator, so
//! several processes can share one budget behind the same middleware.

mod error;
mod layer;
mod retry_layer;
mod retry_service;
mod service;


pub use error::PaceError;
pub use layer::RateLimitLayer;
pub use retry_layer::RetryLayer;
pub use retry_service::RetryService;
pub use service::RateLimitService;
pub use service::ResponseFuture;
