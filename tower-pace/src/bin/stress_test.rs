use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use hdrhistogram::Histogram;
use pace_limit::BucketConfig;
use pace_limit::CrossProcessCoordinator;
use pace_limit::Limiter;
use pace_limit::RetryPolicy;
use pace_limit::TokenBucketLimiter;
use pace_limit::WindowConfig;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower_pace::PaceError;
use tower_pace::RateLimitLayer;
use tower_pace::RetryLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn mock_api_call(_req: ()) -> Result<&'static str, BoxError> {
    // Simulate a remote call (50ms of latency)
    sleep(Duration::from_millis(50)).await;
    Ok("success")
}

#[derive(Default)]
struct RejectionCounter {
    timeouts: usize,
    rate_limited: usize,
    locks: usize,
    limiter: usize,
    unknown: usize,
}

impl RejectionCounter {
    fn count(&mut self, err: &BoxError) {
        match err.downcast_ref::<PaceError>() {
            Some(PaceError::Timeout) => self.timeouts += 1,
            Some(PaceError::RateLimited { .. } | PaceError::Throttled { .. }) => {
                self.rate_limited += 1
            }
            Some(PaceError::LockUnavailable { .. }) => self.locks += 1,
            Some(PaceError::Limiter(_) | PaceError::Inner(_)) => self.limiter += 1,
            None if err.is::<tower::timeout::error::Elapsed>() => self.timeouts += 1,
            None => self.unknown += 1,
        }
    }

    fn total(&self) -> usize {
        self.timeouts + self.rate_limited + self.locks + self.limiter + self.unknown
    }
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: usize) -> Result<(), BoxError>
where
    S: Service<(), Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    info!(scenario = name, total_reqs, "starting");
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut hist_ready = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3)?;

    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();

    let barrier = Arc::new(Barrier::new(total_reqs));

    for _ in 0..total_reqs {
        let mut local_svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let ready_res = local_svc.ready().await;
            let ready = req_start.elapsed();

            if let Ok(ready_svc) = ready_res {
                let res = ready_svc.call(()).await;
                (res, ready, req_start.elapsed())
            } else {
                (ready_res.map(|_| ""), ready, req_start.elapsed())
            }
        });
    }

    let mut success_count = 0;

    while let Some(task) = tasks.join_next().await {
        let (res, ready, elapsed) = task?;
        match res {
            Ok(_) => {
                success_count += 1;
                hist_ready.record(ready.as_nanos() as u64)?;
                hist_elapsed.record(elapsed.as_micros() as u64)?;
            }
            Err(e) => rejections.count(&e),
        }
    }

    let total_duration = start.elapsed();
    let throughput = total_reqs as f64 / total_duration.as_secs_f64();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Total Rate:      {:.2} req/sec", throughput);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!(
            "P99 (Elapsed):   {}µs",
            hist_elapsed.value_at_quantile(0.99)
        );
        println!("P50 (Ready):     {}ns", hist_ready.value_at_quantile(0.5));
        println!("P99 (Ready):     {}ns", hist_ready.value_at_quantile(0.99));
    }

    let total_errors = rejections.total();
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Timeouts:     {}", rejections.timeouts);
        println!("  └─ RateLimited:  {}", rejections.rate_limited);
        if rejections.locks > 0 {
            println!("  └─ Lock:         {}", rejections.locks);
        }
        if rejections.limiter > 0 {
            println!("  └─ Limiter:      {}", rejections.limiter);
        }
        if rejections.unknown > 0 {
            println!("  └─ Unknown:      {}", rejections.unknown);
        }
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let capacity = 5_000;
    let rate = BucketConfig::per_second(f64::from(capacity), capacity);
    let timeout = Duration::from_millis(550);
    let total_reqs = 20_000;

    // 1.a. Token bucket, waiting as long as it takes
    let bucket = Arc::new(TokenBucketLimiter::new(rate.clone())?);
    let bucket_svc = RateLimitLayer::new(bucket).layer(service_fn(mock_api_call));
    run_load_test("Raw Token Bucket", bucket_svc, total_reqs).await?;

    // 1.b. Token bucket with a unified timeout
    let bucket = Arc::new(TokenBucketLimiter::new(rate.clone())?);
    let bucket_svc = RateLimitLayer::new(bucket)
        .with_timeout(timeout)
        .layer(service_fn(mock_api_call));
    run_load_test("Timed Token Bucket", bucket_svc, total_reqs).await?;

    // 1.c. Token bucket failing fast, with retries backing off
    let bucket = Arc::new(TokenBucketLimiter::new(rate)?);
    let policy = RetryPolicy::new(8, Duration::from_millis(10), Duration::from_secs(2), true)?;
    let retry_svc = ServiceBuilder::new()
        .layer(RetryLayer::new(policy))
        .layer(RateLimitLayer::new(bucket).with_fail_fast(true))
        .service(service_fn(mock_api_call));
    run_load_test("Retrying Token Bucket", retry_svc, total_reqs).await?;

    // 2. Cross-process window. Every check locks and rewrites a file, so keep it small.
    let dir = tempfile::tempdir()?;
    let window: Arc<dyn Limiter> = Arc::new(CrossProcessCoordinator::new(WindowConfig::new(
        500,
        Duration::from_secs(1),
        dir.path().join("stress.json"),
    ))?);
    let window_svc = RateLimitLayer::new(window)
        .with_timeout(timeout)
        .layer(service_fn(mock_api_call));
    run_load_test("Timed Cross-Process Window", window_svc, 2_000).await?;

    // 3. Tower Built-in for comparison
    let tower_svc = ServiceBuilder::new()
        .buffer(capacity as usize)
        .timeout(timeout)
        .rate_limit(u64::from(capacity), Duration::from_secs(1))
        .service(service_fn(mock_api_call));
    run_load_test("Timed Tower RateLimit", tower_svc, total_reqs).await?;

    Ok(())
}
