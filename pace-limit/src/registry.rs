use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::CrossProcessCoordinator;
use crate::LimitError;
use crate::Limiter;
use crate::LimiterConfig;
use crate::LimiterStatus;
use crate::RegistryConfig;
use crate::RetryPolicy;
use crate::Scoped;
use crate::TokenBucketLimiter;

/// Name to limiter lookup, built once at startup and passed to whoever needs it.
///
/// Each entry is an independent limiter; two names never share a budget
/// unless they are configured with the same state file.
#[derive(Debug, Clone, Default)]
pub struct LimiterRegistry {
    limiters: BTreeMap<String, Arc<dyn Limiter>>,
    retry: Option<RetryPolicy>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every limiter described by `config`.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, LimitError> {
        config.validate()?;
        let mut registry = Self::new();
        for (name, limiter) in &config.limiters {
            let limiter: Arc<dyn Limiter> = match limiter {
                LimiterConfig::TokenBucket(bucket) => {
                    Arc::new(TokenBucketLimiter::new(bucket.clone())?)
                }
                LimiterConfig::CrossProcess(window) => {
                    Arc::new(CrossProcessCoordinator::new(window.clone())?)
                }
            };
            debug!(name = %name, ?limiter, "registered limiter");
            registry.insert(name.clone(), limiter);
        }
        registry.retry = config
            .retry
            .as_ref()
            .map(RetryPolicy::from_config)
            .transpose()?;
        Ok(registry)
    }

    /// Register `limiter` under `name`, returning any limiter it replaces.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        limiter: Arc<dyn Limiter>,
    ) -> Option<Arc<dyn Limiter>> {
        self.limiters.insert(name.into(), limiter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Limiter>> {
        self.limiters.get(name).cloned()
    }

    /// A [`Scoped`] wrapper over the named limiter.
    pub fn scoped(&self, name: &str) -> Option<Scoped<dyn Limiter>> {
        self.get(name).map(Scoped::new)
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = Some(policy);
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Status of every registered limiter, keyed by name.
    pub fn status(&self) -> BTreeMap<String, LimiterStatus> {
        self.limiters
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.status()))
            .collect()
    }
}
