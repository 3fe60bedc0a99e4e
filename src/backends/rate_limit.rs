//! Per-provider rate limiting and usage accounting shared across episodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{Provider, TokenUsage};

/// Token bucket limiting requests per minute to one provider.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: AtomicU32,
    bucket: tokio::sync::Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Creates a bucket allowing `requests_per_minute`, with bursts up to the
    /// same amount.
    #[instrument]
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let requests_per_minute = requests_per_minute.max(1);
        debug!(requests_per_minute, "Creating rate limiter");
        Self {
            requests_per_minute: AtomicU32::new(requests_per_minute),
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: f64::from(requests_per_minute),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Current rate.
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute.load(Ordering::Relaxed)
    }

    /// Lowers the rate to `requests_per_minute` if that is stricter.
    pub fn tighten(&self, requests_per_minute: u32) {
        self.requests_per_minute
            .fetch_min(requests_per_minute.max(1), Ordering::Relaxed);
    }

    /// Waits until a request slot is available and takes it.
    #[instrument(skip(self))]
    pub async fn acquire(&self) {
        loop {
            let capacity = f64::from(self.requests_per_minute());
            let refill_per_sec = capacity / 60.0;
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
                bucket.refilled_at = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / refill_per_sec)
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Atomic usage counters for one provider.
#[derive(Debug, Default)]
pub struct ProviderUsage {
    requests: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

/// Point-in-time copy of [`ProviderUsage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Calls attempted.
    pub requests: u64,
    /// Calls that returned an error.
    pub failures: u64,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens consumed.
    pub completion_tokens: u64,
}

impl ProviderUsage {
    /// Counts one attempted call.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed call.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds the tokens of a successful call.
    pub fn record_tokens(&self, usage: &TokenUsage) {
        self.prompt_tokens
            .fetch_add(u64::from(usage.prompt_tokens), Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(u64::from(usage.completion_tokens), Ordering::Relaxed);
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Shared limiter and usage counters, one set per provider.
#[derive(Debug, Clone, Default)]
pub struct QuotaRegistry {
    limiters: Arc<Mutex<HashMap<Provider, Arc<RateLimiter>>>>,
    usage: Arc<Mutex<HashMap<Provider, Arc<ProviderUsage>>>>,
}

impl QuotaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the provider's limiter, creating it with `requests_per_minute`
    /// on first use.
    ///
    /// Every model of a provider shares one limiter. When models ask for
    /// different rates the lowest one wins.
    #[instrument(skip(self))]
    pub fn limiter(&self, provider: Provider, requests_per_minute: u32) -> Arc<RateLimiter> {
        let mut limiters = match self.limiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Limiter map poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let limiter = Arc::clone(
            limiters
                .entry(provider)
                .or_insert_with(|| Arc::new(RateLimiter::per_minute(requests_per_minute))),
        );
        let current = limiter.requests_per_minute();
        if requests_per_minute.max(1) != current {
            warn!(
                %provider,
                current,
                requested = requests_per_minute,
                "Conflicting rate limits for one provider, keeping the lower"
            );
            limiter.tighten(requests_per_minute);
        }
        limiter
    }

    /// Returns the provider's usage counters.
    #[instrument(skip(self))]
    pub fn usage(&self, provider: Provider) -> Arc<ProviderUsage> {
        let mut usage = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Usage map poisoned, recovering");
                poisoned.into_inner()
            }
        };
        Arc::clone(usage.entry(provider).or_default())
    }

    /// Snapshots usage of every provider seen so far.
    pub fn report(&self) -> Vec<(Provider, UsageSnapshot)> {
        let usage = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut report: Vec<_> = usage.iter().map(|(p, u)| (*p, u.snapshot())).collect();
        report.sort_by_key(|(p, _)| p.to_string());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_does_not_wait() {
        let limiter = RateLimiter::per_minute(3);
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn usage_counters_are_shared_per_provider() {
        let quotas = QuotaRegistry::new();
        let a = quotas.usage(Provider::OpenAI);
        let b = quotas.usage(Provider::OpenAI);
        a.record_request();
        b.record_request();
        b.record_tokens(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            estimated: false,
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let usage = quotas.usage(Provider::OpenAI);
                tokio::spawn(async move { usage.record_request() })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task panicked");
        }

        let snapshot = quotas.usage(Provider::OpenAI).snapshot();
        assert_eq!(snapshot.requests, 10);
        assert_eq!(snapshot.prompt_tokens, 10);
        assert_eq!(snapshot.completion_tokens, 5);
        assert_eq!(quotas.usage(Provider::Anthropic).snapshot().requests, 0);
    }

    #[test]
    fn limiter_is_shared_per_provider() {
        let quotas = QuotaRegistry::new();
        let a = quotas.limiter(Provider::Anthropic, 10);
        let b = quotas.limiter(Provider::Anthropic, 99);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.requests_per_minute(), 10);
    }

    #[test]
    fn stricter_rate_wins_for_shared_limiter() {
        let quotas = QuotaRegistry::new();
        let first = quotas.limiter(Provider::OpenAI, 60);
        let second = quotas.limiter(Provider::OpenAI, 6);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.requests_per_minute(), 6);
        assert_eq!(quotas.limiter(Provider::Ollama, 0).requests_per_minute(), 1);
    }
}
