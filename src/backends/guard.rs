//! Timeout, rate limiting and usage accounting around any adapter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{
    Backend, BackendError, GenerationParams, Provider, ProviderUsage, RateLimiter, RawResponse,
};
use crate::message::Message;

/// Wraps an adapter with the provider-specific call policy.
///
/// A call that does not complete within `timeout` is reported as a
/// transient error; the in-flight future is dropped.
#[derive(Debug, Clone)]
pub struct GuardedBackend {
    inner: Arc<dyn Backend>,
    timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
    usage: Option<Arc<ProviderUsage>>,
}

impl GuardedBackend {
    /// Wraps `inner` with a per-call timeout.
    pub fn new(inner: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            limiter: None,
            usage: None,
        }
    }

    /// Shares a provider rate limiter with this adapter.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Shares provider usage counters with this adapter.
    pub fn with_usage(mut self, usage: Arc<ProviderUsage>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Returns the per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait::async_trait]
impl Backend for GuardedBackend {
    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    #[instrument(skip(self, messages, params), fields(provider = %self.inner.provider(), timeout_ms = self.timeout.as_millis() as u64))]
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        if let Some(usage) = &self.usage {
            usage.record_request();
        }

        let result = match tokio::time::timeout(self.timeout, self.inner.generate(messages, params))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Provider call timed out");
                Err(BackendError::transient(format!(
                    "timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
        };

        if let Some(usage) = &self.usage {
            match &result {
                Ok(response) => usage.record_tokens(&response.token_usage),
                Err(_) => usage.record_failure(),
            }
        }
        debug!(ok = result.is_ok(), "Guarded call finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ScriptedBackend, ScriptedReply};

    #[tokio::test]
    async fn slow_call_becomes_transient() {
        let scripted = ScriptedBackend::new(vec![ScriptedReply::delayed(
            Duration::from_millis(300),
            "too late",
        )]);
        let guarded = GuardedBackend::new(Arc::new(scripted), Duration::from_millis(10));

        let err = guarded
            .generate(&[Message::user("hi")], &GenerationParams::default())
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn usage_is_counted() {
        let scripted = ScriptedBackend::new(vec![
            ScriptedReply::text("ok"),
            ScriptedReply::fatal("nope"),
        ]);
        let usage = Arc::new(ProviderUsage::default());
        let guarded = GuardedBackend::new(Arc::new(scripted), Duration::from_secs(1))
            .with_usage(Arc::clone(&usage));

        let messages = [Message::user("hello")];
        let params = GenerationParams::default();
        assert!(guarded.generate(&messages, &params).await.is_ok());
        assert!(guarded.generate(&messages, &params).await.is_err());

        let snapshot = usage.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.failures, 1);
        assert!(snapshot.prompt_tokens > 0);
    }
}
