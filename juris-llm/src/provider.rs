use async_trait::async_trait;
use juris_core::JurisResult;
use std::sync::Arc;

// ============================================================================
// COMPLETION PROVIDER
// ============================================================================

/// A text completion service.
///
/// Implementations must be thread-safe. Retries, timeouts and concurrency
/// limits are applied by [`crate::RetryingLimiter`]; a provider makes a
/// single request per call.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable identifier used in logs and errors.
    fn provider_id(&self) -> &str;

    /// Generate a completion for `prompt`.
    ///
    /// # Returns
    /// * `Ok(String)` - The completion text
    /// * `Err(JurisError::Llm)` - If the request fails or the response is unusable
    async fn complete(&self, prompt: &str) -> JurisResult<String>;

    /// Cheap liveness check. Defaults to success for providers without one.
    async fn ping(&self) -> JurisResult<()> {
        Ok(())
    }
}

// ============================================================================
// HEALTH PROBE
// ============================================================================

/// Cheap check run by the limiter instead of a real call while the
/// service is marked unavailable.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> JurisResult<()>;
}

/// Uses a provider's `ping` as the limiter's health probe.
pub struct ProviderProbe {
    provider: Arc<dyn CompletionProvider>,
}

impl ProviderProbe {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl HealthProbe for ProviderProbe {
    async fn check(&self) -> JurisResult<()> {
        self.provider.ping().await
    }
}

impl std::fmt::Debug for ProviderProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderProbe")
            .field("provider", &self.provider.provider_id())
            .finish()
    }
}
