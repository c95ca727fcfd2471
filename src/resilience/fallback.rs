//! Graceful degradation through an ordered chain of fallback strategies.
//!
//! The primary operation runs first. On failure each strategy of the chain is
//! tried in order; the first handler that succeeds supplies the result. If
//! every handler fails, the primary error is returned unchanged.

use crate::errors::{RecoveryError, RecoveryResult};
use crate::observability::{log_error, metric_names, MetricsCollector};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default template for [`ErrorMessageHandler`].
pub const DEFAULT_ERROR_TEMPLATE: &str = "Service temporarily unavailable: {error}";

/// Fallback strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    DefaultValue,
    CachedValue,
    AlternativeProvider,
    DegradedFunctionality,
    ErrorMessage,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::DefaultValue => "default_value",
            FallbackStrategy::CachedValue => "cached_value",
            FallbackStrategy::AlternativeProvider => "alternative_provider",
            FallbackStrategy::DegradedFunctionality => "degraded_functionality",
            FallbackStrategy::ErrorMessage => "error_message",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sent to an AI provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl AiRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Response returned by an AI provider or synthesized by a fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AiResponse {
    /// True if this response was produced by a fallback rather than a provider.
    pub fn is_fallback(&self) -> bool {
        self.metadata
            .get("fallback")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Placeholder result produced by [`ErrorMessageHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedResponse {
    pub message: String,
    pub provider: String,
    pub model: String,
    pub error: String,
}

impl From<DegradedResponse> for AiResponse {
    fn from(degraded: DegradedResponse) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("fallback".to_string(), serde_json::Value::Bool(true));
        metadata.insert("error".to_string(), serde_json::Value::String(degraded.error));
        Self {
            content: degraded.message,
            provider: degraded.provider,
            model: degraded.model,
            metadata,
        }
    }
}

impl From<DegradedResponse> for String {
    fn from(degraded: DegradedResponse) -> Self {
        degraded.message
    }
}

/// What a fallback handler knows about the failed call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FallbackContext {
    pub cache_key: Option<String>,
    /// Provider that just failed
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request: Option<AiRequest>,
}

impl FallbackContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_request(mut self, request: AiRequest) -> Self {
        self.request = Some(request);
        self
    }
}

/// A single fallback strategy.
#[async_trait]
pub trait FallbackHandler<T>: Send + Sync {
    /// Strategy this handler implements; the manager keys handlers by it.
    fn strategy(&self) -> FallbackStrategy;

    /// Produces a substitute result for the failed call.
    async fn handle(&self, error: &RecoveryError, context: &FallbackContext) -> RecoveryResult<T>;
}

/// Response cache consulted by [`CachedValueHandler`].
#[async_trait]
pub trait ResponseCache<V>: Send + Sync {
    async fn get(&self, key: &str) -> Option<V>;
    async fn set(&self, key: &str, value: V, ttl: Option<Duration>);
}

/// Client able to send a request to a named provider.
#[async_trait]
pub trait ProviderClient<V>: Send + Sync {
    /// Names of every configured provider.
    fn providers(&self) -> Vec<String>;

    async fn call(&self, provider: &str, request: &AiRequest) -> RecoveryResult<V>;
}

/// Returns a fixed value.
pub struct DefaultValueHandler<T> {
    value: T,
}

impl<T> DefaultValueHandler<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> FallbackHandler<T> for DefaultValueHandler<T> {
    fn strategy(&self) -> FallbackStrategy {
        FallbackStrategy::DefaultValue
    }

    async fn handle(&self, error: &RecoveryError, _context: &FallbackContext) -> RecoveryResult<T> {
        tracing::info!(error = %error, "Returning default value");
        Ok(self.value.clone())
    }
}

/// Looks the failed call up in a response cache. Requires a cache key.
pub struct CachedValueHandler<T> {
    cache: Arc<dyn ResponseCache<T>>,
}

impl<T> CachedValueHandler<T> {
    pub fn new(cache: Arc<dyn ResponseCache<T>>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<T: Send + 'static> FallbackHandler<T> for CachedValueHandler<T> {
    fn strategy(&self) -> FallbackStrategy {
        FallbackStrategy::CachedValue
    }

    async fn handle(&self, error: &RecoveryError, context: &FallbackContext) -> RecoveryResult<T> {
        let key = context
            .cache_key
            .as_deref()
            .ok_or_else(|| RecoveryError::fallback("No cache_key in context for cached fallback"))?;

        match self.cache.get(key).await {
            Some(value) => {
                tracing::info!(cache_key = key, error = %error, "Returning cached value");
                Ok(value)
            }
            None => Err(RecoveryError::fallback(format!(
                "No cached value found for key: {}",
                key
            ))),
        }
    }
}

/// Replays the request against the other providers, in order.
pub struct AlternativeProviderHandler<T> {
    providers: Vec<String>,
    client: Arc<dyn ProviderClient<T>>,
}

impl<T> AlternativeProviderHandler<T> {
    pub fn new(providers: Vec<String>, client: Arc<dyn ProviderClient<T>>) -> Self {
        Self { providers, client }
    }
}

#[async_trait]
impl<T: Send + 'static> FallbackHandler<T> for AlternativeProviderHandler<T> {
    fn strategy(&self) -> FallbackStrategy {
        FallbackStrategy::AlternativeProvider
    }

    async fn handle(&self, _error: &RecoveryError, context: &FallbackContext) -> RecoveryResult<T> {
        let request = context
            .request
            .as_ref()
            .ok_or_else(|| RecoveryError::fallback("No request in context for provider fallback"))?;
        let failed = context.provider.as_deref();

        for provider in self.providers.iter().filter(|p| Some(p.as_str()) != failed) {
            tracing::info!(provider = %provider, "Trying alternative provider");
            match self.client.call(provider, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(provider = %provider, error = %e, "Alternative provider failed");
                }
            }
        }

        Err(RecoveryError::fallback("All alternative providers failed"))
    }
}

type DegradedFn<T> = dyn Fn(FallbackContext) -> BoxFuture<'static, RecoveryResult<T>> + Send + Sync;

/// Delegates to a cheaper implementation of the operation.
pub struct DegradedFunctionalityHandler<T> {
    func: Box<DegradedFn<T>>,
}

impl<T: Send + 'static> DegradedFunctionalityHandler<T> {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RecoveryResult<T>> + Send + 'static,
    {
        Self {
            func: Box::new(move |context| func(context).boxed()),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> FallbackHandler<T> for DegradedFunctionalityHandler<T> {
    fn strategy(&self) -> FallbackStrategy {
        FallbackStrategy::DegradedFunctionality
    }

    async fn handle(&self, error: &RecoveryError, context: &FallbackContext) -> RecoveryResult<T> {
        tracing::info!(error = %error, "Executing degraded functionality");
        (self.func)(context.clone()).await
    }
}

/// Synthesizes an error message result. Never fails.
pub struct ErrorMessageHandler {
    template: String,
}

impl Default for ErrorMessageHandler {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_TEMPLATE)
    }
}

impl ErrorMessageHandler {
    /// `{error}` in `template` is replaced by the error text.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl<T> FallbackHandler<T> for ErrorMessageHandler
where
    T: From<DegradedResponse> + Send + 'static,
{
    fn strategy(&self) -> FallbackStrategy {
        FallbackStrategy::ErrorMessage
    }

    async fn handle(&self, error: &RecoveryError, context: &FallbackContext) -> RecoveryResult<T> {
        let error_text = error.to_string();
        let message = self.template.replace("{error}", &error_text);
        tracing::info!(message = %message, "Returning error message");

        Ok(T::from(DegradedResponse {
            message,
            provider: context.provider.clone().unwrap_or_else(|| "fallback".to_string()),
            model: context.model.clone().unwrap_or_else(|| "fallback".to_string()),
            error: error_text,
        }))
    }
}

/// Manages fallback strategies for one result type.
///
/// At most one handler is registered per strategy. The strategy chain sets
/// the attempt order; handlers only define what is available.
pub struct FallbackManager<T> {
    handlers: RwLock<HashMap<FallbackStrategy, Arc<dyn FallbackHandler<T>>>>,
    strategy_chain: RwLock<Vec<FallbackStrategy>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl<T: Send + 'static> Default for FallbackManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> FallbackManager<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            strategy_chain: RwLock::new(Vec::new()),
            metrics: None,
        }
    }

    /// Count served fallbacks in a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers `handler` under its own strategy, replacing any previous one.
    pub fn register_handler(&self, handler: Arc<dyn FallbackHandler<T>>) {
        let strategy = handler.strategy();
        tracing::debug!(strategy = %strategy, "Registered fallback handler");
        self.handlers.write().insert(strategy, handler);
    }

    pub fn has_handler(&self, strategy: FallbackStrategy) -> bool {
        self.handlers.read().contains_key(&strategy)
    }

    /// Sets the default attempt order.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Configuration`] if a strategy has no handler.
    pub fn set_strategy_chain(&self, chain: Vec<FallbackStrategy>) -> RecoveryResult<()> {
        {
            let handlers = self.handlers.read();
            if let Some(missing) = chain.iter().find(|s| !handlers.contains_key(s)) {
                return Err(RecoveryError::configuration(format!(
                    "No handler registered for fallback strategy '{}'",
                    missing
                )));
            }
        }
        *self.strategy_chain.write() = chain;
        Ok(())
    }

    pub fn strategy_chain(&self) -> Vec<FallbackStrategy> {
        self.strategy_chain.read().clone()
    }

    /// Runs `f`; on failure tries `strategies` (or the default chain) in order.
    ///
    /// Override strategies without a handler are skipped. If no handler
    /// succeeds, the error of `f` is returned.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        f: F,
        context: &FallbackContext,
        strategies: Option<&[FallbackStrategy]>,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        let primary_error = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        tracing::error!(error = %primary_error, "Primary operation failed");

        let chain = match strategies {
            Some(strategies) => strategies.to_vec(),
            None => self.strategy_chain(),
        };

        for strategy in chain {
            let handler = self.handlers.read().get(&strategy).cloned();
            let Some(handler) = handler else {
                tracing::warn!(strategy = %strategy, "No handler registered for strategy");
                continue;
            };

            tracing::info!(strategy = %strategy, "Trying fallback strategy");
            match handler.handle(&primary_error, context).await {
                Ok(value) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.increment_counter(
                            metric_names::FALLBACK_USED,
                            1,
                            &[("strategy", strategy.as_str())],
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(strategy = %strategy, error = %e, "Fallback strategy failed");
                }
            }
        }

        log_error(&primary_error, "all fallback strategies failed");
        Err(primary_error)
    }
}

impl<T> FallbackManager<T>
where
    T: From<DegradedResponse> + Send + 'static,
{
    /// Registers the standard AI chain and returns it.
    ///
    /// Cached value when a cache is given, alternative provider when the
    /// client knows more than one provider, error message always last. Pass
    /// the result to [`set_strategy_chain`](Self::set_strategy_chain) or use
    /// it as a per-call override.
    pub fn ai_fallback_chain(
        &self,
        cache: Option<Arc<dyn ResponseCache<T>>>,
        client: Option<Arc<dyn ProviderClient<T>>>,
    ) -> Vec<FallbackStrategy> {
        let mut chain = Vec::new();

        if let Some(cache) = cache {
            self.register_handler(Arc::new(CachedValueHandler::new(cache)));
            chain.push(FallbackStrategy::CachedValue);
        }

        if let Some(client) = client {
            let providers = client.providers();
            if providers.len() > 1 {
                self.register_handler(Arc::new(AlternativeProviderHandler::new(providers, client)));
                chain.push(FallbackStrategy::AlternativeProvider);
            }
        }

        self.register_handler(Arc::new(ErrorMessageHandler::default()));
        chain.push(FallbackStrategy::ErrorMessage);

        chain
    }
}
