use crate::config::RecoveryConfig;
use crate::errors::RecoveryResult;
use crate::observability::MetricsCollector;
use crate::resilience::fallback::{FallbackContext, FallbackManager};
use crate::resilience::manager::CircuitBreakerManager;
use crate::resilience::resources::{ResourceManager, ResourceRequest, SystemProbe};
use crate::resilience::retry::RetryHandler;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Trait for running an operation through the recovery pipeline
#[async_trait]
pub trait ProtectedExecutor: Send + Sync {
    async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> RecoveryResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = RecoveryResult<T>> + Send,
        T: Send;
}

/// Composes resource gating, retry and the circuit breaker.
///
/// ```text
/// run_with_resources( retry( breaker(operation).call(f) ) )
/// ```
///
/// [`execute_with_fallback`](Self::execute_with_fallback) wraps the whole
/// pipeline in a fallback chain. Breakers are looked up by operation name.
pub struct RecoveryOrchestrator {
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryHandler,
    resources: Arc<ResourceManager>,
    attempt_timeout: Option<Duration>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator from a configuration
    pub fn new(config: RecoveryConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Create a builder for configuring the orchestrator
    pub fn builder() -> RecoveryOrchestratorBuilder {
        RecoveryOrchestratorBuilder::new()
    }

    /// Create an orchestrator that never retries, trips or gates
    pub fn passthrough() -> Self {
        let mut config = RecoveryConfig::default();
        config.retry.max_retries = 0;
        config.circuit_breaker.failure_threshold = u32::MAX;
        config.circuit_breaker.failure_rate_threshold = 1.0;
        config.circuit_breaker.min_calls = usize::MAX;
        config.resources = Default::default();
        Self::new(config)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Runs `f` through the pipeline, charging `request` against the resource gates.
    ///
    /// Rejections surface as `CircuitOpen` or `Resource` errors. Otherwise the
    /// last error of `f` is returned unchanged.
    pub async fn run<F, Fut, T>(&self, operation: &str, request: ResourceRequest, f: F) -> RecoveryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        let breaker = self.breakers.get_breaker(operation, None);
        let protected = self.retry.execute_with_retry(
            || breaker.call(|| f()),
            Some(operation),
            self.attempt_timeout,
        );
        self.resources.run_with_resources(protected, request).await
    }

    /// Like [`run`](Self::run), degrading through `fallback` when the pipeline fails.
    pub async fn execute_with_fallback<F, Fut, T>(
        &self,
        operation: &str,
        request: ResourceRequest,
        f: F,
        fallback: &FallbackManager<T>,
        context: &FallbackContext,
    ) -> RecoveryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
        T: Send + 'static,
    {
        fallback
            .execute_with_fallback(|| self.run(operation, request, f), context, None)
            .await
    }
}

#[async_trait]
impl ProtectedExecutor for RecoveryOrchestrator {
    async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> RecoveryResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = RecoveryResult<T>> + Send,
        T: Send,
    {
        self.run(operation, ResourceRequest::default(), f).await
    }
}

/// Builder for configuring the recovery orchestrator
#[derive(Default)]
pub struct RecoveryOrchestratorBuilder {
    config: RecoveryConfig,
    breakers: Option<Arc<CircuitBreakerManager>>,
    resources: Option<Arc<ResourceManager>>,
    probe: Option<Arc<dyn SystemProbe>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    attempt_timeout: Option<Duration>,
    monitoring: bool,
}

impl RecoveryOrchestratorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration used for components the builder creates
    pub fn config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing breaker manager instead of creating one
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Share an existing resource manager instead of creating one
    pub fn resources(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Usage probe for a resource manager created by the builder
    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Metrics collector for components created by the builder
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deadline for each individual attempt
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Sample resource usage every `monitor_interval` once built
    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.monitoring = enabled;
        self
    }

    /// Build the recovery orchestrator
    ///
    /// With [`monitoring`](Self::monitoring) enabled this must be called from
    /// within a tokio runtime.
    pub fn build(self) -> RecoveryOrchestrator {
        let RecoveryOrchestratorBuilder {
            config,
            breakers,
            resources,
            probe,
            metrics,
            attempt_timeout,
            monitoring,
        } = self;

        let breakers = breakers.unwrap_or_else(|| {
            let mut manager = CircuitBreakerManager::new(config.circuit_breaker.clone());
            if let Some(metrics) = &metrics {
                manager = manager.with_metrics(Arc::clone(metrics));
            }
            Arc::new(manager)
        });

        let resources = resources.unwrap_or_else(|| {
            let mut manager = match probe {
                Some(probe) => ResourceManager::with_probe(config.resources.clone(), probe),
                None => ResourceManager::new(config.resources.clone()),
            };
            if let Some(metrics) = &metrics {
                manager = manager.with_metrics(Arc::clone(metrics));
            }
            Arc::new(manager)
        });
        if monitoring && !resources.is_monitoring() {
            resources.start_monitoring(config.monitor_interval);
        }

        let mut retry = RetryHandler::new(config.retry.clone());
        if let Some(metrics) = metrics {
            retry = retry.with_metrics(metrics);
        }

        RecoveryOrchestrator {
            breakers,
            retry,
            resources,
            attempt_timeout,
        }
    }
}
