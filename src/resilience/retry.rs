use crate::errors::{ErrorClass, ErrorKind, RecoveryError, RecoveryResult};
use crate::observability::{log_error, metric_names, MetricsCollector};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Multiply each delay by a random factor from `jitter_range`
    pub jitter: bool,
    pub jitter_range: (f64, f64),
    /// Error kinds that are retried; everything else propagates immediately
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: (0.8, 1.2),
            retryable_kinds: vec![ErrorKind::Timeout, ErrorKind::Connection],
        }
    }
}

impl RetryConfig {
    /// Classifies `error` against the retryable kind set.
    pub fn classify(&self, error: &RecoveryError) -> ErrorClass {
        let kind = error.kind();
        if self.retryable_kinds.contains(&kind) {
            ErrorClass::Retryable(kind)
        } else {
            ErrorClass::Fatal(kind)
        }
    }

    /// Adds `kind` to the retryable set.
    pub fn with_retryable(mut self, kind: ErrorKind) -> Self {
        if !self.retryable_kinds.contains(&kind) {
            self.retryable_kinds.push(kind);
        }
        self
    }
}

/// Retries transient failures with exponential backoff.
///
/// Per-operation retry counts are kept for introspection: the count is the
/// number of failed attempts of the latest run, reset to 0 on success.
pub struct RetryHandler {
    config: RetryConfig,
    retry_counts: Mutex<HashMap<String, u32>>,
    retry_hook: Option<Arc<dyn RetryHook>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl RetryHandler {
    /// Create a new retry handler with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_counts: Mutex::new(HashMap::new()),
            retry_hook: None,
            metrics: None,
        }
    }

    /// Add a retry hook for custom retry logic
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.retry_hook = Some(hook);
        self
    }

    /// Count retry attempts in a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `f` with the default operation id and no per-attempt timeout.
    pub async fn execute<F, Fut, T>(&self, f: F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        self.execute_with_retry(f, None, None).await
    }

    /// Runs `f` up to `max_retries + 1` times.
    ///
    /// `operation_id` keys the retry statistics and defaults to the type name
    /// of `f`. When `timeout` is set each attempt gets its own deadline; an
    /// attempt that misses it fails with [`RecoveryError::Timeout`].
    ///
    /// Non-retryable errors propagate on first occurrence. When every attempt
    /// fails the last error is returned.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut f: F,
        operation_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        let operation = operation_id
            .map(str::to_string)
            .unwrap_or_else(|| std::any::type_name::<F>().to_string());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(RecoveryError::Timeout {
                        message: format!(
                            "attempt {} of '{}' exceeded {:?}",
                            attempt, operation, limit
                        ),
                    }),
                },
                None => f().await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation = %operation, attempt, "Operation succeeded after retry");
                    }
                    self.retry_counts.lock().insert(operation, 0);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if let ErrorClass::Fatal(kind) = self.config.classify(&error) {
                tracing::debug!(operation = %operation, kind = %kind, "Non-retryable error, not retrying");
                return Err(error);
            }

            self.retry_counts.lock().insert(operation.clone(), attempt);

            if attempt > self.config.max_retries {
                log_error(
                    &error,
                    &format!("retries exhausted for {} after {} attempts", operation, attempt),
                );
                if let Some(metrics) = &self.metrics {
                    metrics.increment_counter(
                        metric_names::RETRY_EXHAUSTED,
                        1,
                        &[("operation", &operation)],
                    );
                }
                return Err(error);
            }

            let mut delay = self.calculate_delay(attempt);

            if let Some(hook) = &self.retry_hook {
                let decision = hook
                    .on_retry(RetryContext {
                        attempt,
                        error: error.clone(),
                        delay,
                        operation: operation.clone(),
                    })
                    .await;
                match decision {
                    RetryDecision::Abort => return Err(error),
                    RetryDecision::Retry(custom_delay) => delay = custom_delay,
                    RetryDecision::Default => {}
                }
            }

            tracing::warn!(
                operation = %operation,
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            if let Some(metrics) = &self.metrics {
                metrics.increment_counter(metric_names::RETRY_ATTEMPTS, 1, &[("operation", &operation)]);
            }

            sleep(delay).await;
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_secs_f64() * self.config.exponential_base.powi(exponent);
        let mut delay = base.min(self.config.max_delay.as_secs_f64());

        if self.config.jitter {
            let (low, high) = self.config.jitter_range;
            let factor = if low < high {
                rand::thread_rng().gen_range(low..=high)
            } else {
                low
            };
            delay *= factor;
        }

        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(self.config.max_delay)
    }

    /// Retry counts per operation id.
    pub fn get_retry_stats(&self) -> HashMap<String, u32> {
        self.retry_counts.lock().clone()
    }

    /// Clears the count of one operation, or of all when `None`.
    pub fn reset_stats(&self, operation_id: Option<&str>) {
        let mut counts = self.retry_counts.lock();
        match operation_id {
            Some(id) => {
                counts.remove(id);
            }
            None => counts.clear(),
        }
    }
}

/// Hook for custom retry behavior
#[async_trait]
pub trait RetryHook: Send + Sync {
    async fn on_retry(&self, context: RetryContext) -> RetryDecision;
}

/// Context information for a retry attempt
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub error: RecoveryError,
    pub delay: Duration,
    pub operation: String,
}

/// Decision on how to proceed with a retry
#[derive(Debug)]
pub enum RetryDecision {
    /// Use the default retry behavior
    Default,
    /// Retry with a custom delay
    Retry(Duration),
    /// Abort the retry and return the error
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{CapturedLogs, InMemoryMetricsCollector};
    use test_case::test_case;

    fn connection_error() -> RecoveryError {
        RecoveryError::Connection {
            message: "connection reset".to_string(),
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(10),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_first_attempt() {
        let handler = RetryHandler::new(RetryConfig::default());

        let mut attempt_count = 0;
        let result = handler
            .execute_with_retry(
                || {
                    attempt_count += 1;
                    async { Ok(42) }
                },
                Some("generate"),
                None,
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempt_count, 1);
        assert_eq!(handler.get_retry_stats().get("generate"), Some(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_error_then_succeeds() {
        let handler = RetryHandler::new(fast_config(3));

        let mut attempt_count = 0;
        let result = handler
            .execute_with_retry(
                || {
                    attempt_count += 1;
                    let count = attempt_count;
                    async move {
                        if count < 3 {
                            Err(connection_error())
                        } else {
                            Ok(42)
                        }
                    }
                },
                Some("generate"),
                None,
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempt_count, 3);
        assert_eq!(handler.get_retry_stats().get("generate"), Some(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let handler = RetryHandler::new(fast_config(2));

        let mut attempt_count = 0;
        let result: RecoveryResult<()> = handler
            .execute_with_retry(
                || {
                    attempt_count += 1;
                    let count = attempt_count;
                    async move {
                        Err(RecoveryError::Connection {
                            message: format!("failure {}", count),
                        })
                    }
                },
                Some("generate"),
                None,
            )
            .await;

        assert_eq!(attempt_count, 3);
        assert_eq!(
            result,
            Err(RecoveryError::Connection {
                message: "failure 3".to_string()
            })
        );
        assert_eq!(handler.get_retry_stats().get("generate"), Some(&3));
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let handler = RetryHandler::new(fast_config(5));

        let mut attempt_count = 0;
        let result: RecoveryResult<()> = handler
            .execute(|| {
                attempt_count += 1;
                async {
                    Err(RecoveryError::Validation {
                        message: "X".to_string(),
                    })
                }
            })
            .await;

        assert_eq!(attempt_count, 1);
        assert!(matches!(result, Err(RecoveryError::Validation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_is_retried() {
        let handler = RetryHandler::new(fast_config(2));

        let mut attempt_count = 0;
        let result: RecoveryResult<u32> = handler
            .execute_with_retry(
                || {
                    attempt_count += 1;
                    async {
                        sleep(Duration::from_secs(10)).await;
                        Ok(1)
                    }
                },
                Some("slow"),
                Some(Duration::from_secs(1)),
            )
            .await;

        assert_eq!(attempt_count, 3);
        assert!(matches!(result, Err(RecoveryError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried_when_excluded() {
        let config = RetryConfig {
            retryable_kinds: vec![ErrorKind::Connection],
            ..fast_config(2)
        };
        let handler = RetryHandler::new(config);

        let mut attempt_count = 0;
        let result: RecoveryResult<u32> = handler
            .execute_with_retry(
                || {
                    attempt_count += 1;
                    std::future::pending()
                },
                Some("slow"),
                Some(Duration::from_millis(100)),
            )
            .await;

        assert_eq!(attempt_count, 1);
        assert!(matches!(result, Err(RecoveryError::Timeout { .. })));
    }

    #[test_case(ErrorKind::Timeout, true)]
    #[test_case(ErrorKind::Connection, true)]
    #[test_case(ErrorKind::RateLimit, false)]
    #[test_case(ErrorKind::CircuitOpen, false)]
    #[test_case(ErrorKind::Validation, false)]
    fn test_default_classification(kind: ErrorKind, retryable: bool) {
        let error = match kind {
            ErrorKind::Timeout => RecoveryError::Timeout { message: "t".into() },
            ErrorKind::Connection => connection_error(),
            ErrorKind::RateLimit => RecoveryError::RateLimit {
                message: "r".into(),
                retry_after: None,
            },
            ErrorKind::CircuitOpen => RecoveryError::CircuitOpen {
                name: "cache_exact".into(),
                retry_after: None,
            },
            _ => RecoveryError::Validation { message: "v".into() },
        };

        let class = RetryConfig::default().classify(&error);
        assert_eq!(class.is_retryable(), retryable);
        assert_eq!(class.kind(), kind);
    }

    #[test]
    fn test_with_retryable_extends_set() {
        let config = RetryConfig::default().with_retryable(ErrorKind::RateLimit);
        let error = RecoveryError::RateLimit {
            message: "slow down".into(),
            retry_after: None,
        };
        assert_eq!(config.classify(&error), ErrorClass::Retryable(ErrorKind::RateLimit));
    }

    #[test]
    fn test_calculate_delay_without_jitter() {
        let handler = RetryHandler::new(RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        });

        assert_eq!(handler.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(handler.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(handler.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(handler.calculate_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_calculate_delay_jitter_bounds() {
        let handler = RetryHandler::new(RetryConfig {
            initial_delay: Duration::from_secs(1),
            ..Default::default()
        });

        for _ in 0..100 {
            let delay = handler.calculate_delay(2).as_secs_f64();
            assert!((1.6..=2.4).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stats() {
        let handler = RetryHandler::new(fast_config(1));
        for id in ["a", "b"] {
            let _: RecoveryResult<()> = handler
                .execute_with_retry(|| async { Err(connection_error()) }, Some(id), None)
                .await;
        }
        assert_eq!(handler.get_retry_stats().len(), 2);

        handler.reset_stats(Some("a"));
        assert_eq!(handler.get_retry_stats().get("a"), None);
        assert_eq!(handler.get_retry_stats().get("b"), Some(&2));

        handler.reset_stats(None);
        assert!(handler.get_retry_stats().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_count_attempts_and_exhaustion() {
        let metrics = Arc::new(InMemoryMetricsCollector::new());
        let handler = RetryHandler::new(fast_config(2)).with_metrics(metrics.clone());

        let _: RecoveryResult<()> = handler
            .execute_with_retry(|| async { Err(connection_error()) }, Some("search"), None)
            .await;

        assert_eq!(metrics.get_counter("vibezen.retry.attempts:operation=search"), 2);
        assert_eq!(metrics.get_counter("vibezen.retry.exhausted:operation=search"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_logs_error_with_operation() {
        let logs = CapturedLogs::start();
        let handler = RetryHandler::new(fast_config(1));

        let _: RecoveryResult<()> = handler
            .execute_with_retry(|| async { Err(connection_error()) }, Some("o3_search"), None)
            .await;

        let output = logs.contents();
        assert!(output.contains("ERROR"));
        assert!(output.contains("retries exhausted for o3_search after 2 attempts"));
        assert!(output.contains("connection reset"));
    }

    struct AbortingHook;

    #[async_trait]
    impl RetryHook for AbortingHook {
        async fn on_retry(&self, _context: RetryContext) -> RetryDecision {
            RetryDecision::Abort
        }
    }

    #[tokio::test]
    async fn test_retry_hook_abort() {
        let handler = RetryHandler::new(RetryConfig::default()).with_hook(Arc::new(AbortingHook));

        let mut attempt_count = 0;
        let result: RecoveryResult<()> = handler
            .execute(|| {
                attempt_count += 1;
                async { Err(connection_error()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }
}
