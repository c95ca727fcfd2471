//! Breaker wiring for the VIBEZEN services.
//!
//! [`RecoveryCoordinator`] registers one breaker per service with its preset,
//! runs degradation and recovery actions around protected calls, and turns
//! manager state into a health report.

use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use super::manager::{CircuitBreakerManager, CircuitHealth};
use crate::errors::{RecoveryError, RecoveryResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Breakers whose opening pauses the workflow.
pub const CRITICAL_CIRCUITS: [&str; 2] = ["thinking_engine", "ai_provider_openai"];

const AI_PROVIDERS: [&str; 3] = ["openai", "google", "bedrock"];

type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Health summary with operator recommendations.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub health: CircuitHealth,
    /// Services whose breaker is open
    pub critical_services: Vec<String>,
    pub recommendations: Vec<String>,
    pub detailed_stats: BTreeMap<String, CircuitBreakerStats>,
}

pub struct RecoveryCoordinator {
    manager: Arc<CircuitBreakerManager>,
    degradation_handlers: RwLock<HashMap<String, Action>>,
    recovery_handlers: RwLock<HashMap<String, Action>>,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(CircuitBreakerManager::default()))
    }
}

impl RecoveryCoordinator {
    pub fn new(manager: Arc<CircuitBreakerManager>) -> Self {
        Self {
            manager,
            degradation_handlers: RwLock::new(HashMap::new()),
            recovery_handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<CircuitBreakerManager> {
        &self.manager
    }

    /// Registers the breakers of every VIBEZEN service with its preset.
    pub fn setup_default_breakers(&self) {
        for provider in AI_PROVIDERS {
            self.manager.get_breaker(
                &format!("ai_provider_{}", provider),
                Some(CircuitBreakerConfig::ai_provider()),
            );
        }
        self.manager
            .get_breaker("cache_exact", Some(CircuitBreakerConfig::cache_service()));
        self.manager
            .get_breaker("cache_semantic", Some(CircuitBreakerConfig::cache_service()));
        self.manager
            .get_breaker("o3_search", Some(CircuitBreakerConfig::search_service()));
        self.manager
            .get_breaker("knowledge_graph", Some(CircuitBreakerConfig::knowledge_graph()));
        self.manager
            .get_breaker("thinking_engine", Some(CircuitBreakerConfig::thinking_engine()));

        tracing::info!(
            breakers = self.manager.breaker_names().len(),
            "Default circuit breakers configured"
        );
    }

    /// Runs `handler` whenever a protected call to `name` is rejected by an open breaker.
    pub fn register_degradation_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.degradation_handlers
            .write()
            .insert(name.into(), Arc::new(move || handler().boxed()));
    }

    /// Runs `handler` when a protected call to `name` closes its breaker.
    pub fn register_recovery_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.recovery_handlers
            .write()
            .insert(name.into(), Arc::new(move || handler().boxed()));
    }

    /// Runs `f` through the breaker `name`.
    ///
    /// An open-circuit rejection triggers the degradation handler and is
    /// returned; other errors are returned unchanged.
    pub async fn protected_call<F, Fut, T>(&self, name: &str, f: F) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        let breaker = self.manager.get_breaker(name, None);

        match breaker.call_observed(f).await {
            (Ok(value), recovered) => {
                if recovered {
                    if let Some(handler) = self.handler(&self.recovery_handlers, name) {
                        tracing::info!(breaker = name, "Running recovery handler");
                        handler().await;
                    }
                }
                Ok(value)
            }
            (Err(e @ RecoveryError::CircuitOpen { .. }), _) => {
                tracing::warn!(breaker = name, error = %e, "Protected call rejected");
                if let Some(handler) = self.handler(&self.degradation_handlers, name) {
                    handler().await;
                }
                Err(e)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Like [`protected_call`](Self::protected_call), but serves `fallback`
    /// when the breaker rejects the call.
    pub async fn protected_call_with_fallback<F, Fut, FB, FBFut, T>(
        &self,
        name: &str,
        f: F,
        fallback: FB,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = RecoveryResult<T>>,
    {
        match self.protected_call(name, f).await {
            Err(RecoveryError::CircuitOpen { .. }) => {
                tracing::info!(breaker = name, "Using fallback");
                fallback().await
            }
            other => other,
        }
    }

    /// Manager health plus per-service advice.
    pub fn health_report(&self) -> HealthReport {
        let health = self.manager.get_circuit_health();
        let detailed_stats = self.manager.get_all_stats();

        let mut recommendations = Vec::new();
        let mut critical_services = Vec::new();

        for (name, stats) in &detailed_stats {
            match stats.state {
                CircuitState::Open => {
                    critical_services.push(name.clone());
                    if name.contains("ai_provider") {
                        recommendations.push(format!(
                            "AI provider '{}' is down. Consider using fallback providers.",
                            name
                        ));
                    } else if name == "thinking_engine" {
                        recommendations.push(
                            "Sequential Thinking is unavailable. Quality checks may be degraded."
                                .to_string(),
                        );
                    } else if name == "o3_search" {
                        recommendations.push(
                            "External search is down. Relying on local knowledge only.".to_string(),
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    recommendations.push(format!("Service '{}' is recovering. Monitor closely.", name));
                }
                CircuitState::Closed if stats.recent_failure_rate > 0.3 => {
                    recommendations.push(format!(
                        "Service '{}' showing high failure rate ({:.1}%). Consider investigation.",
                        name,
                        stats.recent_failure_rate * 100.0
                    ));
                }
                CircuitState::Closed => {}
            }
        }

        if health.health_score < 0.5 {
            recommendations.insert(
                0,
                "CRITICAL: System health is poor. Consider pausing non-critical operations.".to_string(),
            );
        } else if health.health_score < 0.8 {
            recommendations.insert(
                0,
                "WARNING: System health is degraded. Some features may be unavailable.".to_string(),
            );
        }

        HealthReport {
            health,
            critical_services,
            recommendations,
            detailed_stats,
        }
    }

    /// False while a critical service's breaker is open.
    pub fn should_continue_workflow(&self) -> bool {
        let open_critical: Vec<String> = self
            .manager
            .get_open_circuits()
            .into_iter()
            .filter(|name| CRITICAL_CIRCUITS.contains(&name.as_str()))
            .collect();

        if !open_critical.is_empty() {
            tracing::error!(services = ?open_critical, "Critical services down");
            return false;
        }

        if self.manager.get_circuit_health().health_score < 0.5 {
            tracing::warn!("System health is poor but no critical services down");
        }
        true
    }

    /// Returns the services currently probing recovery and logs them.
    ///
    /// Breakers that are open or closed are not listed. Stats of every
    /// breaker are dumped at debug level.
    pub fn coordinate_recovery(&self) -> Vec<String> {
        let half_open = self.manager.get_half_open_circuits();
        if !half_open.is_empty() {
            tracing::info!(services = ?half_open, "Services attempting recovery");
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            match self.manager.export_stats() {
                Ok(stats) => tracing::debug!(stats = %stats, "Circuit breaker stats"),
                Err(e) => tracing::warn!(error = %e, "Could not export circuit breaker stats"),
            }
        }
        half_open
    }

    fn handler(&self, handlers: &RwLock<HashMap<String, Action>>, name: &str) -> Option<Action> {
        handlers.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn down() -> RecoveryResult<String> {
        Err(RecoveryError::Connection {
            message: "down".to_string(),
        })
    }

    async fn trip(coordinator: &RecoveryCoordinator, name: &str, times: u32) {
        for _ in 0..times {
            let _ = coordinator.protected_call(name, || async { down() }).await;
        }
    }

    fn coordinator() -> RecoveryCoordinator {
        let coordinator = RecoveryCoordinator::default();
        coordinator.setup_default_breakers();
        coordinator
    }

    #[test]
    fn test_setup_default_breakers() {
        let coordinator = coordinator();
        assert_eq!(
            coordinator.manager().breaker_names(),
            vec![
                "ai_provider_bedrock",
                "ai_provider_google",
                "ai_provider_openai",
                "cache_exact",
                "cache_semantic",
                "knowledge_graph",
                "o3_search",
                "thinking_engine",
            ]
        );

        let thinking = coordinator.manager().get_breaker("thinking_engine", None);
        assert_eq!(thinking.config(), &CircuitBreakerConfig::thinking_engine());
    }

    #[tokio::test]
    async fn test_open_circuit_runs_degradation_and_fallback() {
        let coordinator = coordinator();
        let degraded = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&degraded);
        coordinator.register_degradation_handler("o3_search", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        trip(&coordinator, "o3_search", 2).await;
        assert_eq!(degraded.load(Ordering::SeqCst), 0);

        let result = coordinator
            .protected_call_with_fallback(
                "o3_search",
                || async { Ok("remote".to_string()) },
                || async { Ok("local knowledge".to_string()) },
            )
            .await;

        assert_eq!(result, Ok("local knowledge".to_string()));
        assert_eq!(degraded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operation_errors_do_not_use_fallback() {
        let coordinator = coordinator();
        let result = coordinator
            .protected_call_with_fallback(
                "knowledge_graph",
                || async { down() },
                || async { Ok("unused".to_string()) },
            )
            .await;
        assert!(matches!(result, Err(RecoveryError::Connection { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_handler_runs_when_breaker_closes() {
        let coordinator = coordinator();
        let recovered = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&recovered);
        coordinator.register_recovery_handler("thinking_engine", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        trip(&coordinator, "thinking_engine", 2).await;
        tokio::time::advance(Duration::from_secs(45)).await;

        // success_threshold of the preset is 1
        let result = coordinator
            .protected_call("thinking_engine", || async { Ok("deep analysis".to_string()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(recovered.load(Ordering::SeqCst), 1);

        let _ = coordinator
            .protected_call("thinking_engine", || async { Ok("again".to_string()) })
            .await;
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_half_open_calls_run_recovery_handler_once() {
        let manager = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_millis(50),
            half_open_max_calls: 8,
            ..Default::default()
        }));
        let coordinator = Arc::new(RecoveryCoordinator::new(manager));
        let recovered = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&recovered);
        coordinator.register_recovery_handler("ai_provider_google", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        trip(&coordinator, "ai_provider_google", 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut calls = Vec::new();
        for i in 0..8u64 {
            let coordinator = Arc::clone(&coordinator);
            calls.push(tokio::spawn(async move {
                coordinator
                    .protected_call("ai_provider_google", || async move {
                        tokio::time::sleep(Duration::from_millis(5 + i % 3)).await;
                        Ok(i)
                    })
                    .await
            }));
        }
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }

        assert_eq!(recovered.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.manager().get_breaker("ai_provider_google", None).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinate_recovery_lists_only_half_open_services() {
        let coordinator = coordinator();
        let recovered = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&recovered);
        coordinator.register_recovery_handler("knowledge_graph", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(coordinator.coordinate_recovery().is_empty());

        // knowledge_graph opens after 4 failures and needs 2 successful half-open calls.
        trip(&coordinator, "knowledge_graph", 4).await;
        assert!(coordinator.coordinate_recovery().is_empty());

        // Still failing: the half-open call reopens the breaker.
        tokio::time::advance(Duration::from_secs(20)).await;
        trip(&coordinator, "knowledge_graph", 1).await;
        assert!(coordinator.coordinate_recovery().is_empty());
        assert_eq!(coordinator.health_report().critical_services, vec!["knowledge_graph".to_string()]);
        assert!(coordinator.should_continue_workflow());

        tokio::time::advance(Duration::from_secs(20)).await;
        let first = coordinator
            .protected_call("knowledge_graph", || async { Ok("entities".to_string()) })
            .await;
        assert!(first.is_ok());
        assert_eq!(coordinator.coordinate_recovery(), vec!["knowledge_graph".to_string()]);
        assert_eq!(recovered.load(Ordering::SeqCst), 0);

        let second = coordinator
            .protected_call("knowledge_graph", || async { Ok("relations".to_string()) })
            .await;
        assert!(second.is_ok());
        assert!(coordinator.coordinate_recovery().is_empty());
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_should_continue_workflow() {
        let coordinator = coordinator();
        assert!(coordinator.should_continue_workflow());

        trip(&coordinator, "o3_search", 2).await;
        assert!(coordinator.should_continue_workflow());

        trip(&coordinator, "ai_provider_openai", 3).await;
        assert!(!coordinator.should_continue_workflow());
    }

    #[tokio::test]
    async fn test_health_report_recommendations() {
        let coordinator = coordinator();
        trip(&coordinator, "ai_provider_google", 3).await;
        trip(&coordinator, "thinking_engine", 2).await;

        let report = coordinator.health_report();

        assert_eq!(
            report.critical_services,
            vec!["ai_provider_google".to_string(), "thinking_engine".to_string()]
        );
        // 6 of 8 closed: score 0.75
        assert_eq!(
            report.recommendations[0],
            "WARNING: System health is degraded. Some features may be unavailable."
        );
        assert!(report
            .recommendations
            .contains(&"AI provider 'ai_provider_google' is down. Consider using fallback providers.".to_string()));
        assert!(report
            .recommendations
            .contains(&"Sequential Thinking is unavailable. Quality checks may be degraded.".to_string()));
        assert_eq!(report.detailed_stats.len(), 8);
    }

    #[tokio::test]
    async fn test_high_failure_rate_warning_for_closed_breaker() {
        let coordinator = coordinator();
        // cache_exact opens after 5 consecutive failures or 70% of 10 calls
        for _ in 0..2 {
            let _ = coordinator
                .protected_call("cache_exact", || async { Ok("hit".to_string()) })
                .await;
            trip(&coordinator, "cache_exact", 1).await;
        }

        let report = coordinator.health_report();
        assert!(report.critical_services.is_empty());
        assert!(report
            .recommendations
            .contains(&"Service 'cache_exact' showing high failure rate (50.0%). Consider investigation.".to_string()));
    }
}
