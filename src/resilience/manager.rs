use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerStats, CircuitState,
};
use crate::errors::RecoveryResult;
use crate::observability::MetricsCollector;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Aggregate health across every registered breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitHealth {
    /// Weighted average of breaker states (closed 1.0, half-open 0.5, open 0.0)
    pub health_score: f64,
    pub total_circuits: usize,
    pub closed_circuits: usize,
    pub open_circuits: Vec<String>,
    pub half_open_circuits: Vec<String>,
}

#[derive(Serialize)]
struct StatsExport {
    exported_at: DateTime<Utc>,
    health: CircuitHealth,
    breakers: BTreeMap<String, CircuitBreakerStats>,
}

/// Owns one circuit breaker per operation name.
///
/// Build it once at startup and share it by `Arc`.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerManager {
    /// `default_config` is used for breakers created without one.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            hook: None,
            metrics: None,
        }
    }

    /// Attach a state-change hook to every breaker created from now on
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Attach a metrics collector to every breaker created from now on
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the breaker for `name`, creating it on first use.
    ///
    /// The first registration wins: `config` is ignored when the breaker
    /// already exists. An invalid `config` is logged and replaced by the
    /// manager's default; use [`try_get_breaker`](Self::try_get_breaker) to
    /// get the error instead.
    pub fn get_breaker(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        match self.try_get_breaker(name, config) {
            Ok(breaker) => breaker,
            Err(e) => {
                tracing::warn!(breaker = name, error = %e, "Invalid breaker config, using default");
                self.register(name, self.default_config.clone())
            }
        }
    }

    /// Returns the breaker for `name`, creating it from a validated config on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Configuration`](crate::errors::RecoveryError::Configuration)
    /// if the breaker does not exist yet and its config is invalid.
    pub fn try_get_breaker(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> RecoveryResult<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Ok(Arc::clone(breaker));
        }

        let config = config.unwrap_or_else(|| self.default_config.clone());
        config.validate()?;
        Ok(self.register(name, config))
    }

    /// Returns the breaker for `name` if it has been created.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Runs `f` through the breaker named `name`.
    pub async fn call<F, Fut, T>(&self, name: &str, f: F) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        let breaker = self.get_breaker(name, None);
        breaker.call(f).await
    }

    pub fn breaker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_open_circuits(&self) -> Vec<String> {
        self.names_in(CircuitState::Open)
    }

    pub fn get_half_open_circuits(&self) -> Vec<String> {
        self.names_in(CircuitState::HalfOpen)
    }

    /// Health score and per-state breakdown. A manager without breakers is fully healthy.
    pub fn get_circuit_health(&self) -> CircuitHealth {
        let states: Vec<(String, CircuitState)> = self
            .snapshot()
            .into_iter()
            .map(|(name, breaker)| (name, breaker.state()))
            .collect();

        let total = states.len();
        let health_score = if total == 0 {
            1.0
        } else {
            states.iter().map(|(_, s)| s.health_weight()).sum::<f64>() / total as f64
        };

        let pick = |wanted: CircuitState| -> Vec<String> {
            states
                .iter()
                .filter(|(_, s)| *s == wanted)
                .map(|(n, _)| n.clone())
                .collect()
        };

        CircuitHealth {
            health_score,
            total_circuits: total,
            closed_circuits: states.iter().filter(|(_, s)| *s == CircuitState::Closed).count(),
            open_circuits: pick(CircuitState::Open),
            half_open_circuits: pick(CircuitState::HalfOpen),
        }
    }

    /// Stats of every breaker, keyed by name.
    pub fn get_all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.snapshot()
            .into_iter()
            .map(|(name, breaker)| (name, breaker.get_stats()))
            .collect()
    }

    /// Manually closes every breaker.
    pub fn reset_all(&self) {
        for (_, breaker) in self.snapshot() {
            breaker.reset();
        }
        tracing::info!("All circuit breakers reset");
    }

    /// Health and per-breaker stats as pretty-printed JSON.
    pub fn export_stats(&self) -> RecoveryResult<String> {
        let export = StatsExport {
            exported_at: Utc::now(),
            health: self.get_circuit_health(),
            breakers: self.get_all_stats(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(breaker = name, "Creating circuit breaker");
            Arc::new(self.build(name, config))
        });
        Arc::clone(breaker)
    }

    fn build(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::new(name, config);
        if let Some(hook) = &self.hook {
            breaker = breaker.with_hook(Arc::clone(hook));
        }
        if let Some(metrics) = &self.metrics {
            breaker = breaker.with_metrics(Arc::clone(metrics));
        }
        breaker
    }

    // Sorted copy of the registry so breaker locks are never taken under the registry lock.
    fn snapshot(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        let mut breakers: Vec<_> = self
            .breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), Arc::clone(breaker)))
            .collect();
        breakers.sort_by(|a, b| a.0.cmp(&b.0));
        breakers
    }

    fn names_in(&self, state: CircuitState) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|(_, breaker)| breaker.state() == state)
            .map(|(name, _)| name)
            .collect()
    }
}
