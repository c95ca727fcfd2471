//! Circuit breaker guarding a single named operation.
//!
//! # States
//! - Closed: calls flow through, failures are counted
//! - Open: calls are rejected without invoking the operation
//! - Half-Open: a bounded number of probe calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open:      failure_count >= failure_threshold, or
//!                     recent failure rate >= failure_rate_threshold (min_calls sampled)
//! Open → Half-Open:   next call after `timeout` has elapsed since the last failure
//! Half-Open → Closed: success_threshold successes
//! Half-Open → Open:   any failure
//! any → Closed:       no call for `reset_timeout`, or manual reset
//! ```
//!
//! All bookkeeping happens under a per-breaker lock that is never held while
//! the protected operation runs.

use crate::errors::{ErrorKind, RecoveryError, RecoveryResult};
use crate::observability::{log_circuit_event, metric_names, MetricsCollector};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Number of state transitions kept for reporting.
const STATE_HISTORY_LIMIT: usize = 100;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Half-open successes needed to close the breaker
    pub success_threshold: u32,
    /// Cool-down after the last failure before a probe is allowed
    pub timeout: Duration,
    /// Probe calls allowed in flight while half-open
    pub half_open_max_calls: u32,
    /// Rolling failure rate (0.0-1.0) that opens a closed breaker
    pub failure_rate_threshold: f64,
    /// Calls sampled before the rate check applies; the window holds twice this
    pub min_calls: usize,
    /// Inactivity after which the breaker fully resets
    pub reset_timeout: Duration,
    /// Error kinds that pass through without counting as success or failure
    pub excluded_kinds: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            failure_rate_threshold: 0.5,
            min_calls: 10,
            reset_timeout: Duration::from_secs(120),
            excluded_kinds: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    fn preset(
        failure_threshold: u32,
        success_threshold: u32,
        timeout_secs: u64,
        failure_rate_threshold: f64,
        min_calls: usize,
        reset_timeout_secs: u64,
    ) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_secs(timeout_secs),
            failure_rate_threshold,
            min_calls,
            reset_timeout: Duration::from_secs(reset_timeout_secs),
            ..Default::default()
        }
    }

    /// Preset for external AI provider calls.
    pub fn ai_provider() -> Self {
        Self::preset(3, 2, 30, 0.5, 5, 300)
    }

    /// Preset for exact and semantic cache lookups.
    pub fn cache_service() -> Self {
        Self::preset(5, 1, 10, 0.7, 10, 120)
    }

    /// Preset for external search services.
    pub fn search_service() -> Self {
        Self::preset(2, 2, 60, 0.4, 3, 180)
    }

    /// Preset for knowledge graph operations.
    pub fn knowledge_graph() -> Self {
        Self::preset(4, 2, 20, 0.6, 8, 240)
    }

    /// Preset for the thinking engine; expensive, so it fails fast.
    pub fn thinking_engine() -> Self {
        Self::preset(2, 1, 45, 0.3, 2, 150)
    }

    /// Checks that thresholds are usable.
    pub fn validate(&self) -> RecoveryResult<()> {
        if self.failure_threshold == 0 {
            return Err(RecoveryError::configuration(
                "failure_threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(RecoveryError::configuration(
                "success_threshold must be at least 1",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(RecoveryError::configuration(
                "half_open_max_calls must be at least 1",
            ));
        }
        if self.min_calls == 0 {
            return Err(RecoveryError::configuration("min_calls must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(RecoveryError::configuration(format!(
                "failure_rate_threshold must be within 0.0..=1.0, got {}",
                self.failure_rate_threshold
            )));
        }
        Ok(())
    }

    fn window_size(&self) -> usize {
        self.min_calls.saturating_mul(2).max(1)
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Contribution to the aggregate health score.
    pub fn health_weight(&self) -> f64 {
        match self {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    /// State before the change
    pub from: CircuitState,
    /// State after the change
    pub to: CircuitState,
    /// Wall-clock time of the change
    pub at: DateTime<Utc>,
    /// Failure count at the moment of the change
    pub failure_count: u32,
    /// Success count at the moment of the change
    pub success_count: u32,
}

/// Point-in-time statistics of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub success_rate: f64,
    pub recent_failure_rate: f64,
    pub state_changes: u64,
    pub last_state_change: Option<StateTransition>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Hook for circuit breaker state changes
pub trait CircuitBreakerHook: Send + Sync {
    /// Called after a transition, outside the breaker lock.
    fn on_state_change(&self, name: &str, old_state: CircuitState, new_state: CircuitState);
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_call_time: Option<Instant>,
    recent_calls: VecDeque<(Instant, bool)>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    transitions: VecDeque<StateTransition>,
    transition_count: u64,
    // Bumped on every transition so stale probe permits are ignored.
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_time: None,
            last_failure_at: None,
            last_call_time: None,
            recent_calls: VecDeque::new(),
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            transitions: VecDeque::new(),
            transition_count: 0,
            generation: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.recent_calls.is_empty() {
            return 0.0;
        }
        let failures = self.recent_calls.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.recent_calls.len() as f64
    }

    fn clear_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_calls = 0;
        self.recent_calls.clear();
        self.last_failure_time = None;
    }
}

/// Admission ticket for one call.
#[derive(Debug, Clone, Copy)]
struct CallPermit {
    generation: u64,
    probe: bool,
}

/// Hands a half-open probe slot back if the call is dropped before finishing.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: CallPermit,
    finished: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished && self.permit.probe {
            tracing::debug!(breaker = %self.breaker.name, "Probe call cancelled");
            let mut inner = self.breaker.inner.lock();
            self.breaker.release_probe(&mut inner, self.permit);
        }
    }
}

type Transitions = Vec<(CircuitState, CircuitState)>;

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new closed circuit breaker
    ///
    /// The configuration is taken as is. Use [`try_new`](Self::try_new) for
    /// configuration that was not already validated.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            hook: None,
            metrics: None,
        }
    }

    /// Create a new closed circuit breaker after validating `config`
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Configuration`] if a threshold is unusable.
    pub fn try_new(name: impl Into<String>, config: CircuitBreakerConfig) -> RecoveryResult<Self> {
        config.validate()?;
        Ok(Self::new(name, config))
    }

    /// Add a hook for circuit breaker state changes
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Report state and rejections to a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Name of the protected operation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this breaker was built with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Remaining cool-down while open, `None` in any other state.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        Some(self.remaining_cool_down(&inner, Instant::now()))
    }

    /// Runs `f` through the breaker.
    ///
    /// Returns [`RecoveryError::CircuitOpen`] without invoking `f` while the
    /// breaker rejects calls. Otherwise the outcome of `f` is recorded and
    /// returned unchanged.
    pub async fn call<F, Fut, T>(&self, f: F) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        self.call_observed(f).await.0
    }

    /// Like [`call`](Self::call), also reporting whether this call's outcome
    /// closed the breaker from half-open.
    pub(crate) async fn call_observed<F, Fut, T>(&self, f: F) -> (RecoveryResult<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecoveryResult<T>>,
    {
        let permit = match self.admit() {
            Ok(permit) => permit,
            Err(e) => return (Err(e), false),
        };
        let mut guard = ProbeGuard {
            breaker: self,
            permit,
            finished: false,
        };

        let result = f().await;

        guard.finished = true;
        let recovered = self.record_outcome(permit, &result);
        (result, recovered)
    }

    /// Manually reset the breaker to closed with cleared counters.
    pub fn reset(&self) {
        let mut transitions = Transitions::new();
        {
            let mut inner = self.inner.lock();
            tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
            self.transition(&mut inner, CircuitState::Closed, "manual_reset", None, &mut transitions);
            inner.clear_counters();
        }
        self.notify(transitions);
    }

    /// Get circuit breaker statistics
    pub fn get_stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let success_rate = if inner.total_calls > 0 {
            inner.total_successes as f64 / inner.total_calls as f64
        } else {
            0.0
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            success_rate,
            recent_failure_rate: inner.failure_rate(),
            state_changes: inner.transition_count,
            last_state_change: inner.transitions.back().cloned(),
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Recorded state changes, oldest first.
    pub fn state_history(&self) -> Vec<StateTransition> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    fn admit(&self) -> RecoveryResult<CallPermit> {
        let mut transitions = Transitions::new();
        let admission: Result<CallPermit, Option<Duration>> = {
            let mut inner = self.inner.lock();
            let now = Instant::now();

            self.reset_if_idle(&mut inner, now, &mut transitions);
            inner.last_call_time = Some(now);
            inner.total_calls += 1;

            if inner.state == CircuitState::Open && self.should_attempt_reset(&inner, now) {
                self.transition(&mut inner, CircuitState::HalfOpen, "half_opened", None, &mut transitions);
            }

            match inner.state {
                CircuitState::Open => {
                    inner.total_rejections += 1;
                    let retry_after = self.remaining_cool_down(&inner, now);
                    tracing::debug!(
                        breaker = %self.name,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Circuit open, rejecting call"
                    );
                    Err(Some(retry_after))
                }
                CircuitState::HalfOpen if inner.half_open_calls >= self.config.half_open_max_calls => {
                    inner.total_rejections += 1;
                    tracing::debug!(
                        breaker = %self.name,
                        in_flight = inner.half_open_calls,
                        "Half-open probe limit reached, rejecting call"
                    );
                    Err(None)
                }
                CircuitState::HalfOpen => {
                    inner.half_open_calls += 1;
                    Ok(CallPermit {
                        generation: inner.generation,
                        probe: true,
                    })
                }
                CircuitState::Closed => Ok(CallPermit {
                    generation: inner.generation,
                    probe: false,
                }),
            }
        };

        self.notify(transitions);

        admission.map_err(|retry_after| {
            if let Some(metrics) = &self.metrics {
                metrics.increment_counter(
                    metric_names::CIRCUIT_BREAKER_REJECTIONS,
                    1,
                    &[("breaker", &self.name)],
                );
            }
            RecoveryError::CircuitOpen {
                name: self.name.clone(),
                retry_after,
            }
        })
    }

    /// Returns true if the outcome moved the breaker from half-open to closed.
    fn record_outcome<T>(&self, permit: CallPermit, result: &RecoveryResult<T>) -> bool {
        let mut transitions = Transitions::new();
        {
            let mut inner = self.inner.lock();
            self.release_probe(&mut inner, permit);

            match result {
                Ok(_) => self.on_success(&mut inner, &mut transitions),
                Err(e) if self.config.excluded_kinds.contains(&e.kind()) => {
                    tracing::debug!(
                        breaker = %self.name,
                        kind = %e.kind(),
                        "Excluded error kind, outcome not counted"
                    );
                }
                Err(e) => self.on_failure(&mut inner, e, &mut transitions),
            }
        }
        let recovered = transitions
            .iter()
            .any(|&(from, to)| from == CircuitState::HalfOpen && to == CircuitState::Closed);
        self.notify(transitions);
        recovered
    }

    fn release_probe(&self, inner: &mut BreakerState, permit: CallPermit) {
        if permit.probe
            && inner.generation == permit.generation
            && inner.state == CircuitState::HalfOpen
        {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }

    fn on_success(&self, inner: &mut BreakerState, transitions: &mut Transitions) {
        inner.total_successes += 1;
        self.push_recent(inner, true);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                inner.failure_count = 0;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(inner, CircuitState::Closed, "recovered", None, transitions);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, error: &RecoveryError, transitions: &mut Transitions) {
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        self.push_recent(inner, false);

        tracing::warn!(
            breaker = %self.name,
            failure_count = inner.failure_count,
            error = %error,
            "Circuit breaker recorded failure"
        );

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(inner, CircuitState::Open, "opened", Some("failure_in_half_open"), transitions);
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(
                        inner,
                        CircuitState::Open,
                        "opened",
                        Some("failure_threshold_exceeded"),
                        transitions,
                    );
                } else if inner.recent_calls.len() >= self.config.min_calls
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.transition(
                        inner,
                        CircuitState::Open,
                        "opened",
                        Some("failure_rate_exceeded"),
                        transitions,
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn push_recent(&self, inner: &mut BreakerState, success: bool) {
        inner.recent_calls.push_back((Instant::now(), success));
        while inner.recent_calls.len() > self.config.window_size() {
            inner.recent_calls.pop_front();
        }
    }

    fn should_attempt_reset(&self, inner: &BreakerState, now: Instant) -> bool {
        match inner.last_failure_time {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.config.timeout,
        }
    }

    fn remaining_cool_down(&self, inner: &BreakerState, now: Instant) -> Duration {
        match inner.last_failure_time {
            None => Duration::ZERO,
            Some(at) => self
                .config
                .timeout
                .saturating_sub(now.saturating_duration_since(at)),
        }
    }

    fn reset_if_idle(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Transitions) {
        let Some(last_call) = inner.last_call_time else {
            return;
        };
        if now.saturating_duration_since(last_call) < self.config.reset_timeout {
            return;
        }
        if inner.state != CircuitState::Closed {
            self.transition(inner, CircuitState::Closed, "idle_reset", Some("inactivity"), transitions);
        }
        inner.clear_counters();
    }

    fn transition(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
        event: &str,
        reason: Option<&str>,
        transitions: &mut Transitions,
    ) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.transitions.push_back(StateTransition {
            from,
            to,
            at: Utc::now(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        });
        if inner.transitions.len() > STATE_HISTORY_LIMIT {
            inner.transitions.pop_front();
        }
        inner.transition_count += 1;
        inner.generation += 1;
        inner.state = to;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }

        log_circuit_event(&self.name, event, to.as_str(), reason);
        transitions.push((from, to));
    }

    fn notify(&self, transitions: Transitions) {
        for (old, new) in transitions {
            if let Some(metrics) = &self.metrics {
                metrics.set_gauge(
                    metric_names::CIRCUIT_BREAKER_STATE,
                    new.gauge_value(),
                    &[("breaker", &self.name)],
                );
            }
            if let Some(hook) = &self.hook {
                hook.on_state_change(&self.name, old, new);
            }
        }
    }
}
