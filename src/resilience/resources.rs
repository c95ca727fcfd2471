//! Resource gating: process memory, CPU, task concurrency and rate budgets.
//!
//! [`ResourceManager::run_with_resources`] is the single entry point used by
//! the recovery pipeline. A background monitor can sample usage periodically
//! and hand the snapshot to registered callbacks.

use super::rate_limiter::RateLimiter;
use crate::errors::{RecoveryError, RecoveryResult};
use crate::observability::{metric_names, MetricsCollector};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REQUESTS_LIMIT: &str = "requests";
const TOKENS_LIMIT: &str = "tokens";
const USAGE_HISTORY_LIMIT: usize = 1000;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const RESOURCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resource limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    pub max_concurrent_tasks: Option<usize>,
    pub max_requests_per_minute: Option<u32>,
    pub max_tokens_per_minute: Option<u32>,
}

/// What a single operation needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Tokens charged against the per-minute token budget
    pub tokens: Option<u32>,
    /// Memory the operation is expected to add
    pub memory_mb: Option<u64>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }
}

/// Snapshot of resource usage and gate rejections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceStats {
    pub memory_usage_mb: f64,
    pub cpu_percent: f64,
    pub active_tasks: usize,
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub memory_limit_hits: u64,
    pub cpu_limit_hits: u64,
    pub rate_limit_hits: u64,
}

/// One reading of process memory and CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSample {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Source of process usage samples.
///
/// Called from async context on every gated acquisition, so samples must be
/// cheap to take.
pub trait SystemProbe: Send + Sync {
    /// Resident memory of this process in MB
    fn memory_usage_mb(&self) -> f64;

    /// CPU usage of this process since the previous sample, in percent
    fn cpu_percent(&self) -> f64;

    /// Memory and CPU read together. Gates take one sample per check.
    fn sample(&self) -> UsageSample {
        UsageSample {
            memory_mb: self.memory_usage_mb(),
            cpu_percent: self.cpu_percent(),
        }
    }
}

struct ProbeState {
    system: System,
    last_refresh: Option<std::time::Instant>,
    last: UsageSample,
}

/// [`SystemProbe`] backed by `sysinfo`, refreshing only this process.
///
/// CPU usage is the delta between two refreshes, so refreshes closer together
/// than [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`] return the cached sample.
pub struct SysinfoProbe {
    state: Mutex<ProbeState>,
    pid: Pid,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let probe = Self {
            state: Mutex::new(ProbeState {
                system: System::new(),
                last_refresh: None,
                last: UsageSample::default(),
            }),
            pid: Pid::from_u32(std::process::id()),
        };
        // Prime the CPU baseline.
        probe.sample();
        probe
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory_usage_mb(&self) -> f64 {
        self.sample().memory_mb
    }

    fn cpu_percent(&self) -> f64 {
        self.sample().cpu_percent
    }

    fn sample(&self) -> UsageSample {
        let mut state = self.state.lock();
        let stale = state
            .last_refresh
            .map_or(true, |at| at.elapsed() >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        if stale {
            state
                .system
                .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
            state.last = state
                .system
                .process(self.pid)
                .map(|p| UsageSample {
                    memory_mb: p.memory() as f64 / (1024.0 * 1024.0),
                    cpu_percent: p.cpu_usage() as f64,
                })
                .unwrap_or_default();
            state.last_refresh = Some(std::time::Instant::now());
        }
        state.last
    }
}

/// Callback invoked by the monitor with each snapshot.
pub type ResourceCallback =
    Arc<dyn Fn(&ResourceStats) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

#[derive(Default)]
struct UsageHistory {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u32)>,
}

impl UsageHistory {
    fn record(&mut self, now: Instant, tokens: Option<u32>) {
        self.requests.push_back(now);
        if self.requests.len() > USAGE_HISTORY_LIMIT {
            self.requests.pop_front();
        }
        if let Some(tokens) = tokens.filter(|t| *t > 0) {
            self.tokens.push_back((now, tokens));
            if self.tokens.len() > USAGE_HISTORY_LIMIT {
                self.tokens.pop_front();
            }
        }
    }

    fn per_minute(&self, now: Instant) -> (u64, u64) {
        let recent = |at: &Instant| now.saturating_duration_since(*at) <= RATE_WINDOW;
        let requests = self.requests.iter().filter(|at| recent(at)).count() as u64;
        let tokens = self
            .tokens
            .iter()
            .filter(|(at, _)| recent(at))
            .map(|(_, n)| *n as u64)
            .sum();
        (requests, tokens)
    }
}

struct Shared {
    limits: ResourceLimit,
    probe: Arc<dyn SystemProbe>,
    rate_limiter: RateLimiter,
    task_semaphore: Option<Arc<Semaphore>>,
    active_tasks: AtomicUsize,
    usage: Mutex<UsageHistory>,
    memory_limit_hits: AtomicU64,
    cpu_limit_hits: AtomicU64,
    rate_limit_hits: AtomicU64,
    callbacks: RwLock<Vec<ResourceCallback>>,
    metrics: RwLock<Option<Arc<dyn MetricsCollector>>>,
}

impl Shared {
    fn memory_ok(&self, usage: &UsageSample, additional_mb: u64) -> bool {
        match self.limits.max_memory_mb {
            None => true,
            Some(max) => usage.memory_mb + additional_mb as f64 <= max as f64,
        }
    }

    fn cpu_ok(&self, usage: &UsageSample) -> bool {
        match self.limits.max_cpu_percent {
            None => true,
            Some(max) => usage.cpu_percent <= max,
        }
    }

    fn reject(&self, gate: &'static str, counter: &AtomicU64) -> bool {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(gate, "Resource limit hit");
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.increment_counter(metric_names::RESOURCE_LIMIT_HITS, 1, &[("gate", gate)]);
        }
        false
    }

    fn snapshot(&self) -> ResourceStats {
        let usage = self.probe.sample();
        let (requests_per_minute, tokens_per_minute) = self.usage.lock().per_minute(Instant::now());
        ResourceStats {
            memory_usage_mb: usage.memory_mb,
            cpu_percent: usage.cpu_percent,
            active_tasks: self.active_tasks.load(Ordering::SeqCst),
            requests_per_minute,
            tokens_per_minute,
            memory_limit_hits: self.memory_limit_hits.load(Ordering::Relaxed),
            cpu_limit_hits: self.cpu_limit_hits.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, stats: &ResourceStats) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.set_gauge(metric_names::MEMORY_USAGE_MB, stats.memory_usage_mb, &[]);
            metrics.set_gauge(metric_names::CPU_PERCENT, stats.cpu_percent, &[]);
            metrics.set_gauge(metric_names::ACTIVE_TASKS, stats.active_tasks as f64, &[]);
        }

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(stats))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Resource callback failed"),
                Err(_) => tracing::error!("Resource callback panicked"),
            }
        }
    }
}

/// Decrements the active task count even if the task is cancelled.
struct ActiveTask<'a>(&'a AtomicUsize);

impl<'a> ActiveTask<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Enforces [`ResourceLimit`]s around operations.
pub struct ResourceManager {
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
}

impl ResourceManager {
    /// Creates a manager sampling this process through `sysinfo`.
    pub fn new(limits: ResourceLimit) -> Self {
        Self::with_probe(limits, Arc::new(SysinfoProbe::new()))
    }

    /// Creates a manager with a custom usage probe.
    pub fn with_probe(limits: ResourceLimit, probe: Arc<dyn SystemProbe>) -> Self {
        let rate_limiter = RateLimiter::new();
        if let Some(rpm) = limits.max_requests_per_minute {
            rate_limiter.add_limit(REQUESTS_LIMIT, rpm, rpm as f64 / 60.0);
        }
        if let Some(tpm) = limits.max_tokens_per_minute {
            rate_limiter.add_limit(TOKENS_LIMIT, tpm, tpm as f64 / 60.0);
        }

        let task_semaphore = limits
            .max_concurrent_tasks
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            shared: Arc::new(Shared {
                limits,
                probe,
                rate_limiter,
                task_semaphore,
                active_tasks: AtomicUsize::new(0),
                usage: Mutex::new(UsageHistory::default()),
                memory_limit_hits: AtomicU64::new(0),
                cpu_limit_hits: AtomicU64::new(0),
                rate_limit_hits: AtomicU64::new(0),
                callbacks: RwLock::new(Vec::new()),
                metrics: RwLock::new(None),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Report gate rejections and monitor samples to a metrics collector
    pub fn with_metrics(self, metrics: Arc<dyn MetricsCollector>) -> Self {
        *self.shared.metrics.write() = Some(metrics);
        self
    }

    pub fn limits(&self) -> &ResourceLimit {
        &self.shared.limits
    }

    /// The rate limiter holding the `requests` and `tokens` buckets.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.shared.rate_limiter
    }

    /// Checks every gate and charges the rate budgets.
    ///
    /// Returns false without charging anything if a gate fails. A request
    /// token taken before the token budget fails is handed back.
    pub fn acquire_resources(&self, request: ResourceRequest) -> bool {
        let shared = &self.shared;
        let usage = shared.probe.sample();

        if let Some(memory_mb) = request.memory_mb {
            if !shared.memory_ok(&usage, memory_mb) {
                return shared.reject("memory", &shared.memory_limit_hits);
            }
        }

        if !shared.cpu_ok(&usage) {
            return shared.reject("cpu", &shared.cpu_limit_hits);
        }

        if !shared.rate_limiter.acquire(REQUESTS_LIMIT, 1) {
            return shared.reject("requests", &shared.rate_limit_hits);
        }

        if let Some(tokens) = request.tokens.filter(|t| *t > 0) {
            if !shared.rate_limiter.acquire(TOKENS_LIMIT, tokens) {
                shared.rate_limiter.release(REQUESTS_LIMIT, 1);
                return shared.reject("tokens", &shared.rate_limit_hits);
            }
        }

        shared.usage.lock().record(Instant::now(), request.tokens);
        true
    }

    /// Hands back the rate budget of an acquisition that was never used.
    pub fn release_resources(&self, request: ResourceRequest) {
        self.shared.rate_limiter.release(REQUESTS_LIMIT, 1);
        if let Some(tokens) = request.tokens.filter(|t| *t > 0) {
            self.shared.rate_limiter.release(TOKENS_LIMIT, tokens);
        }
    }

    /// Runs `operation` once a task slot and the requested resources are held.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Resource`] if the resources cannot be acquired;
    /// errors of `operation` itself are returned unchanged.
    pub async fn run_with_resources<F, T>(&self, operation: F, request: ResourceRequest) -> RecoveryResult<T>
    where
        F: Future<Output = RecoveryResult<T>>,
    {
        let _slot = match &self.shared.task_semaphore {
            Some(semaphore) => Some(Arc::clone(semaphore).acquire_owned().await.map_err(|_| {
                RecoveryError::Resource {
                    message: "Task semaphore closed".to_string(),
                }
            })?),
            None => None,
        };

        if !self.acquire_resources(request) {
            return Err(RecoveryError::Resource {
                message: "Insufficient resources".to_string(),
            });
        }

        let _active = ActiveTask::start(&self.shared.active_tasks);
        operation.await
    }

    /// Waits until the memory and CPU gates pass, polling every 100ms.
    pub async fn wait_for_resources(&self, memory_mb: Option<u64>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let usage = self.shared.probe.sample();
            if self.shared.memory_ok(&usage, memory_mb.unwrap_or(0)) && self.shared.cpu_ok(&usage) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(RESOURCE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Tasks currently running inside [`run_with_resources`](Self::run_with_resources).
    pub fn active_tasks(&self) -> usize {
        self.shared.active_tasks.load(Ordering::SeqCst)
    }

    /// Samples usage now.
    pub fn get_stats(&self) -> ResourceStats {
        self.shared.snapshot()
    }

    /// Registers a callback for monitor snapshots.
    ///
    /// Errors are logged and panics caught; neither stops the monitor.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&ResourceStats) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.shared.callbacks.write().push(Arc::new(callback));
    }

    /// Starts sampling every `interval`. A running monitor is replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(&self, interval: Duration) {
        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(monitor_loop(shared, interval, token.clone()));

        if let Some(previous) = self.monitor.lock().replace(Monitor { token, handle }) {
            previous.token.cancel();
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "Resource monitoring started");
    }

    /// Stops the monitor and waits for it to exit.
    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.token.cancel();
            if let Err(e) = monitor.handle.await {
                tracing::warn!(error = %e, "Resource monitor exited abnormally");
            }
            tracing::info!("Resource monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Token of the running monitor. Cancelling it stops sampling.
    pub fn monitor_token(&self) -> Option<CancellationToken> {
        self.monitor.lock().as_ref().map(|m| m.token.clone())
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.token.cancel();
        }
    }
}

async fn monitor_loop(shared: Arc<Shared>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; sample one interval from now.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let sampler = Arc::clone(&shared);
                match tokio::task::spawn_blocking(move || sampler.snapshot()).await {
                    Ok(stats) => shared.publish(&stats),
                    Err(e) => tracing::warn!(error = %e, "Resource sampling failed"),
                }
            }
        }
    }
}
