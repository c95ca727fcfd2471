//! # VIBEZEN Error Recovery
//!
//! Failure isolation and graceful degradation for AI code-generation calls.
//!
//! ## Features
//!
//! - Circuit breakers per collaborator with consecutive-failure and failure-rate tripping
//! - Retry with exponential backoff, jitter and error classification
//! - Fallback chains (default value, cache, alternative provider, degraded mode, error message)
//! - Resource gating: memory, CPU, task concurrency, request and token budgets
//! - Token-bucket rate limiting
//! - Health reports and workflow gating across all breakers
//! - Structured logging and pluggable metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_vibezen::{RecoveryConfig, RecoveryOrchestrator, ResourceRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = RecoveryOrchestrator::new(RecoveryConfig::from_env()?);
//!
//!     let answer = orchestrator
//!         .run(
//!             "ai_provider_openai",
//!             ResourceRequest::new().with_tokens(1200),
//!             || async { Ok::<_, integrations_vibezen::RecoveryError>("fn main() {}") },
//!         )
//!         .await?;
//!
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `config` - Recovery configuration, builder and environment loading
//! - `errors` - Error types and classification
//! - `observability` - Logging setup and metrics collectors
//! - `resilience` - Breakers, retry, fallback, resource gating and their composition

#![warn(clippy::all)]

pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;

pub use config::{RecoveryConfig, RecoveryConfigBuilder};
pub use errors::{ErrorClass, ErrorKind, RecoveryError, RecoveryResult};
pub use observability::{
    InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCollector,
    NoopMetricsCollector,
};
pub use resilience::{
    AiRequest, AiResponse, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager,
    CircuitState, FallbackContext, FallbackManager, FallbackStrategy, HealthReport,
    ProtectedExecutor, RateLimiter, RecoveryCoordinator, RecoveryOrchestrator, ResourceLimit,
    ResourceManager, ResourceRequest, RetryConfig, RetryHandler, TokenBucket,
};

/// The default maximum number of retry attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The default resource monitor sampling interval
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 5000;
