mod circuit_breaker;
mod coordinator;
mod fallback;
mod manager;
mod orchestrator;
mod rate_limiter;
mod resources;
mod retry;


pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerStats, CircuitState,
    StateTransition,
};
pub use coordinator::{HealthReport, RecoveryCoordinator, CRITICAL_CIRCUITS};
pub use fallback::{
    AiRequest, AiResponse, AlternativeProviderHandler, CachedValueHandler, DefaultValueHandler,
    DegradedFunctionalityHandler, DegradedResponse, ErrorMessageHandler, FallbackContext,
    FallbackHandler, FallbackManager, FallbackStrategy, ProviderClient, ResponseCache,
    DEFAULT_ERROR_TEMPLATE,
};
pub use manager::{CircuitBreakerManager, CircuitHealth};
pub use orchestrator::{ProtectedExecutor, RecoveryOrchestrator, RecoveryOrchestratorBuilder};
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use resources::{
    ResourceCallback, ResourceLimit, ResourceManager, ResourceRequest, ResourceStats, SysinfoProbe,
    SystemProbe, UsageSample,
};
pub use retry::{RetryConfig, RetryContext, RetryDecision, RetryHandler, RetryHook};
