//! Observability for the recovery layer.
//!
//! - **Logging**: subscriber setup and structured lifecycle events
//! - **Metrics**: counters, histograms and gauges behind [`MetricsCollector`]
//!
//! ## Examples
//!
//! ```rust,no_run
//! use integrations_vibezen::observability::{
//!     InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCollector,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//!
//! let metrics = InMemoryMetricsCollector::new();
//! metrics.increment_counter("vibezen.retry.attempts", 1, &[("operation", "generate")]);
//! # Ok(())
//! # }
//! ```

mod logging;
mod metrics;

pub use logging::*;
pub use metrics::*;

#[cfg(test)]
pub(crate) use logging::CapturedLogs;
