//! Error types for the VIBEZEN recovery layer.
//!
//! Every protected operation, gate and fallback speaks [`RecoveryError`]. The
//! closed [`ErrorKind`] tag is what retry and breaker policies classify on.

mod error;

pub use error::{ErrorClass, ErrorKind, RecoveryError, RecoveryResult};
