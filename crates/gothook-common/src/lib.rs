//! gothook Common Types
//!
//! Shared errors, configuration, logging setup and data types used by the hook engine
//! and its C ABI.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::HookConfig;
pub use error::{Error, Result};
pub use logging::{enable_debug_output, init_debug_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
