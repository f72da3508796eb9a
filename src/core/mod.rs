// Core infrastructure shared by every engine component

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{EngineConfig, EngineConfigBuilder, ExecutionMode};
pub use errors::{BoxError, EngineError, FailureCollector, LifecyclePhase, NodeFailure, Result};
pub use logging::init_tracing;
