use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error produced by user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle phase in which a node callback failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Prepare,
    Condition,
    Before,
    Execute,
    After,
    Cleanup,
    CloseStore,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Condition => "condition",
            Self::Before => "before",
            Self::Execute => "execute",
            Self::After => "after",
            Self::Cleanup => "cleanup",
            Self::CloseStore => "close-store",
        };
        f.write_str(name)
    }
}

/// Unified error type for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid tree, template or engine configuration
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A lifecycle callback of a node failed
    #[error("Execution of {unique_id} failed during {phase}: {source}")]
    Execution {
        unique_id: String,
        phase: LifecyclePhase,
        #[source]
        source: BoxError,
    },

    /// A stored value exists but has a different type than requested
    #[error("Object stored under key [{key}] is not of required type [{required}] (actual type [{actual}])")]
    StoreTypeMismatch {
        key: String,
        required: &'static str,
        actual: &'static str,
    },

    /// Lazily computing a stored value failed; the failure is cached and replayed
    #[error("Computing value for key [{key}] in namespace {namespace} failed: {source}")]
    StoreComputation {
        namespace: String,
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The store was used after it was closed
    #[error("Store has already been closed")]
    StoreClosed,

    /// A resource lock could not be acquired
    #[error("Failed to acquire lock for resource [{resource}]: {message}")]
    LockAcquisition { resource: String, message: String },

    /// Several independent failures
    #[error("{message} ({} failure(s))", .failures.len())]
    Aggregate {
        message: String,
        failures: Vec<EngineError>,
    },

    /// A node finished cleanly but at least one of its descendants failed
    #[error("{failed} descendant(s) of {unique_id} failed")]
    DescendantFailed { unique_id: String, failed: usize },

    /// The run was cancelled
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an execution error from a callback failure
    pub fn execution<S: Into<String>, E: Into<BoxError>>(
        unique_id: S,
        phase: LifecyclePhase,
        source: E,
    ) -> Self {
        Self::Execution {
            unique_id: unique_id.into(),
            phase,
            source: source.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch<K: Into<String>>(key: K, required: &'static str, actual: &'static str) -> Self {
        Self::StoreTypeMismatch {
            key: key.into(),
            required,
            actual,
        }
    }

    /// Create a lock acquisition error
    pub fn lock_acquisition<R: Into<String>, M: Into<String>>(resource: R, message: M) -> Self {
        Self::LockAcquisition {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create an aggregate error
    pub fn aggregate<S: Into<String>>(message: S, failures: Vec<EngineError>) -> Self {
        Self::Aggregate {
            message: message.into(),
            failures,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Configuration failures are fatal to the node that raised them
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Execution { .. } => "execution",
            Self::StoreTypeMismatch { .. } => "store_type_mismatch",
            Self::StoreComputation { .. } => "store_computation",
            Self::StoreClosed => "store_closed",
            Self::LockAcquisition { .. } => "lock",
            Self::Aggregate { .. } => "aggregate",
            Self::DescendantFailed { .. } => "descendant",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("invalid JSON configuration: {}", err))
    }
}

/// A node's failure: the first error raised plus everything raised after it.
#[derive(Debug)]
pub struct NodeFailure {
    pub primary: EngineError,
    pub suppressed: Vec<EngineError>,
}

impl NodeFailure {
    /// Render the failure and its suppressed errors, one per line
    pub fn chain(&self) -> Vec<String> {
        let mut lines = vec![self.primary.to_string()];
        lines.extend(self.suppressed.iter().map(|e| format!("suppressed: {}", e)));
        lines
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

/// Collects failures across lifecycle phases without stopping at the first one.
#[derive(Debug, Default)]
pub struct FailureCollector {
    primary: Option<EngineError>,
    suppressed: Vec<EngineError>,
}

impl FailureCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, error: EngineError) {
        match self.primary {
            None => self.primary = Some(error),
            Some(_) => self.suppressed.push(error),
        }
    }

    /// Record the error of a failed result, if any
    pub fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.add(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none()
    }

    pub fn into_failure(self) -> Option<NodeFailure> {
        self.primary.map(|primary| NodeFailure {
            primary,
            suppressed: self.suppressed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngineError::configuration("no provider");
        assert!(err.is_configuration());
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_type_mismatch_message_names_key_and_types() {
        let err = EngineError::type_mismatch("answer", "u32", "alloc::string::String");
        let message = err.to_string();
        assert!(message.contains("[answer]"));
        assert!(message.contains("[u32]"));
        assert!(message.contains("alloc::string::String"));
    }

    #[test]
    fn test_execution_error_keeps_source() {
        let err = EngineError::execution("[engine:e]", LifecyclePhase::Before, anyhow::anyhow!("boom"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("before"));
    }

    #[test]
    fn test_collector_suppresses_later_failures() {
        let mut collector = FailureCollector::new();
        assert!(collector.is_empty());
        collector.add(EngineError::internal("first"));
        collector.add(EngineError::internal("second"));
        let failure = collector.into_failure().unwrap();
        assert!(failure.primary.to_string().contains("first"));
        assert_eq!(failure.suppressed.len(), 1);
        assert_eq!(failure.chain().len(), 2);
    }
}
