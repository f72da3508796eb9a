// Core infrastructure modules
pub mod core;

// Building blocks of a run
pub mod extension; // Extensions and their registry
pub mod lock;      // Exclusive resources and locks
pub mod store;     // Hierarchical extension values
pub mod tree;      // Node declarations and the test plan

// Driving a plan to completion
pub mod execution;

// Re-exports for convenience
pub use crate::core::config::{EngineConfig, EngineConfigBuilder, ExecutionMode};
pub use crate::core::errors::{EngineError, LifecyclePhase, NodeFailure, Result};
pub use execution::{
    DynamicRegistrar, Engine, EngineExecutionResults, ExecutionAborted, ExecutionContext, ExecutionEvent,
    ExecutionListener, NodeStatus, RecordingListener,
};
pub use extension::{
    ConditionResult, ExecutionCondition, Extension, ExtensionRegistry, LifecycleCallback, RegisteredExtension,
    TemplateInvocationContext, TemplateInvocationContextProvider,
};
pub use lock::{ExclusiveResource, LockMode};
pub use store::{ExtensionValuesStore, Namespace, StoreValue};
pub use tree::{NodeBehavior, NodeSpec, NodeType, SkipResult, TestPlan, UniqueId};
