//! Running a test plan: contexts, events, template expansion and scheduling

pub mod context;
pub mod dynamic;
pub mod events;
pub mod outcome;
pub mod scheduler;
mod template;

pub use context::ExecutionContext;
pub use dynamic::DynamicRegistrar;
pub use events::{
    CompositeListener, ExecutionEvent, ExecutionEventEnvelope, ExecutionListener, LoggingListener, NodeDescriptor,
    NodeStatus, RecordingListener,
};
pub use outcome::{EngineExecutionResults, ExecutionAborted, ExecutionReport, NodeOutcome, NodeReport};
pub use scheduler::Engine;
