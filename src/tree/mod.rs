//! The node tree: ids, declarations, and the arena a run executes

pub mod arena;
pub mod node;
pub mod orderer;
pub mod unique_id;

pub use arena::{InvocationState, NodeEntry, NodeId, NodeKind, TemplateState, TestPlan};
pub use node::{FnBehavior, NodeBehavior, NodeSpec, NodeType, NoopBehavior, SkipResult};
pub use orderer::{ChildOrderer, DEFAULT_ORDER};
pub use unique_id::{rewrite, Segment, UniqueId};
