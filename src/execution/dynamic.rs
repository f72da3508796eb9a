use crate::core::errors::Result;
use crate::execution::events::{EventEmitter, ExecutionEvent, NodeDescriptor};
use crate::tree::{NodeId, NodeSpec, TestPlan, UniqueId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Lets a node add children while it executes.
///
/// Registered children run after `execute` returns and before the node finishes.
pub struct DynamicRegistrar {
    plan: Arc<TestPlan>,
    parent: NodeId,
    parent_id: UniqueId,
    emitter: Arc<EventEmitter>,
    registered: Mutex<Vec<NodeId>>,
}

impl DynamicRegistrar {
    pub(crate) fn new(plan: Arc<TestPlan>, parent: NodeId, parent_id: UniqueId, emitter: Arc<EventEmitter>) -> Self {
        Self {
            plan,
            parent,
            parent_id,
            emitter,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Add `spec` as a child of the executing node
    pub fn register(&self, spec: NodeSpec) -> Result<UniqueId> {
        let id = self.plan.add_dynamic_child(self.parent, spec)?;
        self.announce(id)
    }

    /// Attach a node already built in the arena
    pub(crate) fn register_existing(&self, id: NodeId) -> Result<UniqueId> {
        self.plan.attach_child(self.parent, id);
        self.announce(id)
    }

    fn announce(&self, id: NodeId) -> Result<UniqueId> {
        let entry = self.plan.entry(id)?;
        debug!("Registered dynamic node {} below {}", entry.unique_id(), self.parent_id);
        self.registered.lock().push(id);
        self.emitter.emit(ExecutionEvent::DynamicRegistered {
            node: NodeDescriptor::of(&entry),
            parent: self.parent_id.clone(),
        });
        Ok(entry.unique_id().clone())
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub(crate) fn take_registered(&self) -> Vec<NodeId> {
        std::mem::take(&mut *self.registered.lock())
    }
}

impl std::fmt::Debug for DynamicRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRegistrar")
            .field("parent", &self.parent_id.to_string())
            .field("registered", &self.registered_count())
            .finish()
    }
}
