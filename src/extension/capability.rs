//! Extension capabilities the engine knows how to drive

use crate::execution::context::ExecutionContext;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Instance state a node exposes to late-bound extensions
pub type TestInstance = Arc<dyn Any + Send + Sync>;

/// Marker for anything that can be registered in an [`ExtensionRegistry`](crate::extension::ExtensionRegistry).
///
/// Capabilities are opt-in: an extension returns `Some(self)` from the
/// accessors for the roles it plays.
pub trait Extension: Any + Send + Sync {
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>())
    }

    fn as_template_provider(&self) -> Option<&dyn TemplateInvocationContextProvider> {
        None
    }

    fn as_lifecycle_callback(&self) -> Option<&dyn LifecycleCallback> {
        None
    }

    fn as_execution_condition(&self) -> Option<&dyn ExecutionCondition> {
        None
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Lazily produced invocation contexts
pub type InvocationContexts = Box<dyn Iterator<Item = Box<dyn TemplateInvocationContext>> + Send>;

/// Supplies the invocations of a template node
pub trait TemplateInvocationContextProvider: Send + Sync {
    fn supports(&self, ctx: &ExecutionContext) -> bool;

    fn provide_invocation_contexts(&self, ctx: &ExecutionContext) -> anyhow::Result<InvocationContexts>;

    fn may_return_zero_invocation_contexts(&self, _ctx: &ExecutionContext) -> bool {
        false
    }
}

/// One invocation of a template
pub trait TemplateInvocationContext: Send + Sync {
    /// Display name for the invocation with the given 1-based index
    fn display_name(&self, invocation_index: usize) -> String {
        format!("[{}]", invocation_index)
    }

    /// Extensions registered for this invocation only
    fn additional_extensions(&self) -> Vec<RegisteredExtension> {
        Vec::new()
    }
}

/// Callbacks around every node's own hooks.
///
/// `before_node` runs in registration order, `after_node` in reverse.
#[async_trait]
pub trait LifecycleCallback: Send + Sync {
    async fn before_node(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_node(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Outcome of an [`ExecutionCondition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionResult {
    disabled: bool,
    reason: Option<String>,
}

impl ConditionResult {
    pub fn enabled() -> Self {
        Self {
            disabled: false,
            reason: None,
        }
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            disabled: true,
            reason: Some(reason.into()),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Decides whether a node runs at all
pub trait ExecutionCondition: Send + Sync {
    fn evaluate(&self, ctx: &ExecutionContext) -> ConditionResult;
}

/// An extension instance together with its concrete type.
///
/// Both handles point at the same allocation; the `Any` one is what makes
/// typed queries possible.
#[derive(Clone)]
pub struct RegisteredExtension {
    extension: Arc<dyn Extension>,
    any: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl RegisteredExtension {
    pub fn of<E: Extension>(extension: E) -> Self {
        Self::from_arc(Arc::new(extension))
    }

    pub fn from_arc<E: Extension>(extension: Arc<E>) -> Self {
        Self {
            extension: extension.clone(),
            any: extension,
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
        }
    }

    pub fn extension(&self) -> &Arc<dyn Extension> {
        &self.extension
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<E: Extension>(&self) -> Option<Arc<E>> {
        self.any.clone().downcast::<E>().ok()
    }

    pub fn ptr_eq(&self, other: &RegisteredExtension) -> bool {
        Arc::ptr_eq(&self.any, &other.any)
    }
}

impl fmt::Debug for RegisteredExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredExtension")
            .field("name", &self.extension.name())
            .field("type", &self.type_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Plain;
    impl Extension for Plain {}

    #[test]
    fn test_name_defaults_to_short_type_name() {
        assert_eq!(Plain.name(), "Plain");
    }

    #[test]
    fn test_downcast() {
        let registered = RegisteredExtension::of(Plain);
        assert!(registered.downcast::<Plain>().is_some());
        assert!(registered.extension().as_template_provider().is_none());
        assert_eq!(registered.type_id(), TypeId::of::<Plain>());
        assert!(format!("{:?}", registered).contains("Plain"));
    }

    #[test]
    fn test_condition_result() {
        assert!(!ConditionResult::enabled().is_disabled());
        let disabled = ConditionResult::disabled("not today");
        assert!(disabled.is_disabled());
        assert_eq!(disabled.reason(), Some("not today"));
    }
}
