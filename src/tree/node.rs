//! Node declarations handed to the engine by the authoring layer

use crate::core::config::ExecutionMode;
use crate::execution::context::ExecutionContext;
use crate::execution::dynamic::DynamicRegistrar;
use crate::extension::{Extension, ExtensionInitializer, ExtensionRegistry, OwnerType, RegisteredExtension};
use crate::lock::ExclusiveResource;
use crate::tree::orderer::ChildOrderer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Kind of a node, without kind-specific payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Engine,
    Class,
    NestedClass,
    Test,
    Template,
    Invocation,
}

impl NodeType {
    /// Segment type used in unique ids
    pub fn segment_type(&self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Class => "class",
            Self::NestedClass => "nested-class",
            Self::Test => "test",
            Self::Template => "test-template",
            Self::Invocation => "template-invocation",
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, Self::Test)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment_type())
    }
}

/// Result of [`NodeBehavior::should_be_skipped`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipResult {
    skipped: bool,
    reason: Option<String>,
}

impl SkipResult {
    pub fn proceed() -> Self {
        Self {
            skipped: false,
            reason: None,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            reason: Some(reason.into()),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Lifecycle hooks of a node.
///
/// `prepare` runs first with mutable access to the node's context. Once the
/// node has started, `after` and `cleanup` run even if an earlier hook failed.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    async fn prepare(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn should_be_skipped(&self, _ctx: &ExecutionContext) -> anyhow::Result<SkipResult> {
        Ok(SkipResult::proceed())
    }

    async fn before(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &ExecutionContext, _registrar: &DynamicRegistrar) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Behavior with no hooks; containers and invocations use it by default
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBehavior;

impl NodeBehavior for NoopBehavior {}

type ExecuteFn = dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync;

/// Wraps a plain function as a node's `execute` hook
pub struct FnBehavior {
    func: Arc<ExecuteFn>,
}

impl FnBehavior {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { func: Arc::new(func) }
    }
}

#[async_trait]
impl NodeBehavior for FnBehavior {
    async fn execute(&self, ctx: &ExecutionContext, _registrar: &DynamicRegistrar) -> anyhow::Result<()> {
        (self.func)(ctx)
    }
}

/// Registers a declared extension type into a node's registry
pub type ExtensionTypeRegistration = Arc<dyn Fn(&mut ExtensionRegistry) -> bool + Send + Sync>;

/// Late-bound extension declared on a node
#[derive(Clone)]
pub struct LateInitDeclaration {
    pub owner: OwnerType,
    pub source: String,
    pub initializer: ExtensionInitializer,
}

/// Declarative description of a node and its subtree.
///
/// Ids are derived while the plan is built: every child's id extends its
/// parent's with a `[type:value]` segment.
#[derive(Clone)]
pub struct NodeSpec {
    pub(crate) node_type: NodeType,
    pub(crate) segment_value: String,
    pub(crate) display_name: String,
    pub(crate) behavior: Arc<dyn NodeBehavior>,
    pub(crate) resources: Vec<ExclusiveResource>,
    pub(crate) execution_mode: Option<ExecutionMode>,
    pub(crate) orderer: Option<ChildOrderer>,
    pub(crate) extensions: Vec<RegisteredExtension>,
    pub(crate) extension_types: Vec<ExtensionTypeRegistration>,
    pub(crate) late_init: Vec<LateInitDeclaration>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) order: Option<i32>,
    pub(crate) children: Vec<NodeSpec>,
}

impl NodeSpec {
    fn new(node_type: NodeType, segment_value: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            node_type,
            segment_value: segment_value.into(),
            display_name: display_name.into(),
            behavior: Arc::new(NoopBehavior),
            resources: Vec::new(),
            execution_mode: None,
            orderer: None,
            extensions: Vec::new(),
            extension_types: Vec::new(),
            late_init: Vec::new(),
            tags: BTreeSet::new(),
            order: None,
            children: Vec::new(),
        }
    }

    /// Root of a plan
    pub fn engine(engine_id: impl Into<String>) -> Self {
        let id = engine_id.into();
        Self::new(NodeType::Engine, id.clone(), id)
    }

    pub fn class(value: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(NodeType::Class, value, display_name)
    }

    pub fn nested_class(value: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(NodeType::NestedClass, value, display_name)
    }

    pub fn test(value: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(NodeType::Test, value, display_name)
    }

    /// Template whose children are copied once per invocation context
    pub fn template(value: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(NodeType::Template, value, display_name)
    }

    /// Pre-selected invocation of the enclosing template; its children replace the copy for that index
    pub fn invocation(index: usize) -> Self {
        Self::new(NodeType::Invocation, format!("#{}", index), format!("[{}]", index))
    }

    pub fn with_behavior<B: NodeBehavior + 'static>(mut self, behavior: B) -> Self {
        self.behavior = Arc::new(behavior);
        self
    }

    pub fn with_shared_behavior(mut self, behavior: Arc<dyn NodeBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Shorthand for [`FnBehavior`]
    pub fn with_execute<F>(self, func: F) -> Self
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with_behavior(FnBehavior::new(func))
    }

    pub fn with_child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children<I: IntoIterator<Item = NodeSpec>>(mut self, children: I) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_resource(mut self, resource: ExclusiveResource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    /// Reorder children before they run; ordered children always run one after another
    pub fn with_orderer(mut self, orderer: ChildOrderer) -> Self {
        self.orderer = Some(orderer);
        self
    }

    pub fn with_extension(mut self, extension: RegisteredExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Declare an extension by type; it is instantiated unless an ancestor already registered it
    pub fn with_extension_type<E: Extension + Default>(mut self) -> Self {
        self.extension_types
            .push(Arc::new(|registry: &mut ExtensionRegistry| registry.register_extension_type::<E>()));
        self
    }

    pub fn with_late_init_extension(
        mut self,
        owner: OwnerType,
        source: impl Into<String>,
        initializer: ExtensionInitializer,
    ) -> Self {
        self.late_init.push(LateInitDeclaration {
            owner,
            source: source.into(),
            initializer,
        });
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Sort key for [`ChildOrderer::OrderValue`]
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("node_type", &self.node_type)
            .field("segment_value", &self.segment_value)
            .field("display_name", &self.display_name)
            .field("resources", &self.resources)
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = NodeSpec::class("Suite", "Suite")
            .with_resource(ExclusiveResource::read("db"))
            .with_execution_mode(ExecutionMode::Concurrent)
            .with_tag("slow")
            .with_order(3)
            .with_child(NodeSpec::test("a", "a()"))
            .with_children(vec![NodeSpec::test("b", "b()")]);

        assert_eq!(spec.node_type(), NodeType::Class);
        assert_eq!(spec.children.len(), 2);
        assert_eq!(spec.resources.len(), 1);
        assert_eq!(spec.order, Some(3));
        assert!(spec.tags.contains("slow"));
    }

    #[test]
    fn test_invocation_spec_naming() {
        let spec = NodeSpec::invocation(2);
        assert_eq!(spec.segment_value, "#2");
        assert_eq!(spec.display_name(), "[2]");
        assert_eq!(spec.node_type().segment_type(), "template-invocation");
    }

    #[test]
    fn test_skip_result() {
        assert!(!SkipResult::proceed().is_skipped());
        assert_eq!(SkipResult::skip("disabled").reason(), Some("disabled"));
    }
}
