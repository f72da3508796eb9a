use crate::core::config::EngineConfig;
use crate::core::errors::Result;
use crate::extension::{ExtensionRegistry, OwnerType, TestInstance};
use crate::store::{ExtensionValuesStore, Namespace, StoreValue};
use crate::tree::{NodeEntry, NodeId, NodeType, UniqueId};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Per-node bundle of store, registry and test instance.
///
/// Built by forking the parent's context: the store reads through to the
/// parent's, the registry is a structural copy of the parent's.
pub struct ExecutionContext {
    node: NodeId,
    unique_id: UniqueId,
    display_name: String,
    node_type: NodeType,
    tags: BTreeSet<String>,
    invocation_index: Option<usize>,
    store: Arc<ExtensionValuesStore>,
    registry: ExtensionRegistry,
    test_instance: Option<TestInstance>,
    config: Arc<EngineConfig>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Context of the engine node; its registry holds the configured default extensions
    pub(crate) fn for_root(
        node: NodeId,
        entry: &NodeEntry,
        config: Arc<EngineConfig>,
        cancellation: CancellationToken,
    ) -> Self {
        let registry = ExtensionRegistry::with_defaults(&config.default_extensions);
        let mut ctx = Self {
            node,
            unique_id: entry.unique_id().clone(),
            display_name: entry.display_name().to_string(),
            node_type: entry.node_type(),
            tags: entry.tags().clone(),
            invocation_index: None,
            store: Arc::new(ExtensionValuesStore::with_default_close_action()),
            registry,
            test_instance: None,
            config,
            cancellation,
        };
        ctx.register_declared_extensions(entry);
        ctx
    }

    /// Context for a child node, with the child's declared extensions registered
    pub(crate) fn fork(&self, node: NodeId, entry: &NodeEntry) -> Self {
        let mut ctx = Self {
            node,
            unique_id: entry.unique_id().clone(),
            display_name: entry.display_name().to_string(),
            node_type: entry.node_type(),
            tags: entry.tags().clone(),
            invocation_index: entry.invocation().map(|invocation| invocation.index),
            store: Arc::new(ExtensionValuesStore::child_of(&self.store)),
            registry: self.registry.child(),
            test_instance: self.test_instance.clone(),
            config: self.config.clone(),
            cancellation: self.cancellation.clone(),
        };
        ctx.register_declared_extensions(entry);
        ctx
    }

    fn register_declared_extensions(&mut self, entry: &NodeEntry) {
        for registration in entry.extension_types() {
            registration(&mut self.registry);
        }
        for extension in entry.extensions() {
            self.registry
                .register_extension(extension.clone(), self.unique_id.to_string());
        }
        for late in entry.late_init() {
            self.registry
                .register_uninitialized_extension(late.owner, late.source.clone(), late.initializer.clone());
        }
        if let Some(context) = entry.invocation().and_then(|invocation| invocation.context.clone()) {
            for extension in context.additional_extensions() {
                trace!("Registering invocation extension {} for {}", extension.type_name(), self.unique_id);
                self.registry
                    .register_extension(extension, format!("invocation {}", self.display_name));
            }
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// 1-based index when this node is a template invocation
    pub fn invocation_index(&self) -> Option<usize> {
        self.invocation_index
    }

    pub fn store(&self) -> &Arc<ExtensionValuesStore> {
        &self.store
    }

    /// Shorthand for reading a typed value through the store chain
    pub fn get_value<T: Any + Send + Sync>(&self, namespace: &Namespace, key: &str) -> Result<Option<Arc<T>>> {
        self.store.get_typed::<T>(namespace, key)
    }

    pub fn put_value(&self, namespace: &Namespace, key: &str, value: StoreValue) -> Result<Option<StoreValue>> {
        self.store.put(namespace, key, value)
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn test_instance(&self) -> Option<&TestInstance> {
        self.test_instance.as_ref()
    }

    pub fn test_instance_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.test_instance
            .as_ref()
            .and_then(|instance| instance.clone().downcast::<T>().ok())
    }

    /// Install the node's instance and materialize the late-bound extensions it owns.
    ///
    /// Returns how many extensions were materialized.
    pub fn set_test_instance<T: Any + Send + Sync>(&mut self, instance: T) -> Result<usize> {
        self.set_shared_test_instance(OwnerType::of::<T>(), Arc::new(instance))
    }

    pub fn set_shared_test_instance(&mut self, owner: OwnerType, instance: TestInstance) -> Result<usize> {
        let initialized = self.registry.initialize_extensions(owner, &instance)?;
        self.test_instance = Some(instance);
        Ok(initialized)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("unique_id", &self.unique_id.to_string())
            .field("node_type", &self.node_type)
            .field("registry", &self.registry)
            .field("has_test_instance", &self.test_instance.is_some())
            .finish()
    }
}
