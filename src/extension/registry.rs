//! Ordered, inheritable registry of extensions
//!
//! A child registry is a structural copy of its parent: registrations made on
//! the child never show up in the parent, and late-bound entries can be
//! materialized independently per child.

use crate::core::errors::{EngineError, Result};
use crate::extension::capability::{Extension, RegisteredExtension, TestInstance};
use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Builds a late-bound extension once the owning instance exists
pub type ExtensionInitializer = Arc<dyn Fn(&TestInstance) -> anyhow::Result<RegisteredExtension> + Send + Sync>;

/// How an entry got into the registry; used for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationCategory {
    /// From the engine configuration
    Default,
    /// Declared on a node, by instance or by type
    Local,
    /// Registered by the engine on behalf of another extension
    Synthetic,
    /// Placeholder materialized once its owner instance exists
    LateInit,
}

impl fmt::Display for RegistrationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Local => "local",
            Self::Synthetic => "synthetic",
            Self::LateInit => "late-init",
        };
        f.write_str(name)
    }
}

/// Type owning late-bound extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerType {
    id: TypeId,
    name: &'static str,
}

impl OwnerType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }
}

#[derive(Clone)]
struct LateInitEntry {
    owner: OwnerType,
    initializer: ExtensionInitializer,
    extension: Option<RegisteredExtension>,
    /// Still waiting for `initialize_extensions` in this registry
    pending: bool,
}

#[derive(Clone)]
enum EntryState {
    Ready(RegisteredExtension),
    LateInit(LateInitEntry),
}

#[derive(Clone)]
struct Entry {
    category: RegistrationCategory,
    source: Option<String>,
    state: EntryState,
}

impl Entry {
    fn extension(&self) -> Option<&RegisteredExtension> {
        match &self.state {
            EntryState::Ready(extension) => Some(extension),
            EntryState::LateInit(late) => late.extension.as_ref(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    entries: Vec<Entry>,
    registered_types: HashSet<TypeId>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root registry holding the configured default extensions, in order
    pub fn with_defaults(defaults: &[RegisteredExtension]) -> Self {
        let mut registry = Self::new();
        for extension in defaults {
            registry.push(RegistrationCategory::Default, None, extension.clone());
        }
        registry
    }

    /// Structural copy for a child node.
    ///
    /// Every late-bound entry is pending again in the child, so the child can
    /// materialize it against its own instance.
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        for entry in &mut child.entries {
            if let EntryState::LateInit(late) = &mut entry.state {
                late.pending = true;
            }
        }
        child
    }

    /// Instantiate and register `E` unless that type is already registered here or in an ancestor
    pub fn register_extension_type<E: Extension + Default>(&mut self) -> bool {
        if self.registered_types.contains(&TypeId::of::<E>()) {
            trace!("Extension type {} already registered", std::any::type_name::<E>());
            return false;
        }
        self.push(RegistrationCategory::Local, None, RegisteredExtension::of(E::default()));
        true
    }

    /// Register a declared instance unconditionally
    pub fn register_extension(&mut self, extension: RegisteredExtension, source: impl Into<String>) {
        self.push(RegistrationCategory::Local, Some(source.into()), extension);
    }

    pub fn register_synthetic_extension(&mut self, extension: RegisteredExtension, source: impl Into<String>) {
        self.push(RegistrationCategory::Synthetic, Some(source.into()), extension);
    }

    /// Reserve a slot for an extension that needs an instance of `owner` to exist first
    pub fn register_uninitialized_extension(
        &mut self,
        owner: OwnerType,
        field_source: impl Into<String>,
        initializer: ExtensionInitializer,
    ) {
        let source = field_source.into();
        trace!("Registering late-init extension for [{}] from source [{}]", owner.name, source);
        self.entries.push(Entry {
            category: RegistrationCategory::LateInit,
            source: Some(source),
            state: EntryState::LateInit(LateInitEntry {
                owner,
                initializer,
                extension: None,
                pending: true,
            }),
        });
    }

    /// Materialize every pending late-bound entry of `owner`, in registration order.
    ///
    /// Returns how many entries were materialized.
    pub fn initialize_extensions(&mut self, owner: OwnerType, instance: &TestInstance) -> Result<usize> {
        let mut initialized = 0;
        for entry in &mut self.entries {
            let source = entry.source.clone().unwrap_or_default();
            if let EntryState::LateInit(late) = &mut entry.state {
                if !late.pending || late.owner != owner {
                    continue;
                }
                late.pending = false;
                let extension = (late.initializer)(instance).map_err(|e| {
                    EngineError::configuration_field(
                        format!("Failed to initialize extension for [{}]: {}", owner.name, e),
                        source.clone(),
                    )
                })?;
                debug!("Initialized late-init extension {} from [{}]", extension.type_name(), source);
                self.registered_types.insert(extension.type_id());
                late.extension = Some(extension);
                initialized += 1;
            }
        }
        Ok(initialized)
    }

    /// Materialized instances of `E`, in registration order
    pub fn stream<E: Extension>(&self) -> Vec<Arc<E>> {
        self.entries
            .iter()
            .filter_map(Entry::extension)
            .filter_map(RegisteredExtension::downcast::<E>)
            .collect()
    }

    /// All materialized extensions, in registration order
    pub fn extensions(&self) -> Vec<RegisteredExtension> {
        self.entries.iter().filter_map(Entry::extension).cloned().collect()
    }

    pub fn is_registered<E: Extension>(&self) -> bool {
        self.registered_types.contains(&TypeId::of::<E>())
    }

    /// Number of entries, materialized or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, category: RegistrationCategory, source: Option<String>, extension: RegisteredExtension) {
        match &source {
            Some(source) => trace!(
                "Registering {} extension [{}] from source [{}]",
                category,
                extension.type_name(),
                source
            ),
            None => trace!("Registering {} extension [{}]", category, extension.type_name()),
        }
        self.registered_types.insert(extension.type_id());
        self.entries.push(Entry {
            category,
            source,
            state: EntryState::Ready(extension),
        });
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|entry| match entry.extension() {
                Some(extension) => format!("{}:{}", entry.category, extension.type_name()),
                None => format!("{}:<uninitialized>", entry.category),
            })
            .collect();
        f.debug_struct("ExtensionRegistry").field("entries", &entries).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Named(&'static str);
    impl Extension for Named {}

    #[derive(Default)]
    struct Other;
    impl Extension for Other {}

    struct Owner {
        label: &'static str,
    }

    fn names(registry: &ExtensionRegistry) -> Vec<&'static str> {
        registry.stream::<Named>().iter().map(|n| n.0).collect()
    }

    fn late_named() -> ExtensionInitializer {
        Arc::new(|instance: &TestInstance| -> anyhow::Result<RegisteredExtension> {
            let owner = instance
                .clone()
                .downcast::<Owner>()
                .map_err(|_| anyhow::anyhow!("unexpected instance"))?;
            Ok(RegisteredExtension::of(Named(owner.label)))
        })
    }

    #[test]
    fn test_registration_order_is_iteration_order() {
        let mut registry = ExtensionRegistry::with_defaults(&[RegisteredExtension::of(Named("default"))]);
        registry.register_extension(RegisteredExtension::of(Named("b")), "field b");
        registry.register_extension(RegisteredExtension::of(Other), "field other");
        registry.register_synthetic_extension(RegisteredExtension::of(Named("a")), "synthetic a");
        assert_eq!(names(&registry), vec!["default", "b", "a"]);
        assert_eq!(registry.stream::<Other>().len(), 1);
        assert_eq!(registry.extensions().len(), 4);
    }

    #[test]
    fn test_type_registration_is_idempotent_across_ancestors() {
        let mut parent = ExtensionRegistry::new();
        assert!(parent.register_extension_type::<Other>());
        assert!(!parent.register_extension_type::<Other>());

        let mut child = parent.child();
        assert!(!child.register_extension_type::<Other>());
        assert!(child.register_extension_type::<Named>());
        assert!(!parent.is_registered::<Named>());
        assert_eq!(child.stream::<Other>().len(), 1);
    }

    #[test]
    fn test_child_registrations_do_not_leak_upwards() {
        let parent = ExtensionRegistry::new();
        let mut child = parent.child();
        child.register_extension(RegisteredExtension::of(Named("child")), "child");
        assert!(parent.stream::<Named>().is_empty());
        assert_eq!(names(&child), vec!["child"]);
    }

    #[test]
    fn test_late_init_keeps_its_slot() {
        let mut registry = ExtensionRegistry::new();
        registry.register_extension(RegisteredExtension::of(Named("first")), "first");
        registry.register_uninitialized_extension(OwnerType::of::<Owner>(), "Owner.field", late_named());
        registry.register_extension(RegisteredExtension::of(Named("last")), "last");

        assert_eq!(names(&registry), vec!["first", "last"]);

        let instance: TestInstance = Arc::new(Owner { label: "late" });
        assert_eq!(registry.initialize_extensions(OwnerType::of::<Owner>(), &instance).unwrap(), 1);
        assert_eq!(names(&registry), vec!["first", "late", "last"]);

        // Consumed: a second call materializes nothing
        assert_eq!(registry.initialize_extensions(OwnerType::of::<Owner>(), &instance).unwrap(), 0);
        assert_eq!(names(&registry), vec!["first", "late", "last"]);
    }

    #[test]
    fn test_late_init_ignores_other_owners() {
        let mut registry = ExtensionRegistry::new();
        registry.register_uninitialized_extension(OwnerType::of::<Owner>(), "Owner.field", late_named());
        let instance: TestInstance = Arc::new(Owner { label: "x" });
        assert_eq!(registry.initialize_extensions(OwnerType::of::<Other>(), &instance).unwrap(), 0);
        assert!(registry.stream::<Named>().is_empty());
    }

    #[test]
    fn test_late_init_is_independent_per_child() {
        let mut parent = ExtensionRegistry::new();
        parent.register_uninitialized_extension(OwnerType::of::<Owner>(), "Owner.field", late_named());

        let mut left = parent.child();
        let right = parent.child();
        let instance: TestInstance = Arc::new(Owner { label: "left" });
        left.initialize_extensions(OwnerType::of::<Owner>(), &instance).unwrap();

        assert_eq!(names(&left), vec!["left"]);
        assert!(right.stream::<Named>().is_empty());
        assert!(parent.stream::<Named>().is_empty());
    }

    #[test]
    fn test_failing_initializer_is_reported() {
        let mut registry = ExtensionRegistry::new();
        registry.register_uninitialized_extension(
            OwnerType::of::<Owner>(),
            "Owner.broken",
            Arc::new(|_: &TestInstance| -> anyhow::Result<RegisteredExtension> {
                Err(anyhow::anyhow!("no way"))
            }),
        );
        let instance: TestInstance = Arc::new(Owner { label: "x" });
        let err = registry
            .initialize_extensions(OwnerType::of::<Owner>(), &instance)
            .unwrap_err();
        assert!(err.to_string().contains("no way"));
    }
}
