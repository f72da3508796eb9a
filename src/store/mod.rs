//! Hierarchical, namespaced extension state

pub mod namespace;
pub mod values;

pub use namespace::Namespace;
pub use values::{default_close_action, CloseAction, CloseableResource, ExtensionValuesStore, StoreValue};
