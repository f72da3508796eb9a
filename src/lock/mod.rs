//! Exclusive resources and the locks that guard them

pub mod manager;
pub mod resource;

pub use manager::{LockManager, ResourceLock, ResourceLockGuard, SingleLock, SingleLockKind};
pub use resource::{canonicalize, ExclusiveResource, LockMode, GLOBAL_KEY};
