use crate::core::errors::{EngineError, Result};
use crate::lock::resource::{canonicalize, ExclusiveResource, LockMode};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hands out resource locks; one reader/writer lock per key for the whole run.
#[derive(Debug, Default)]
pub struct LockManager {
    locks_by_key: DashMap<String, Arc<RwLock<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock covering every requested resource
    pub fn lock_for<'a, I>(&self, resources: I) -> ResourceLock
    where
        I: IntoIterator<Item = &'a ExclusiveResource>,
    {
        let mut canonical = canonicalize(resources);
        match canonical.len() {
            0 => ResourceLock::Nop,
            1 => {
                let resource = canonical.remove(0);
                ResourceLock::Single(self.single_lock(resource))
            }
            _ => ResourceLock::Composite(
                canonical
                    .into_iter()
                    .map(|resource| self.single_lock(resource))
                    .collect(),
            ),
        }
    }

    /// Number of distinct keys seen so far
    pub fn known_keys(&self) -> usize {
        self.locks_by_key.len()
    }

    fn single_lock(&self, resource: ExclusiveResource) -> SingleLock {
        let lock = self
            .locks_by_key
            .entry(resource.key().to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();
        let kind = if resource == ExclusiveResource::global_read() {
            SingleLockKind::GlobalRead
        } else if resource == ExclusiveResource::global_read_write() {
            SingleLockKind::GlobalReadWrite
        } else {
            SingleLockKind::Plain
        };
        SingleLock { resource, kind, lock }
    }
}

/// Tag that lets the scheduler recognize the reserved global locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleLockKind {
    Plain,
    GlobalRead,
    GlobalReadWrite,
}

#[derive(Debug, Clone)]
pub struct SingleLock {
    resource: ExclusiveResource,
    kind: SingleLockKind,
    lock: Arc<RwLock<()>>,
}

impl SingleLock {
    pub fn resource(&self) -> &ExclusiveResource {
        &self.resource
    }

    pub fn kind(&self) -> SingleLockKind {
        self.kind
    }

    async fn acquire(&self) -> HeldLock {
        match self.resource.mode() {
            LockMode::Read => HeldLock::Read(self.lock.clone().read_owned().await),
            LockMode::ReadWrite => HeldLock::Write(self.lock.clone().write_owned().await),
        }
    }

    fn try_acquire(&self) -> Option<HeldLock> {
        match self.resource.mode() {
            LockMode::Read => self.lock.clone().try_read_owned().ok().map(HeldLock::Read),
            LockMode::ReadWrite => self.lock.clone().try_write_owned().ok().map(HeldLock::Write),
        }
    }
}

/// A lock over zero, one or several resources
#[derive(Debug, Clone)]
pub enum ResourceLock {
    Nop,
    Single(SingleLock),
    /// Constituents in canonical order
    Composite(Vec<SingleLock>),
}

impl ResourceLock {
    fn parts(&self) -> &[SingleLock] {
        match self {
            Self::Nop => &[],
            Self::Single(lock) => std::slice::from_ref(lock),
            Self::Composite(locks) => locks,
        }
    }

    /// Resources in acquisition order
    pub fn resources(&self) -> Vec<ExclusiveResource> {
        self.parts().iter().map(|lock| lock.resource.clone()).collect()
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Self::Nop)
    }

    /// True for the global read-write lock, which must not overlap with anything
    pub fn is_global_read_write(&self) -> bool {
        matches!(self, Self::Single(lock) if lock.kind == SingleLockKind::GlobalReadWrite)
            || self
                .parts()
                .iter()
                .any(|lock| lock.resource == ExclusiveResource::global_read_write())
    }

    /// Acquire every constituent in canonical order, waiting as long as needed
    pub async fn acquire(&self) -> ResourceLockGuard {
        let mut held = Vec::with_capacity(self.parts().len());
        for lock in self.parts() {
            debug!("Acquiring lock {}", lock.resource);
            held.push(lock.acquire().await);
        }
        ResourceLockGuard { held }
    }

    /// Acquire unless the token is cancelled first.
    ///
    /// Partially acquired constituents are released when cancellation wins.
    pub async fn acquire_cancellable(&self, token: &CancellationToken) -> Result<ResourceLockGuard> {
        if self.is_nop() {
            return Ok(ResourceLockGuard { held: Vec::new() });
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(EngineError::cancelled("resource lock acquisition")),
            guard = self.acquire() => Ok(guard),
        }
    }

    /// Acquire without waiting; fails if any constituent is held incompatibly
    pub fn try_acquire(&self) -> Result<ResourceLockGuard> {
        let mut held = Vec::with_capacity(self.parts().len());
        for lock in self.parts() {
            match lock.try_acquire() {
                Some(guard) => held.push(guard),
                None => {
                    return Err(EngineError::lock_acquisition(
                        lock.resource.to_string(),
                        "lock is currently held by another node",
                    ))
                }
            }
        }
        Ok(ResourceLockGuard { held })
    }
}

#[derive(Debug)]
enum HeldLock {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Held resource lock; constituents are released in acquisition order.
#[derive(Debug)]
pub struct ResourceLockGuard {
    held: Vec<HeldLock>,
}

impl ResourceLockGuard {
    pub fn release(self) {
        drop(self);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        for held in self.held.drain(..) {
            match held {
                HeldLock::Read(guard) => drop(guard),
                HeldLock::Write(guard) => drop(guard),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_set_is_nop() {
        let manager = LockManager::new();
        let lock = manager.lock_for(&Vec::new());
        assert!(lock.is_nop());
        assert!(lock.try_acquire().unwrap().is_empty());
    }

    #[test]
    fn test_global_locks_are_tagged() {
        let manager = LockManager::new();
        match manager.lock_for(&vec![ExclusiveResource::global_read()]) {
            ResourceLock::Single(lock) => assert_eq!(lock.kind(), SingleLockKind::GlobalRead),
            other => panic!("unexpected lock {:?}", other),
        }
        let lock = manager.lock_for(&vec![ExclusiveResource::global_read_write()]);
        assert!(lock.is_global_read_write());
    }

    #[test]
    fn test_composite_order_and_dedup() {
        let manager = LockManager::new();
        let lock = manager.lock_for(&vec![
            ExclusiveResource::read("b"),
            ExclusiveResource::read_write("a"),
            ExclusiveResource::global_read(),
            ExclusiveResource::read_write("b"),
        ]);
        assert_eq!(
            lock.resources(),
            vec![
                ExclusiveResource::global_read(),
                ExclusiveResource::read_write("a"),
                ExclusiveResource::read_write("b"),
            ]
        );
        assert_eq!(manager.known_keys(), 3);
    }

    #[test]
    fn test_locks_are_shared_per_key() {
        let manager = LockManager::new();
        let first = manager.lock_for(&vec![ExclusiveResource::read_write("k")]);
        let second = manager.lock_for(&vec![ExclusiveResource::read("k")]);

        let guard = first.try_acquire().unwrap();
        assert!(second.try_acquire().is_err());
        guard.release();
        assert!(second.try_acquire().is_ok());
    }

    #[test]
    fn test_readers_share() {
        let manager = LockManager::new();
        let lock = manager.lock_for(&vec![ExclusiveResource::read("k")]);
        let _first = lock.try_acquire().unwrap();
        assert!(lock.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_while_waiting() {
        let manager = LockManager::new();
        let lock = manager.lock_for(&vec![ExclusiveResource::read_write("k")]);
        let _held = lock.acquire().await;

        let token = CancellationToken::new();
        let waiter = {
            let lock = lock.clone();
            let token = token.clone();
            tokio::spawn(async move { lock.acquire_cancellable(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_composites_do_not_deadlock() {
        let manager = Arc::new(LockManager::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                // Opposite declaration orders on alternating tasks
                let resources = if i % 2 == 0 {
                    vec![ExclusiveResource::read_write("x"), ExclusiveResource::read_write("y")]
                } else {
                    vec![ExclusiveResource::read_write("y"), ExclusiveResource::read_write("x")]
                };
                let lock = manager.lock_for(&resources);
                for _ in 0..20 {
                    let guard = lock.acquire().await;
                    tokio::task::yield_now().await;
                    guard.release();
                }
            }));
        }
        let all = futures::future::join_all(handles);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("composite locks deadlocked");
        assert!(results.into_iter().all(|r| r.is_ok()));
    }
}
