use crate::core::errors::{BoxError, EngineError, Result};
use crate::store::namespace::Namespace;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A stored resource that must be released when its store closes
pub trait CloseableResource: Send + Sync {
    fn close(&self) -> anyhow::Result<()>;
}

/// A type-erased value held by a store
#[derive(Clone)]
pub struct StoreValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    closeable: Option<Arc<dyn CloseableResource>>,
}

impl StoreValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            closeable: None,
        }
    }

    /// Value that the default close action will close
    pub fn closeable<T: CloseableResource + Any>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            value: value.clone(),
            type_name: std::any::type_name::<T>(),
            closeable: Some(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn as_closeable(&self) -> Option<&Arc<dyn CloseableResource>> {
        self.closeable.as_ref()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Both handles point at the same stored allocation
    pub fn ptr_eq(&self, other: &StoreValue) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    fn cast<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        self.downcast::<T>()
            .ok_or_else(|| EngineError::type_mismatch(key, std::any::type_name::<T>(), self.type_name))
    }
}

impl fmt::Debug for StoreValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreValue")
            .field("type_name", &self.type_name)
            .field("closeable", &self.closeable.is_some())
            .finish()
    }
}

type Supplier = Box<dyn FnOnce() -> anyhow::Result<StoreValue> + Send>;
type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Invoked for every valid value when a store closes
pub type CloseAction = Arc<dyn Fn(&StoreValue) -> anyhow::Result<()> + Send + Sync>;

enum Memo {
    Pending(Supplier),
    Settled(std::result::Result<StoreValue, SharedError>),
}

/// Insertion order plus a supplier that runs at most once
struct StoredValue {
    order: u64,
    memo: Mutex<Memo>,
}

impl StoredValue {
    fn ready(order: u64, value: StoreValue) -> Self {
        Self {
            order,
            memo: Mutex::new(Memo::Settled(Ok(value))),
        }
    }

    fn lazy(order: u64, supplier: Supplier) -> Self {
        Self {
            order,
            memo: Mutex::new(Memo::Pending(supplier)),
        }
    }

    /// Run the supplier on first call; every later call replays its outcome.
    ///
    /// The mutex is held while the supplier runs so concurrent callers wait for it.
    /// A supplier may read other keys but must not read the key it is computing.
    fn evaluate(&self) -> std::result::Result<StoreValue, SharedError> {
        let mut memo = self.memo.lock();
        // Stays in place if the supplier panics.
        let interrupted: BoxError = "stored value supplier did not complete".into();
        let settled = match std::mem::replace(&mut *memo, Memo::Settled(Err(Arc::from(interrupted)))) {
            Memo::Pending(supplier) => supplier().map_err(|e| {
                let boxed: BoxError = e.into();
                SharedError::from(boxed)
            }),
            Memo::Settled(settled) => settled,
        };
        *memo = Memo::Settled(settled.clone());
        settled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CompositeKey {
    namespace: Namespace,
    key: String,
}

/// Hierarchical, namespaced value store owned by one execution context.
///
/// Reads fall back to the parent chain; writes only ever touch this store.
pub struct ExtensionValuesStore {
    values: DashMap<CompositeKey, Arc<StoredValue>>,
    insert_order: AtomicU64,
    parent: Option<Weak<ExtensionValuesStore>>,
    close_action: Option<CloseAction>,
    closed: AtomicBool,
}

impl ExtensionValuesStore {
    /// Root store without a close action
    pub fn new() -> Self {
        Self::build(None, None)
    }

    pub fn with_close_action(close_action: CloseAction) -> Self {
        Self::build(None, Some(close_action))
    }

    /// Store that closes every closeable value on close
    pub fn with_default_close_action() -> Self {
        Self::build(None, Some(default_close_action()))
    }

    /// Child store reading through to `parent`; the child inherits the parent's close action
    pub fn child_of(parent: &Arc<ExtensionValuesStore>) -> Self {
        Self::build(Some(Arc::downgrade(parent)), parent.close_action.clone())
    }

    fn build(parent: Option<Weak<ExtensionValuesStore>>, close_action: Option<CloseAction>) -> Self {
        Self {
            values: DashMap::new(),
            insert_order: AtomicU64::new(0),
            parent,
            close_action,
            closed: AtomicBool::new(false),
        }
    }

    pub fn parent(&self) -> Option<Arc<ExtensionValuesStore>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Number of entries held locally
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Value for the key in this store or the nearest ancestor holding it
    pub fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<StoreValue>> {
        let composite = CompositeKey {
            namespace: namespace.clone(),
            key: key.to_string(),
        };
        match self.lookup(&composite) {
            Some(stored) => Self::resolve(&composite, &stored).map(Some),
            None => Ok(None),
        }
    }

    /// Like `get`, cast to `T`
    pub fn get_typed<T: Any + Send + Sync>(&self, namespace: &Namespace, key: &str) -> Result<Option<Arc<T>>> {
        self.get(namespace, key)?
            .map(|value| value.cast::<T>(key))
            .transpose()
    }

    /// Value for the key, computing and caching it in this store if no store in the chain has it.
    ///
    /// Concurrent first callers share one computation and observe the same value or failure.
    pub fn get_or_compute_if_absent<F>(&self, namespace: &Namespace, key: &str, compute: F) -> Result<StoreValue>
    where
        F: FnOnce(&str) -> anyhow::Result<StoreValue> + Send + 'static,
    {
        self.ensure_open()?;
        let composite = CompositeKey {
            namespace: namespace.clone(),
            key: key.to_string(),
        };
        let stored = match self.lookup(&composite) {
            Some(stored) => stored,
            None => {
                let owned_key = key.to_string();
                // Guard is released before evaluation so the supplier may use the store
                self.values
                    .entry(composite.clone())
                    .or_insert_with(|| {
                        debug!("Installing lazy value for key [{}] in namespace {}", owned_key, composite.namespace);
                        let order = self.next_order();
                        Arc::new(StoredValue::lazy(order, Box::new(move || compute(&owned_key))))
                    })
                    .clone()
            }
        };
        Self::resolve(&composite, &stored)
    }

    /// Like `get_or_compute_if_absent`, storing a plain value of type `V` and casting to `V`
    pub fn get_or_compute_if_absent_typed<V, F>(&self, namespace: &Namespace, key: &str, compute: F) -> Result<Arc<V>>
    where
        V: Any + Send + Sync,
        F: FnOnce(&str) -> anyhow::Result<V> + Send + 'static,
    {
        self.get_or_compute_if_absent(namespace, key, move |k| compute(k).map(StoreValue::new))?
            .cast::<V>(key)
    }

    /// Store a value locally, returning what this store held before
    pub fn put(&self, namespace: &Namespace, key: &str, value: StoreValue) -> Result<Option<StoreValue>> {
        self.ensure_open()?;
        let composite = CompositeKey {
            namespace: namespace.clone(),
            key: key.to_string(),
        };
        let stored = Arc::new(StoredValue::ready(self.next_order(), value));
        match self.values.insert(composite.clone(), stored) {
            Some(previous) => Self::resolve(&composite, &previous).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a local value; ancestors are never touched
    pub fn remove(&self, namespace: &Namespace, key: &str) -> Result<Option<StoreValue>> {
        let composite = CompositeKey {
            namespace: namespace.clone(),
            key: key.to_string(),
        };
        match self.values.remove(&composite) {
            Some((_, previous)) => Self::resolve(&composite, &previous).map(Some),
            None => Ok(None),
        }
    }

    pub fn remove_typed<T: Any + Send + Sync>(&self, namespace: &Namespace, key: &str) -> Result<Option<Arc<T>>> {
        self.remove(namespace, key)?
            .map(|value| value.cast::<T>(key))
            .transpose()
    }

    /// Run the close action over every valid value, newest first.
    ///
    /// Values whose computation failed are skipped. All close failures are
    /// collected into one aggregate error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let close_action = match &self.close_action {
            Some(action) => action.clone(),
            None => return Ok(()),
        };

        let mut entries: Vec<(CompositeKey, Arc<StoredValue>)> = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| b.1.order.cmp(&a.1.order));

        let mut failures = Vec::new();
        for (composite, stored) in entries {
            let value = match stored.evaluate() {
                Ok(value) => value,
                Err(_) => continue,
            };
            debug!("Closing value for key [{}] in namespace {}", composite.key, composite.namespace);
            if let Err(e) = close_action(&value) {
                warn!("Closing value for key [{}] failed: {}", composite.key, e);
                failures.push(EngineError::internal(format!(
                    "failed to close value stored under key [{}]: {}",
                    composite.key, e
                )));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::aggregate("Failed to close extension values", failures))
        }
    }

    fn next_order(&self) -> u64 {
        self.insert_order.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EngineError::StoreClosed)
        } else {
            Ok(())
        }
    }

    fn lookup(&self, composite: &CompositeKey) -> Option<Arc<StoredValue>> {
        if let Some(stored) = self.values.get(composite) {
            return Some(stored.value().clone());
        }
        self.parent().and_then(|parent| parent.lookup(composite))
    }

    fn resolve(composite: &CompositeKey, stored: &StoredValue) -> Result<StoreValue> {
        stored.evaluate().map_err(|source| EngineError::StoreComputation {
            namespace: composite.namespace.to_string(),
            key: composite.key.clone(),
            source,
        })
    }
}

impl Default for ExtensionValuesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtensionValuesStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionValuesStore")
            .field("entries", &self.values.len())
            .field("has_parent", &self.parent.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Close action that closes closeable values and ignores everything else
pub fn default_close_action() -> CloseAction {
    Arc::new(|value: &StoreValue| match value.as_closeable() {
        Some(resource) => resource.close(),
        None => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ns() -> Namespace {
        Namespace::create(["tests"]).unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let store = ExtensionValuesStore::new();
        assert!(store.get(&ns(), "k").unwrap().is_none());
        assert!(store.put(&ns(), "k", StoreValue::new(1u32)).unwrap().is_none());
        let previous = store.put(&ns(), "k", StoreValue::new(2u32)).unwrap().unwrap();
        assert_eq!(*previous.downcast::<u32>().unwrap(), 1);
        assert_eq!(*store.get_typed::<u32>(&ns(), "k").unwrap().unwrap(), 2);
        assert_eq!(*store.remove_typed::<u32>(&ns(), "k").unwrap().unwrap(), 2);
        assert!(store.get(&ns(), "k").unwrap().is_none());
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let store = ExtensionValuesStore::new();
        let other = Namespace::create(["other"]).unwrap();
        store.put(&ns(), "k", StoreValue::new("a")).unwrap();
        assert!(store.get(&other, "k").unwrap().is_none());
    }

    #[test]
    fn test_type_mismatch_names_key_and_types() {
        let store = ExtensionValuesStore::new();
        store.put(&ns(), "answer", StoreValue::new(String::from("42"))).unwrap();
        let err = store.get_typed::<u32>(&ns(), "answer").unwrap_err();
        assert!(matches!(err, EngineError::StoreTypeMismatch { .. }));
        let message = err.to_string();
        assert!(message.contains("[answer]"));
        assert!(message.contains("u32"));
        assert!(message.contains("String"));
    }

    #[test]
    fn test_read_through_without_write_through() {
        let parent = Arc::new(ExtensionValuesStore::new());
        parent.put(&ns(), "shared", StoreValue::new(1u8)).unwrap();
        let child = Arc::new(ExtensionValuesStore::child_of(&parent));
        let sibling = Arc::new(ExtensionValuesStore::child_of(&parent));

        child.put(&ns(), "local", StoreValue::new(2u8)).unwrap();

        assert_eq!(*child.get_typed::<u8>(&ns(), "shared").unwrap().unwrap(), 1);
        assert_eq!(*child.get_typed::<u8>(&ns(), "local").unwrap().unwrap(), 2);
        assert!(parent.get(&ns(), "local").unwrap().is_none());
        assert!(sibling.get(&ns(), "local").unwrap().is_none());

        // Removing from the child leaves the parent untouched
        assert!(child.remove(&ns(), "shared").unwrap().is_none());
        assert!(parent.get(&ns(), "shared").unwrap().is_some());
    }

    #[test]
    fn test_compute_reuses_ancestor_value() {
        let parent = Arc::new(ExtensionValuesStore::new());
        parent.put(&ns(), "k", StoreValue::new(5i32)).unwrap();
        let child = ExtensionValuesStore::child_of(&parent);
        let value = child
            .get_or_compute_if_absent_typed::<i32, _>(&ns(), "k", |_| Ok(6))
            .unwrap();
        assert_eq!(*value, 5);
        assert!(child.is_empty());
    }

    #[test]
    fn test_single_evaluation_under_concurrency() {
        let store = Arc::new(ExtensionValuesStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    store
                        .get_or_compute_if_absent(&ns(), "expensive", move |key| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(StoreValue::new(format!("value for {}", key)))
                        })
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<StoreValue> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v.ptr_eq(&values[0])));
        assert_eq!(*values[0].downcast::<String>().unwrap(), "value for expensive");
    }

    #[test]
    fn test_failure_is_cached_and_replayed() {
        let store = Arc::new(ExtensionValuesStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    store
                        .get_or_compute_if_absent(&ns(), "broken", move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err(anyhow::anyhow!("cannot compute"))
                        })
                        .unwrap_err()
                })
            })
            .collect();
        let errors: Vec<EngineError> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = match &errors[0] {
            EngineError::StoreComputation { source, .. } => source.clone(),
            other => panic!("unexpected error {:?}", other),
        };
        for error in &errors {
            match error {
                EngineError::StoreComputation { source, .. } => assert!(Arc::ptr_eq(source, &first)),
                other => panic!("unexpected error {:?}", other),
            }
        }
        // Plain reads replay the failure too
        assert!(store.get(&ns(), "broken").is_err());
    }

    struct Recorded {
        name: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    impl CloseableResource for Recorded {
        fn close(&self) -> anyhow::Result<()> {
            self.log.lock().push(self.name);
            if self.name == "B" {
                anyhow::bail!("B refused to close");
            }
            Ok(())
        }
    }

    #[test]
    fn test_close_in_reverse_insertion_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let store = ExtensionValuesStore::with_default_close_action();
        for name in ["A", "B", "C"] {
            store
                .put(&ns(), name, StoreValue::closeable(Recorded { name, log: log.clone() }))
                .unwrap();
        }
        store.put(&ns(), "plain", StoreValue::new(1u8)).unwrap();
        store
            .get_or_compute_if_absent(&ns(), "failed", |_| Err(anyhow::anyhow!("never valid")))
            .unwrap_err();

        let err = store.close().unwrap_err();
        assert_eq!(*log.lock(), vec!["C", "B", "A"]);
        match err {
            EngineError::Aggregate { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(
            store.put(&ns(), "late", StoreValue::new(0u8)),
            Err(EngineError::StoreClosed)
        ));
    }

    #[test]
    fn test_close_without_action_is_noop() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let store = ExtensionValuesStore::new();
        store
            .put(&ns(), "A", StoreValue::closeable(Recorded { name: "A", log: log.clone() }))
            .unwrap();
        store.close().unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_child_close_leaves_parent_values() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let parent = Arc::new(ExtensionValuesStore::with_default_close_action());
        parent
            .put(&ns(), "A", StoreValue::closeable(Recorded { name: "A", log: log.clone() }))
            .unwrap();
        let child = ExtensionValuesStore::child_of(&parent);
        child
            .put(&ns(), "C", StoreValue::closeable(Recorded { name: "C", log: log.clone() }))
            .unwrap();
        child.close().unwrap();
        assert_eq!(*log.lock(), vec!["C"]);
        assert!(parent.get(&ns(), "A").unwrap().is_some());
    }

    #[test]
    fn test_supplier_can_compute_other_keys() {
        let store = Arc::new(ExtensionValuesStore::new());
        let inner = store.clone();
        let url = store
            .get_or_compute_if_absent_typed::<String, _>(&ns(), "url", move |_| {
                let port = inner.get_or_compute_if_absent_typed::<u16, _>(&ns(), "port", |_| Ok(5432))?;
                Ok(format!("localhost:{}", port))
            })
            .unwrap();
        assert_eq!(url.as_str(), "localhost:5432");
        assert_eq!(*store.get_typed::<u16>(&ns(), "port").unwrap().unwrap(), 5432);

        // A failed supplier is replayed, not rerun
        let failing = store.get_or_compute_if_absent(&ns(), "broken", |_| Err(anyhow::anyhow!("no connection")));
        assert!(failing.is_err());
        let replayed = store.get_or_compute_if_absent(&ns(), "broken", |_| Ok(StoreValue::new(1u8)));
        assert!(replayed.unwrap_err().to_string().contains("no connection"));
    }
}
