use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Reserved key of the resource every top-level node shares.
pub const GLOBAL_KEY: &str = "arbor.execution.global";

/// Strength at which a resource is requested.
///
/// The declaration order is the sort order: `ReadWrite` sorts before `Read`,
/// so when one key is requested at both strengths the write lock is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    ReadWrite,
    Read,
}

/// A named contention point declared by a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExclusiveResource {
    key: String,
    mode: LockMode,
}

impl ExclusiveResource {
    pub fn new(key: impl Into<String>, mode: LockMode) -> Self {
        Self {
            key: key.into(),
            mode,
        }
    }

    pub fn read(key: impl Into<String>) -> Self {
        Self::new(key, LockMode::Read)
    }

    pub fn read_write(key: impl Into<String>) -> Self {
        Self::new(key, LockMode::ReadWrite)
    }

    /// May run alongside other global readers but never alongside a global writer
    pub fn global_read() -> Self {
        Self::read(GLOBAL_KEY)
    }

    /// Runs in isolation from every other top-level node
    pub fn global_read_write() -> Self {
        Self::read_write(GLOBAL_KEY)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_global(&self) -> bool {
        self.key == GLOBAL_KEY
    }

    /// Two requests conflict when they name the same key and at least one writes
    pub fn conflicts_with(&self, other: &ExclusiveResource) -> bool {
        self.key == other.key && (self.mode == LockMode::ReadWrite || other.mode == LockMode::ReadWrite)
    }
}

impl Ord for ExclusiveResource {
    fn cmp(&self, other: &Self) -> Ordering {
        (!self.is_global(), self.key.as_str(), self.mode).cmp(&(
            !other.is_global(),
            other.key.as_str(),
            other.mode,
        ))
    }
}

impl PartialOrd for ExclusiveResource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExclusiveResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            LockMode::ReadWrite => "read_write",
            LockMode::Read => "read",
        };
        write!(f, "{}[{}]", self.key, mode)
    }
}

/// Sort, drop duplicates and keep only the first request per key.
pub fn canonicalize<'a, I>(resources: I) -> Vec<ExclusiveResource>
where
    I: IntoIterator<Item = &'a ExclusiveResource>,
{
    let mut sorted: Vec<ExclusiveResource> = resources.into_iter().cloned().collect();
    sorted.sort();
    sorted.dedup_by(|later, earlier| later.key == earlier.key);
    sorted
}
