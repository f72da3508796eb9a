use crate::core::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compound key segment that keeps unrelated extensions from colliding in a store.
///
/// Two namespaces are equal when their parts are equal, in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    parts: Vec<String>,
}

impl Namespace {
    /// Namespace from one or more parts
    pub fn create<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(EngineError::configuration("namespace parts must not be empty"));
        }
        Ok(Self { parts })
    }

    /// Shared namespace for values that are not owned by any extension
    pub fn global() -> Self {
        Self {
            parts: vec!["GLOBAL".to_string()],
        }
    }

    /// Namespace named after a type, the usual choice for an extension's own state
    pub fn for_type<T: ?Sized + 'static>() -> Self {
        Self {
            parts: vec![std::any::type_name::<T>().to_string()],
        }
    }

    /// New namespace with extra parts appended to this one
    pub fn append<I, S>(&self, parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let extra: Vec<String> = parts.into_iter().map(Into::into).collect();
        if extra.is_empty() {
            return Err(EngineError::configuration("appended namespace parts must not be empty"));
        }
        let mut combined = self.parts.clone();
        combined.extend(extra);
        Ok(Self { parts: combined })
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.parts.join(", "))
    }
}
