use crate::core::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::fmt::Write;
use std::str::FromStr;

/// Characters written as `%XX` in the rendered form
const RESERVED: [char; 5] = ['%', '[', ']', '/', ':'];

/// One `[type:value]` element of a [`UniqueId`]
///
/// `%`, `[`, `]`, `/` and `:` in either part render as `%XX` escapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    kind: String,
    value: String,
}

impl Segment {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", escape(&self.kind), escape(&self.value))
    }
}

fn escape(raw: &str) -> Cow<'_, str> {
    if !raw.contains(&RESERVED[..]) {
        return Cow::Borrowed(raw);
    }
    let mut escaped = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        if RESERVED.contains(&c) {
            let _ = write!(escaped, "%{:02X}", u32::from(c));
        } else {
            escaped.push(c);
        }
    }
    Cow::Owned(escaped)
}

fn unescape(escaped: &str) -> Option<String> {
    let mut raw = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            raw.push(c);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        if hex.len() != 2 {
            return None;
        }
        raw.push(char::from(u8::from_str_radix(&hex, 16).ok()?));
    }
    Some(raw)
}

/// Hierarchical node identifier; a child's id always extends its parent's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId {
    segments: Vec<Segment>,
}

impl UniqueId {
    pub fn root(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::new(kind, value)],
        }
    }

    pub fn for_engine(engine_id: impl Into<String>) -> Self {
        Self::root("engine", engine_id)
    }

    pub fn append(&self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::new(kind, value));
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn parent(&self) -> Option<UniqueId> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True when `prefix` is this id or one of its ancestors
    pub fn has_prefix(&self, prefix: &UniqueId) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Swap `old_prefix` for `new_prefix`, or `None` if this id does not start with it
    pub fn replace_prefix(&self, old_prefix: &UniqueId, new_prefix: &UniqueId) -> Option<UniqueId> {
        if !self.has_prefix(old_prefix) {
            return None;
        }
        let mut segments = new_prefix.segments.clone();
        segments.extend_from_slice(&self.segments[old_prefix.segments.len()..]);
        Some(Self { segments })
    }
}

/// Id of a copied descendant: the template's prefix is replaced by the invocation's.
///
/// Ids outside the template are returned unchanged.
pub fn rewrite(old: &UniqueId, template_prefix: &UniqueId, invocation_prefix: &UniqueId) -> UniqueId {
    old.replace_prefix(template_prefix, invocation_prefix)
        .unwrap_or_else(|| old.clone())
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.segments.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join("/"))
    }
}

impl FromStr for UniqueId {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        let malformed = || EngineError::configuration(format!("malformed unique id '{}'", value));
        let inner = value
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(malformed)?;

        let segments = inner
            .split("]/[")
            .map(|segment| {
                segment
                    .split_once(':')
                    .filter(|(kind, _)| !kind.is_empty())
                    .and_then(|(kind, value)| Some(Segment::new(unescape(kind)?, unescape(value)?)))
                    .ok_or_else(malformed)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { segments })
    }
}
