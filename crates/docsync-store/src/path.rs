//! Absolute hierarchical paths addressing collections and documents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// An absolute, normalized path such as `/db/apps/site/index.xml`.
///
/// Segments are separated by `/`, are never empty and are never `.` or `..`.
/// A trailing slash is tolerated on input and stripped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath(String);

impl DocPath {
    /// Parse and normalize a path.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('/') {
            return Err(invalid("path must be absolute"));
        }
        let trimmed = if raw.len() > 1 {
            raw.strip_suffix('/').unwrap_or(raw)
        } else {
            raw
        };
        if trimmed == "/" {
            return Err(invalid("path has no segments"));
        }
        for segment in trimmed[1..].split('/') {
            match segment {
                "" => return Err(invalid("empty segment")),
                "." | ".." => return Err(invalid("relative segment")),
                s if s.chars().any(char::is_control) => {
                    return Err(invalid("control character in segment"))
                }
                _ => {}
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Wrap a literal known to be normalized.
    pub(crate) fn trusted(raw: &str) -> Self {
        debug_assert!(Self::parse(raw).is_ok());
        Self(raw.to_string())
    }

    /// The path text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the segments, top-down.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The last segment (document or collection name).
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// The enclosing collection, or `None` for a single-segment path.
    pub fn parent(&self) -> Option<DocPath> {
        match self.0.rfind('/') {
            Some(0) | None => None,
            Some(idx) => Some(Self(self.0[..idx].to_string())),
        }
    }

    /// Append one segment.
    pub fn join(&self, name: &str) -> Result<DocPath, StoreError> {
        if name.is_empty() || name.contains('/') {
            return Err(StoreError::InvalidPath {
                path: format!("{}/{}", self.0, name),
                reason: "name must be a single non-empty segment".to_string(),
            });
        }
        Self::parse(&format!("{}/{}", self.0, name))
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &DocPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// True if the two paths are equal or one contains the other.
    pub fn overlaps(&self, other: &DocPath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// All strict ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<DocPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out
    }

    /// Rewrite `self` from under `from` to under `to`. Returns `None` if `self`
    /// is neither `from` nor below it.
    pub fn rebase(&self, from: &DocPath, to: &DocPath) -> Option<DocPath> {
        if self == from {
            return Some(to.clone());
        }
        if from.is_ancestor_of(self) {
            return Some(Self(format!("{}{}", to.0, &self.0[from.0.len()..])));
        }
        None
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocPath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocPath {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.0
    }
}
