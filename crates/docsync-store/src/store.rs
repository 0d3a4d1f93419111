//! The hierarchical document store and its in-memory implementation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::lock::{LockGuard, LockManager};
use crate::path::DocPath;
use crate::security::{SYSTEM_ACCOUNT, SYSTEM_GROUP};
use crate::txn::{StoreOp, Txn, TxnId, TxnState};

/// Default mode for new documents.
pub const DEFAULT_RESOURCE_MODE: u32 = 0o644;
/// Default mode for new collections.
pub const DEFAULT_COLLECTION_MODE: u32 = 0o755;

/// How a document's content is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Structured (XML) content.
    Xml,
    /// Opaque bytes.
    Binary,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Xml => f.write_str("XML"),
            ResourceKind::Binary => f.write_str("BINARY"),
        }
    }
}

/// Stable identity of a stored resource; survives moves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Owner, group and mode bits of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Owning account name.
    pub owner: String,
    /// Owning group name.
    pub group: String,
    /// Unix-style mode bits.
    pub mode: u32,
}

impl Permission {
    /// Permission with an explicit mode.
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u32) -> Self {
        Self {
            owner: owner.into(),
            group: group.into(),
            mode,
        }
    }

    /// Default permission for a new document.
    pub fn resource_default(owner: impl Into<String>, group: impl Into<String>) -> Self {
        Self::new(owner, group, DEFAULT_RESOURCE_MODE)
    }

    /// Default permission for a new collection.
    pub fn collection_default(owner: impl Into<String>, group: impl Into<String>) -> Self {
        Self::new(owner, group, DEFAULT_COLLECTION_MODE)
    }
}

/// Read-only view of a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionInfo {
    /// Stable identity.
    pub id: ResourceId,
    /// Collection path.
    pub path: DocPath,
    /// Current permission.
    pub permission: Permission,
}

/// Read-only view of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentInfo {
    /// Stable identity.
    pub id: ResourceId,
    /// Document path.
    pub path: DocPath,
    /// Storage kind.
    pub kind: ResourceKind,
    /// Recorded mime type.
    pub mime_type: String,
    /// Current permission.
    pub permission: Permission,
    /// Content length in bytes.
    pub size: usize,
}

/// A hierarchical store of collections and documents.
///
/// Writers lock the collections they touch, stage mutations in a [`Txn`] and
/// commit it; readers see either all or none of a transaction's effects.
pub trait Store: Send + Sync {
    /// The root collection, which always exists.
    fn root(&self) -> DocPath;
    /// Acquire subtree write locks on `paths`, blocking until granted.
    fn lock(&self, paths: &[DocPath]) -> LockGuard;
    /// Begin a transaction tagged with `origin`.
    fn begin(&self, origin: &str) -> Txn;
    /// Apply every staged operation atomically.
    fn commit(&self, txn: Txn) -> Result<(), StoreError>;
    /// Discard the transaction.
    fn abort(&self, txn: Txn);
    /// Look up a collection.
    fn collection(&self, path: &DocPath) -> Option<CollectionInfo>;
    /// Look up a document.
    fn document(&self, path: &DocPath) -> Option<DocumentInfo>;
    /// Read a document's content.
    fn read_document(&self, path: &DocPath) -> Option<Bytes>;
    /// Direct children (collections and documents) of a collection.
    fn list(&self, collection: &DocPath) -> Vec<DocPath>;
    /// Check that `source` holds well-formed XML destined for `path`.
    fn validate_xml(&self, path: &DocPath, source: &mut dyn Read) -> Result<(), StoreError>;
}

#[derive(Clone, Debug)]
struct CollectionEntry {
    id: ResourceId,
    permission: Permission,
}

#[derive(Clone, Debug)]
struct DocumentEntry {
    id: ResourceId,
    kind: ResourceKind,
    mime_type: String,
    content: Bytes,
    permission: Permission,
}

#[derive(Clone, Debug, Default)]
struct StoreData {
    collections: BTreeMap<DocPath, CollectionEntry>,
    documents: BTreeMap<DocPath, DocumentEntry>,
    next_id: u64,
}

impl StoreData {
    fn allocate_id(&mut self) -> ResourceId {
        self.next_id += 1;
        ResourceId(self.next_id)
    }

    fn require_collection(&self, path: &DocPath) -> Result<(), StoreError> {
        if self.collections.contains_key(path) {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                path: path.to_string(),
            })
        }
    }

    fn require_vacant(&self, path: &DocPath) -> Result<(), StoreError> {
        if self.collections.contains_key(path) || self.documents.contains_key(path) {
            Err(StoreError::AlreadyExists {
                path: path.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn parent_of(path: &DocPath) -> Result<DocPath, StoreError> {
        path.parent().ok_or_else(|| StoreError::InvalidPath {
            path: path.to_string(),
            reason: "resource has no parent collection".to_string(),
        })
    }

    fn apply(&mut self, root: &DocPath, op: StoreOp) -> Result<(), StoreError> {
        match op {
            StoreOp::CreateCollection { path, permission } => {
                if path != *root && !root.is_ancestor_of(&path) {
                    return Err(StoreError::InvalidPath {
                        path: path.to_string(),
                        reason: format!("outside root collection {}", root),
                    });
                }
                self.require_vacant(&path)?;
                let mut missing: Vec<DocPath> = path
                    .ancestors()
                    .into_iter()
                    .filter(|a| root.is_ancestor_of(a))
                    .filter(|a| !self.collections.contains_key(a))
                    .collect();
                missing.reverse();
                missing.push(path);
                for p in missing {
                    self.require_vacant(&p)?;
                    let id = self.allocate_id();
                    self.collections.insert(
                        p,
                        CollectionEntry {
                            id,
                            permission: permission.clone(),
                        },
                    );
                }
                Ok(())
            }
            StoreOp::StoreXml {
                path,
                content,
                mime_type,
                permission,
            } => self.put_document(path, ResourceKind::Xml, content, mime_type, permission),
            StoreOp::StoreBinary {
                path,
                content,
                mime_type,
                permission,
            } => self.put_document(path, ResourceKind::Binary, content, mime_type, permission),
            StoreOp::RemoveXml { path } => self.remove_document(&path, ResourceKind::Xml),
            StoreOp::RemoveBinary { path } => self.remove_document(&path, ResourceKind::Binary),
            StoreOp::RemoveCollection { path } => {
                if path == *root {
                    return Err(StoreError::InvalidPath {
                        path: path.to_string(),
                        reason: "the root collection cannot be removed".to_string(),
                    });
                }
                self.require_collection(&path)?;
                self.collections
                    .retain(|p, _| *p != path && !path.is_ancestor_of(p));
                self.documents.retain(|p, _| !path.is_ancestor_of(p));
                Ok(())
            }
            StoreOp::MoveDocument { from, to } => self.relocate_document(from, to, false),
            StoreOp::CopyDocument { from, to } => self.relocate_document(from, to, true),
            StoreOp::MoveCollection { from, to } => self.relocate_collection(root, from, to, false),
            StoreOp::CopyCollection { from, to } => self.relocate_collection(root, from, to, true),
        }
    }

    fn put_document(
        &mut self,
        path: DocPath,
        kind: ResourceKind,
        content: Bytes,
        mime_type: String,
        permission: Permission,
    ) -> Result<(), StoreError> {
        self.require_collection(&Self::parent_of(&path)?)?;
        if self.collections.contains_key(&path) {
            return Err(StoreError::AlreadyExists {
                path: path.to_string(),
            });
        }
        let id = match self.documents.get(&path) {
            Some(existing) => existing.id,
            None => self.allocate_id(),
        };
        self.documents.insert(
            path,
            DocumentEntry {
                id,
                kind,
                mime_type,
                content,
                permission,
            },
        );
        Ok(())
    }

    fn remove_document(&mut self, path: &DocPath, expected: ResourceKind) -> Result<(), StoreError> {
        let entry = self.documents.get(path).ok_or_else(|| StoreError::NotFound {
            path: path.to_string(),
        })?;
        if entry.kind != expected {
            return Err(StoreError::KindMismatch {
                path: path.to_string(),
                expected: expected.to_string(),
                actual: entry.kind.to_string(),
            });
        }
        self.documents.remove(path);
        Ok(())
    }

    fn relocate_document(&mut self, from: DocPath, to: DocPath, copy: bool) -> Result<(), StoreError> {
        let entry = self
            .documents
            .get(&from)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: from.to_string(),
            })?;
        self.require_collection(&Self::parent_of(&to)?)?;
        if self.collections.contains_key(&to) {
            return Err(StoreError::AlreadyExists {
                path: to.to_string(),
            });
        }
        if from == to {
            return Ok(());
        }
        let entry = if copy {
            DocumentEntry {
                id: self.allocate_id(),
                ..entry
            }
        } else {
            self.documents.remove(&from);
            entry
        };
        self.documents.insert(to, entry);
        Ok(())
    }

    fn relocate_collection(
        &mut self,
        root: &DocPath,
        from: DocPath,
        to: DocPath,
        copy: bool,
    ) -> Result<(), StoreError> {
        let invalid = || StoreError::InvalidRelocation {
            from: from.to_string(),
            to: to.to_string(),
        };
        if from == *root || from == to || from.is_ancestor_of(&to) {
            return Err(invalid());
        }
        self.require_collection(&from)?;
        self.require_collection(&Self::parent_of(&to)?)?;
        self.require_vacant(&to)?;

        let collections: Vec<(DocPath, CollectionEntry)> = self
            .collections
            .iter()
            .filter(|(p, _)| **p == from || from.is_ancestor_of(p))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        let documents: Vec<(DocPath, DocumentEntry)> = self
            .documents
            .iter()
            .filter(|(p, _)| from.is_ancestor_of(p))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();

        if !copy {
            self.collections
                .retain(|p, _| *p != from && !from.is_ancestor_of(p));
            self.documents.retain(|p, _| !from.is_ancestor_of(p));
        }
        for (p, mut entry) in collections {
            let target = p.rebase(&from, &to).ok_or_else(invalid)?;
            if copy {
                entry.id = self.allocate_id();
            }
            self.collections.insert(target, entry);
        }
        for (p, mut entry) in documents {
            let target = p.rebase(&from, &to).ok_or_else(invalid)?;
            if copy {
                entry.id = self.allocate_id();
            }
            self.documents.insert(target, entry);
        }
        Ok(())
    }
}

/// In-memory [`Store`] rooted at `/db`.
#[derive(Debug)]
pub struct MemoryStore {
    root: DocPath,
    data: RwLock<StoreData>,
    locks: LockManager,
    next_txn: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl MemoryStore {
    /// Path of the default root collection.
    pub const ROOT: &'static str = "/db";

    /// Create a store holding only the root collection.
    pub fn new() -> Self {
        Self::with_root(DocPath::trusted(Self::ROOT))
    }

    /// Create a store with a custom root collection.
    pub fn with_root(root: DocPath) -> Self {
        let mut data = StoreData::default();
        let id = data.allocate_id();
        data.collections.insert(
            root.clone(),
            CollectionEntry {
                id,
                permission: Permission::collection_default(SYSTEM_ACCOUNT, SYSTEM_GROUP),
            },
        );
        Self {
            root,
            data: RwLock::new(data),
            locks: LockManager::new(),
            next_txn: AtomicU64::new(1),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    /// The lock manager, for inspection in tests and diagnostics.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of aborted transactions.
    pub fn abort_count(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Total number of collections, root included.
    pub fn collection_count(&self) -> usize {
        self.read().collections.len()
    }

    /// Total number of documents.
    pub fn document_count(&self) -> usize {
        self.read().documents.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn root(&self) -> DocPath {
        self.root.clone()
    }

    fn lock(&self, paths: &[DocPath]) -> LockGuard {
        self.locks.lock(paths)
    }

    fn begin(&self, origin: &str) -> Txn {
        let id = TxnId::new(self.next_txn.fetch_add(1, Ordering::Relaxed));
        debug!(txn = %id, origin, "transaction started");
        Txn::new(id, origin)
    }

    fn commit(&self, mut txn: Txn) -> Result<(), StoreError> {
        if txn.state() != TxnState::Active {
            return Err(StoreError::TxnClosed {
                txn: txn.id().as_u64(),
            });
        }
        let mut data = self.data.write().map_err(|e| StoreError::Poisoned {
            msg: e.to_string(),
        })?;
        let mut working = data.clone();
        for op in txn.ops().to_vec() {
            if let Err(e) = working.apply(&self.root, op) {
                warn!(txn = %txn.id(), origin = txn.origin(), error = %e, "commit rejected");
                txn.finish(TxnState::Aborted);
                self.aborts.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        *data = working;
        txn.finish(TxnState::Committed);
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %txn.id(), origin = txn.origin(), ops = txn.ops().len(), "transaction committed");
        Ok(())
    }

    fn abort(&self, mut txn: Txn) {
        if txn.state() == TxnState::Active {
            txn.finish(TxnState::Aborted);
            self.aborts.fetch_add(1, Ordering::Relaxed);
            debug!(txn = %txn.id(), origin = txn.origin(), "transaction aborted");
        }
    }

    fn collection(&self, path: &DocPath) -> Option<CollectionInfo> {
        self.read().collections.get(path).map(|e| CollectionInfo {
            id: e.id,
            path: path.clone(),
            permission: e.permission.clone(),
        })
    }

    fn document(&self, path: &DocPath) -> Option<DocumentInfo> {
        self.read().documents.get(path).map(|e| DocumentInfo {
            id: e.id,
            path: path.clone(),
            kind: e.kind,
            mime_type: e.mime_type.clone(),
            permission: e.permission.clone(),
            size: e.content.len(),
        })
    }

    fn read_document(&self, path: &DocPath) -> Option<Bytes> {
        self.read().documents.get(path).map(|e| e.content.clone())
    }

    fn list(&self, collection: &DocPath) -> Vec<DocPath> {
        let data = self.read();
        let is_child = |p: &DocPath| p.parent().as_ref() == Some(collection);
        data.collections
            .keys()
            .filter(|p| is_child(p))
            .chain(data.documents.keys().filter(|p| is_child(p)))
            .cloned()
            .collect()
    }

    fn validate_xml(&self, path: &DocPath, source: &mut dyn Read) -> Result<(), StoreError> {
        let mut raw = Vec::new();
        source.read_to_end(&mut raw)?;
        check_well_formed(&raw).map_err(|msg| StoreError::Validation {
            path: path.to_string(),
            msg,
        })
    }
}

/// Minimal well-formedness check: UTF-8, a single root element, balanced tags.
fn check_well_formed(raw: &[u8]) -> Result<(), String> {
    let text = std::str::from_utf8(raw).map_err(|e| format!("not UTF-8: {}", e))?;
    let text = text.trim_start_matches('\u{feff}');
    let mut stack: Vec<&str> = Vec::new();
    let mut roots = 0usize;
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        let before = &rest[..start];
        if stack.is_empty() && !before.trim().is_empty() {
            return Err("text outside the root element".to_string());
        }
        rest = &rest[start..];

        let skip = |rest: &str, open: &str, close: &str| -> Result<usize, String> {
            rest.find(close)
                .map(|i| i + close.len())
                .ok_or_else(|| format!("unterminated {}", open))
        };
        if rest.starts_with("<?") {
            rest = &rest[skip(rest, "<?", "?>")?..];
            continue;
        }
        if rest.starts_with("<!--") {
            rest = &rest[skip(rest, "<!--", "-->")?..];
            continue;
        }
        if rest.starts_with("<![CDATA[") {
            if stack.is_empty() {
                return Err("CDATA outside the root element".to_string());
            }
            rest = &rest[skip(rest, "<![CDATA[", "]]>")?..];
            continue;
        }
        if rest.starts_with("<!") {
            rest = &rest[skip(rest, "<!", ">")?..];
            continue;
        }

        let mut quote: Option<char> = None;
        let mut end = None;
        for (i, c) in rest.char_indices().skip(1) {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => quote = Some(c),
                (None, '>') => {
                    end = Some(i);
                    break;
                }
                (None, '<') => return Err("unexpected '<' inside tag".to_string()),
                _ => {}
            }
        }
        let end = end.ok_or_else(|| "unterminated tag".to_string())?;
        let tag = &rest[1..end];
        rest = &rest[end + 1..];

        if let Some(name) = tag.strip_prefix('/') {
            let name = name.trim();
            match stack.pop() {
                Some(open) if open == name => {}
                Some(open) => return Err(format!("</{}> closes <{}>", name, open)),
                None => return Err(format!("unmatched </{}>", name)),
            }
            continue;
        }
        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .ok_or_else(|| "empty tag".to_string())?;
        if stack.is_empty() {
            roots += 1;
            if roots > 1 {
                return Err("more than one root element".to_string());
            }
        }
        if !self_closing {
            stack.push(name);
        }
    }

    if !rest.trim().is_empty() && stack.is_empty() {
        return Err("text outside the root element".to_string());
    }
    if let Some(open) = stack.pop() {
        return Err(format!("unclosed <{}>", open));
    }
    if roots == 0 {
        return Err("no root element".to_string());
    }
    Ok(())
}
