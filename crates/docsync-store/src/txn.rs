//! Staged store transactions.
//!
//! A [`Txn`] collects mutations; nothing touches the store until
//! [`Store::commit`](crate::store::Store::commit) applies the whole set
//! atomically. Dropping a transaction that was neither committed nor aborted
//! discards it.

use bytes::Bytes;
use std::fmt;
use tracing::debug;

use crate::path::DocPath;
use crate::store::Permission;

/// Unique identifier of a transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxnId(u64);

impl TxnId {
    /// Creates a transaction ID from a raw value.
    pub fn new(id: u64) -> Self {
        TxnId(id)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Applied to the store.
    Committed,
    /// Discarded.
    Aborted,
}

/// One staged mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOp {
    /// Create a collection; missing ancestors are created with the same permission.
    CreateCollection {
        /// Collection path.
        path: DocPath,
        /// Permission for the new collection(s).
        permission: Permission,
    },
    /// Store (or replace) an XML document.
    StoreXml {
        /// Document path.
        path: DocPath,
        /// Validated document content.
        content: Bytes,
        /// Mime type recorded on the document.
        mime_type: String,
        /// Permission for the document.
        permission: Permission,
    },
    /// Store (or replace) a binary document.
    StoreBinary {
        /// Document path.
        path: DocPath,
        /// Raw content.
        content: Bytes,
        /// Mime type recorded on the document.
        mime_type: String,
        /// Permission for the document.
        permission: Permission,
    },
    /// Remove an XML document.
    RemoveXml {
        /// Document path.
        path: DocPath,
    },
    /// Remove a binary document.
    RemoveBinary {
        /// Document path.
        path: DocPath,
    },
    /// Remove a collection and everything beneath it.
    RemoveCollection {
        /// Collection path.
        path: DocPath,
    },
    /// Move a document, keeping its identity and permission.
    MoveDocument {
        /// Current path.
        from: DocPath,
        /// New path.
        to: DocPath,
    },
    /// Copy a document, keeping its permission.
    CopyDocument {
        /// Source path.
        from: DocPath,
        /// Copy path.
        to: DocPath,
    },
    /// Move a collection subtree, keeping identities and permissions.
    MoveCollection {
        /// Current path.
        from: DocPath,
        /// New path.
        to: DocPath,
    },
    /// Copy a collection subtree, keeping permissions.
    CopyCollection {
        /// Source path.
        from: DocPath,
        /// Copy path.
        to: DocPath,
    },
}

/// A transaction in progress.
#[derive(Debug)]
pub struct Txn {
    id: TxnId,
    origin: String,
    ops: Vec<StoreOp>,
    state: TxnState,
}

impl Txn {
    /// Start an empty transaction tagged with `origin` for diagnostics.
    pub fn new(id: TxnId, origin: impl Into<String>) -> Self {
        Self {
            id,
            origin: origin.into(),
            ops: Vec::new(),
            state: TxnState::Active,
        }
    }

    /// Transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Diagnostic origin tag.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Staged operations, in order.
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// True if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Stage an arbitrary operation.
    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    /// Stage collection creation.
    pub fn create_collection(&mut self, path: DocPath, permission: Permission) {
        self.push(StoreOp::CreateCollection { path, permission });
    }

    /// Stage an XML document write.
    pub fn store_xml(&mut self, path: DocPath, content: Bytes, mime_type: &str, permission: Permission) {
        self.push(StoreOp::StoreXml {
            path,
            content,
            mime_type: mime_type.to_string(),
            permission,
        });
    }

    /// Stage a binary document write.
    pub fn store_binary(
        &mut self,
        path: DocPath,
        content: Bytes,
        mime_type: &str,
        permission: Permission,
    ) {
        self.push(StoreOp::StoreBinary {
            path,
            content,
            mime_type: mime_type.to_string(),
            permission,
        });
    }

    /// Stage XML document removal.
    pub fn remove_xml(&mut self, path: DocPath) {
        self.push(StoreOp::RemoveXml { path });
    }

    /// Stage binary document removal.
    pub fn remove_binary(&mut self, path: DocPath) {
        self.push(StoreOp::RemoveBinary { path });
    }

    /// Stage recursive collection removal.
    pub fn remove_collection(&mut self, path: DocPath) {
        self.push(StoreOp::RemoveCollection { path });
    }

    /// Stage a document move.
    pub fn move_document(&mut self, from: DocPath, to: DocPath) {
        self.push(StoreOp::MoveDocument { from, to });
    }

    /// Stage a document copy.
    pub fn copy_document(&mut self, from: DocPath, to: DocPath) {
        self.push(StoreOp::CopyDocument { from, to });
    }

    /// Stage a collection move.
    pub fn move_collection(&mut self, from: DocPath, to: DocPath) {
        self.push(StoreOp::MoveCollection { from, to });
    }

    /// Stage a collection copy.
    pub fn copy_collection(&mut self, from: DocPath, to: DocPath) {
        self.push(StoreOp::CopyCollection { from, to });
    }

    pub(crate) fn finish(&mut self, state: TxnState) {
        self.state = state;
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            debug!(
                txn = %self.id,
                origin = %self.origin,
                staged = self.ops.len(),
                "closing unfinished transaction, staged operations discarded"
            );
            self.state = TxnState::Aborted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DocPath {
        DocPath::parse(s).unwrap()
    }

    #[test]
    fn test_new_txn_is_active_and_empty() {
        let txn = Txn::new(TxnId::new(7), "test");
        assert_eq!(txn.state(), TxnState::Active);
        assert!(txn.is_empty());
        assert_eq!(txn.origin(), "test");
        assert_eq!(txn.id().to_string(), "txn-7");
    }

    #[test]
    fn test_ops_are_staged_in_order() {
        let mut txn = Txn::new(TxnId::new(1), "test");
        txn.create_collection(p("/db/a"), Permission::collection_default("u", "g"));
        txn.remove_collection(p("/db/b"));
        txn.move_document(p("/db/a/x.xml"), p("/db/c/x.xml"));
        assert_eq!(txn.ops().len(), 3);
        assert!(matches!(txn.ops()[1], StoreOp::RemoveCollection { .. }));
    }
}
