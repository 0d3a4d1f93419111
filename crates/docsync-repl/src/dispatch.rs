//! Mapping from (resource type, operation) to the handler that applies it.

use std::collections::HashMap;
use std::fmt;

use crate::envelope::{Operation, ResourceType};
use crate::error::{ReplError, Result};

/// A transactional apply handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Handler {
    /// Create or replace a document.
    StoreDocument,
    /// Update document metadata.
    UpdateDocumentMetadata,
    /// Remove a document.
    DeleteDocument,
    /// Move or copy a document.
    RelocateDocument {
        /// Copy instead of move.
        copy: bool,
    },
    /// Create a collection.
    CreateCollection,
    /// Remove a collection subtree.
    DeleteCollection,
    /// Move or copy a collection subtree.
    RelocateCollection {
        /// Copy instead of move.
        copy: bool,
    },
}

impl Handler {
    /// Name used as transaction origin and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Handler::StoreDocument => "store-document",
            Handler::UpdateDocumentMetadata => "update-document-metadata",
            Handler::DeleteDocument => "delete-document",
            Handler::RelocateDocument { copy: false } => "move-document",
            Handler::RelocateDocument { copy: true } => "copy-document",
            Handler::CreateCollection => "create-collection",
            Handler::DeleteCollection => "delete-collection",
            Handler::RelocateCollection { copy: false } => "move-collection",
            Handler::RelocateCollection { copy: true } => "copy-collection",
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dispatch matrix.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    entries: HashMap<(ResourceType, Operation), Handler>,
}

impl DispatchTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The replication matrix: create and update share a handler per resource
    /// type; collections have no metadata handler.
    pub fn standard() -> Self {
        use Operation::*;
        use ResourceType::*;

        let mut table = Self::empty();
        table.register(Document, Create, Handler::StoreDocument);
        table.register(Document, Update, Handler::StoreDocument);
        table.register(Document, Metadata, Handler::UpdateDocumentMetadata);
        table.register(Document, Delete, Handler::DeleteDocument);
        table.register(Document, Move, Handler::RelocateDocument { copy: false });
        table.register(Document, Copy, Handler::RelocateDocument { copy: true });
        table.register(Collection, Create, Handler::CreateCollection);
        table.register(Collection, Update, Handler::CreateCollection);
        table.register(Collection, Delete, Handler::DeleteCollection);
        table.register(Collection, Move, Handler::RelocateCollection { copy: false });
        table.register(Collection, Copy, Handler::RelocateCollection { copy: true });
        table
    }

    /// Add or replace an entry, returning the previous handler.
    pub fn register(
        &mut self,
        resource_type: ResourceType,
        operation: Operation,
        handler: Handler,
    ) -> Option<Handler> {
        self.entries.insert((resource_type, operation), handler)
    }

    /// Find the handler for a pair.
    pub fn lookup(&self, resource_type: ResourceType, operation: Operation) -> Result<Handler> {
        if let Some(handler) = self.entries.get(&(resource_type, operation)) {
            return Ok(*handler);
        }
        if self.entries.keys().any(|(rt, _)| *rt == resource_type) {
            Err(ReplError::UnknownOperation {
                resource_type: resource_type.to_string(),
                operation: operation.to_string(),
            })
        } else {
            Err(ReplError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            })
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
