//! Error types for the store subsystem.

use thiserror::Error;

/// Errors that can occur while reading or mutating the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path is not an absolute, well-formed hierarchical path.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The rejected path text.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The collection or document does not exist.
    #[error("resource not found: {path}")]
    NotFound {
        /// The missing resource path.
        path: String,
    },

    /// A resource already occupies the path.
    #[error("resource already exists: {path}")]
    AlreadyExists {
        /// The occupied path.
        path: String,
    },

    /// A move or copy would place a collection inside itself, or touches the root.
    #[error("invalid relocation from {from} to {to}")]
    InvalidRelocation {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },

    /// The removal call does not match the stored resource kind.
    #[error("resource {path} is {actual}, not {expected}")]
    KindMismatch {
        /// Resource path.
        path: String,
        /// Kind the caller asked to remove.
        expected: String,
        /// Kind actually stored.
        actual: String,
    },

    /// Structured content failed validation.
    #[error("XML validation failed for {path}: {msg}")]
    Validation {
        /// Document path.
        path: String,
        /// Validation failure details.
        msg: String,
    },

    /// The transaction was already committed or aborted.
    #[error("transaction {txn} is no longer active")]
    TxnClosed {
        /// Transaction identifier.
        txn: u64,
    },

    /// Internal lock was poisoned by a panicking writer.
    #[error("store lock poisoned: {msg}")]
    Poisoned {
        /// Description of the poisoned lock.
        msg: String,
    },

    /// I/O error while streaming content.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
