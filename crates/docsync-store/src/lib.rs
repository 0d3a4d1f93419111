#![warn(missing_docs)]

//! docsync store subsystem: hierarchical collections and documents, per-collection
//! write locks, staged transactions, principals and mime types.

pub mod error;
pub mod lock;
pub mod mime;
pub mod path;
pub mod security;
pub mod store;
pub mod txn;

pub use error::StoreError;
pub use lock::{LockGuard, LockManager};
pub use mime::{MimeTable, MimeType};
pub use path::DocPath;
pub use security::{Account, Group, MemorySecurity, SecurityManager};
pub use store::{CollectionInfo, DocumentInfo, MemoryStore, Permission, ResourceId, ResourceKind, Store};
pub use txn::{StoreOp, Txn, TxnId, TxnState};
