#![warn(missing_docs)]

//! docsync replication subsystem: replication envelopes over pub/sub, the sending
//! side, and the transactional apply engine on the receiving side.

pub mod apply;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod listener;
pub mod report;
pub mod sender;

pub use apply::{ApplyOutcome, Applier, SkipReason};
pub use config::TransportConfig;
pub use dispatch::{DispatchTable, Handler};
pub use envelope::{keys, Envelope, Operation, PayloadCompression, ResourceType};
pub use error::{ErrorCode, ReplError, Result};
pub use identity::Identity;
pub use listener::{Disposition, Receiver, ReplicationListener};
pub use report::{DeliveryReport, Report, ReportSnapshot};
pub use sender::{ConfiguredSender, Item, MessageSender, Sender};
