//! Error types for the replication subsystem.

use docsync_store::StoreError;
use docsync_transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, caller-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Anything not covered by a more specific code.
    Unexpected,
    /// Compression or stream I/O failed while building a message.
    Stream,
    /// The transport rejected the connection, producer or publish.
    Transport,
    /// The connection factory could not provide a connection.
    ConnectionFactory,
    /// A value could not be represented as a message.
    Conversion,
}

impl ErrorCode {
    /// The code as it appears in messages, e.g. `REPL004`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unexpected => "REPL000",
            ErrorCode::Stream => "REPL001",
            ErrorCode::Transport => "REPL004",
            ErrorCode::ConnectionFactory => "REPL026",
            ErrorCode::Conversion => "REPL027",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Transport configuration is invalid or incomplete.
    #[error("invalid configuration: {msg}")]
    Configuration {
        /// What is wrong.
        msg: String,
    },

    /// A value cannot be represented as a transport message.
    #[error("[REPL027] cannot convert {item} to a message")]
    Conversion {
        /// Kind of the rejected item.
        item: String,
    },

    /// Publishing failed at the transport layer.
    #[error("[{code}] {msg}")]
    Transport {
        /// Error code.
        code: ErrorCode,
        /// Message, including the root cause when the transport reports one.
        msg: String,
    },

    /// Stream I/O failed while building a message body.
    #[error("[REPL001] stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// Any other failure on the send path.
    #[error("[{code}] {msg}")]
    Unexpected {
        /// Error code.
        code: ErrorCode,
        /// Message.
        msg: String,
    },

    /// Inbound message is not a valid envelope.
    #[error("cannot decode envelope: {msg}")]
    EnvelopeDecode {
        /// What is wrong.
        msg: String,
    },

    /// Inbound message body is not bytes.
    #[error("unsupported message: expected a bytes message, got {kind}")]
    UnsupportedMessage {
        /// Shape of the rejected body.
        kind: String,
    },

    /// No handlers exist for the resource type.
    #[error("unknown resource type {resource_type}")]
    UnknownResourceType {
        /// The resource type.
        resource_type: String,
    },

    /// No handler exists for the operation on this resource type.
    #[error("unknown operation {operation} for resource type {resource_type}")]
    UnknownOperation {
        /// The resource type.
        resource_type: String,
        /// The operation.
        operation: String,
    },

    /// A store mutation failed; its transaction was aborted.
    #[error("apply failed in {origin}: {msg}")]
    Apply {
        /// Handler that failed.
        origin: String,
        /// Description of the failure.
        msg: String,
        /// Underlying store error, if any.
        #[source]
        source: Option<StoreError>,
    },
}

impl ReplError {
    /// Caller-facing code for send-side failures.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ReplError::Conversion { .. } => Some(ErrorCode::Conversion),
            ReplError::Transport { code, .. } | ReplError::Unexpected { code, .. } => Some(*code),
            ReplError::Stream(_) => Some(ErrorCode::Stream),
            _ => None,
        }
    }

    /// Wrap a store error raised inside handler `origin`.
    pub fn apply(origin: &str, err: StoreError) -> Self {
        ReplError::Apply {
            origin: origin.to_string(),
            msg: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<TransportError> for ReplError {
    fn from(err: TransportError) -> Self {
        match &err {
            TransportError::PoolExhausted { cause } => ReplError::Transport {
                code: ErrorCode::Transport,
                msg: cause.clone(),
            },
            TransportError::Lookup { .. } => ReplError::Transport {
                code: ErrorCode::ConnectionFactory,
                msg: err.to_string(),
            },
            TransportError::InvalidProperty { .. } | TransportError::Codec(_) => {
                ReplError::Unexpected {
                    code: ErrorCode::Unexpected,
                    msg: err.to_string(),
                }
            }
            _ => ReplError::Transport {
                code: ErrorCode::Transport,
                msg: err.to_string(),
            },
        }
    }
}

/// Result alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;
