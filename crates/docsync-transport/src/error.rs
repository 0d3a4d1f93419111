//! Error types for the transport subsystem.

use thiserror::Error;

/// Message the pooled connection factory reports when it cannot grow the pool.
pub const POOL_ADD_FAILED: &str = "Error while attempting to add new Connection to the pool";

/// Errors raised by connections, producers and subscriptions.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No broker answers at the URL.
    #[error("broker unreachable: {url}")]
    Unreachable {
        /// Broker URL that was tried.
        url: String,
    },

    /// A connection factory name or pool key did not resolve.
    #[error("lookup failed: {name}")]
    Lookup {
        /// The name that did not resolve.
        name: String,
    },

    /// The pooled factory could not add a connection; `cause` is the root cause.
    #[error("{}", POOL_ADD_FAILED)]
    PoolExhausted {
        /// Root cause reported by the pool.
        cause: String,
    },

    /// The broker refused the connection.
    #[error("connection refused: {msg}")]
    Refused {
        /// Refusal reason.
        msg: String,
    },

    /// Credentials were missing or wrong.
    #[error("authentication failed for user {user:?}")]
    Authentication {
        /// User name presented, if any.
        user: Option<String>,
    },

    /// Another open connection already uses the client id.
    #[error("client id already in use: {client_id}")]
    InvalidClientId {
        /// The duplicate client id.
        client_id: String,
    },

    /// Operation on a closed connection, producer or subscription.
    #[error("{what} is closed")]
    Closed {
        /// What was closed.
        what: String,
    },

    /// A property value type that cannot travel as a message property.
    #[error("property {key} has unsupported type {type_name}")]
    InvalidProperty {
        /// Property key.
        key: String,
        /// Name of the rejected value type.
        type_name: String,
    },

    /// Wire encoding or decoding failed.
    #[error("wire codec error")]
    Codec(#[from] bincode::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// The embedded root cause for failures that carry one.
    pub fn root_cause(&self) -> Option<&str> {
        match self {
            TransportError::PoolExhausted { cause } => Some(cause),
            _ => None,
        }
    }
}
