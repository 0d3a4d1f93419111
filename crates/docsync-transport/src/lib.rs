#![warn(missing_docs)]

//! docsync transport subsystem: message model, publish/subscribe traits and an
//! in-process broker used for tests and single-host deployments.

pub mod error;
pub mod memory;
pub mod message;
pub mod transport;

pub use error::TransportError;
pub use memory::{BrokerConfig, BrokerStats, MemoryBroker, MemoryConnection, MEMORY_CONTEXT_FACTORY};
pub use message::{DeliveryMode, Message, MessageBody, MessageProperties, ObjectValue, PropertyValue};
pub use transport::{
    Connection, Credentials, Endpoint, FactoryRef, MessageListener, Producer, SubscribeOptions,
    Subscription, Transport,
};
