//! Publishing values and envelopes.
//!
//! Every send opens its own connection and producer and closes both before
//! returning, whatever the outcome.

use async_trait::async_trait;
use bytes::Bytes;
use docsync_transport::{
    Connection, Message, MessageProperties, ObjectValue, Producer, Transport,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::envelope::{gzip, keys, Envelope, PayloadCompression};
use crate::error::{ErrorCode, ReplError, Result};
use crate::identity::Identity;
use crate::report::DeliveryReport;

/// A value to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Serialized structured content (an element or document).
    Node {
        /// Serialized content.
        content: Bytes,
        /// URI of the owning document, if any.
        document_uri: Option<String>,
        /// Mime type of the owning document, if any.
        mime_type: Option<String>,
    },
    /// Binary content.
    Binary {
        /// Raw bytes.
        data: Bytes,
        /// Origin URI, if any.
        uri: Option<String>,
    },
    /// A string.
    Text(String),
    /// An integer.
    Integer(i64),
    /// A decimal in lexical form.
    Decimal(String),
    /// A double.
    Double(f64),
    /// A float.
    Float(f32),
    /// A boolean.
    Boolean(bool),
    /// A pre-built replication envelope.
    Envelope(Envelope),
    /// Any other atomic value; cannot be sent.
    Atomic {
        /// Type name of the value.
        type_name: String,
        /// Lexical form.
        lexical: String,
    },
}

impl Item {
    /// Type name recorded in [`keys::XPATH_DATATYPE`].
    pub fn type_name(&self) -> &str {
        match self {
            Item::Node { .. } => "document-node()",
            Item::Binary { .. } => "xs:base64Binary",
            Item::Text(_) => "xs:string",
            Item::Integer(_) => "xs:integer",
            Item::Decimal(_) => "xs:decimal",
            Item::Double(_) => "xs:double",
            Item::Float(_) => "xs:float",
            Item::Boolean(_) => "xs:boolean",
            Item::Envelope(_) => "envelope",
            Item::Atomic { type_name, .. } => type_name.as_str(),
        }
    }
}

/// Publishes items through a [`Transport`].
#[derive(Clone)]
pub struct Sender {
    transport: Arc<dyn Transport>,
    identity: Identity,
    principal: Option<String>,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("identity", &self.identity)
            .field("principal", &self.principal)
            .finish()
    }
}

impl Sender {
    /// A sender stamping messages with `identity`.
    pub fn new(transport: Arc<dyn Transport>, identity: Identity) -> Self {
        Self {
            transport,
            identity,
            principal: None,
        }
    }

    /// Record `username` as the acting user on every message.
    pub fn with_principal(mut self, username: impl Into<String>) -> Self {
        self.principal = Some(username.into());
        self
    }

    /// Identity stamped on outgoing messages.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Convert `item` into a message carrying `properties` and publish it.
    pub async fn send(
        &self,
        config: &TransportConfig,
        properties: &MessageProperties,
        item: Item,
    ) -> Result<DeliveryReport> {
        config.validate()?;

        let mut props = properties.clone();
        if self.identity.is_empty() {
            error!(key = keys::INSTANCE_ID, "empty instance identity, message sent without it");
        } else {
            props.set(keys::INSTANCE_ID, self.identity.as_str());
        }
        if let Some(user) = &self.principal {
            props.set(keys::USER, user.as_str());
        }

        let endpoint = config.to_endpoint();
        let connection = self.transport.connect(&endpoint).await.map_err(|e| {
            error!(broker = %endpoint.broker_url, factory = %endpoint.factory, error = %e, "connect failed");
            ReplError::from(e)
        })?;

        let result = publish_on(connection.as_ref(), config, props, item).await;
        if let Err(e) = connection.close().await {
            warn!(connection = connection.id(), error = %e, "closing connection failed");
        }

        match &result {
            Ok(report) => info!(
                message_id = ?report.message_id,
                destination = %report.destination,
                "message sent"
            ),
            Err(e) => error!(destination = %config.destination, error = %e, "send failed"),
        }
        result
    }
}

async fn publish_on(
    connection: &dyn Connection,
    config: &TransportConfig,
    props: MessageProperties,
    item: Item,
) -> Result<DeliveryReport> {
    let mut producer = connection.create_producer(&config.destination).await?;
    let result = publish_with(producer.as_mut(), config, props, item).await;
    if let Err(e) = producer.close().await {
        warn!(destination = %config.destination, error = %e, "closing producer failed");
    }
    result
}

async fn publish_with(
    producer: &mut dyn Producer,
    config: &TransportConfig,
    mut props: MessageProperties,
    item: Item,
) -> Result<DeliveryReport> {
    let mut message = create_message(item, &mut props)?;
    copy_properties(&mut message, &props);

    if let Some(ttl) = config.time_to_live_ms {
        producer.set_time_to_live(ttl);
    }
    if let Some(priority) = config.priority {
        producer.set_priority(priority);
    }
    if let Some(mode) = config.delivery_mode {
        producer.set_delivery_mode(mode);
    }

    producer.send(&mut message).await?;
    if message.id.is_none() {
        return Err(ReplError::Transport {
            code: ErrorCode::Transport,
            msg: "broker did not assign a message id".to_string(),
        });
    }

    let endpoint = config.to_endpoint();
    Ok(DeliveryReport {
        message_id: message.id,
        correlation_id: message.correlation_id,
        message_type: message.message_type,
        time_to_live_ms: producer.time_to_live(),
        priority: producer.priority(),
        delivery_mode: producer.delivery_mode().code(),
        context_factory: endpoint.context_factory,
        broker_url: endpoint.broker_url,
        connection_factory: endpoint.factory.to_string(),
        destination: producer.destination().to_string(),
        username: config.username.clone(),
    })
}

/// Build the message body for `item`, adding the item's reserved properties to `props`.
fn create_message(item: Item, props: &mut MessageProperties) -> Result<Message> {
    if !matches!(item, Item::Envelope(_)) {
        props.set(keys::XPATH_DATATYPE, item.type_name());
    }
    let message = match item {
        Item::Node {
            content,
            document_uri,
            mime_type,
        } => {
            props.set(keys::DATA_TYPE, "XML");
            if let Some(uri) = document_uri {
                props.set(keys::DOCUMENT_URI, uri);
            }
            if let Some(mime) = mime_type {
                props.set(keys::DOCUMENT_MIMETYPE, mime);
            }
            Message::bytes(encode_content(props, &content)?)
        }
        Item::Binary { data, uri } => {
            props.set(keys::DATA_TYPE, "BINARY");
            if let Some(uri) = uri {
                props.set(keys::DOCUMENT_URI, uri);
            }
            Message::bytes(encode_content(props, &data)?)
        }
        Item::Text(text) => Message::text(text),
        Item::Integer(v) => Message::object(ObjectValue::Integer(v)),
        Item::Decimal(v) => Message::object(ObjectValue::Decimal(v)),
        Item::Double(v) => Message::object(ObjectValue::Double(v)),
        Item::Float(v) => Message::object(ObjectValue::Float(v)),
        Item::Boolean(v) => Message::object(ObjectValue::Boolean(v)),
        Item::Envelope(envelope) => {
            envelope.validate()?;
            let mut merged = envelope.to_wire_properties();
            merged.merge(props);
            *props = merged;
            Message::bytes(envelope.payload.unwrap_or_default())
        }
        Item::Atomic { type_name, .. } => {
            return Err(ReplError::Conversion { item: type_name });
        }
    };
    Ok(message)
}

/// Apply the compression marker to `content`, defaulting it to gzip.
fn encode_content(props: &mut MessageProperties, content: &[u8]) -> Result<Bytes> {
    let compression = match props.get(keys::DOCUMENT_COMPRESSION) {
        None => {
            props.set(keys::DOCUMENT_COMPRESSION, PayloadCompression::Gzip.as_str());
            PayloadCompression::Gzip
        }
        Some(value) => match value.as_str().map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == PayloadCompression::Gzip.as_str() => PayloadCompression::Gzip,
            Some(v) if v == PayloadCompression::None.as_str() => PayloadCompression::None,
            _ => {
                warn!(marker = %value, "unknown compression marker, sending uncompressed");
                props.set(keys::DOCUMENT_COMPRESSION, PayloadCompression::None.as_str());
                PayloadCompression::None
            }
        },
    };
    Ok(match compression {
        PayloadCompression::Gzip => Bytes::from(gzip(content)?),
        PayloadCompression::None => Bytes::copy_from_slice(content),
    })
}

/// Copy every wire-typed property onto the message; other types are skipped.
fn copy_properties(message: &mut Message, props: &MessageProperties) {
    for (key, value) in props.iter() {
        if let Err(e) = message.set_property(key, value.clone()) {
            warn!(key = %key, error = %e, "property not sent");
        }
    }
    debug!(count = message.properties.len(), "message properties set");
}

/// Publishes envelopes with a fixed configuration.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Publish one envelope.
    async fn send_envelope(&self, envelope: Envelope) -> Result<DeliveryReport>;
}

/// [`MessageSender`] bound to one configuration and a set of extra properties.
#[derive(Debug, Clone)]
pub struct ConfiguredSender {
    sender: Sender,
    config: TransportConfig,
    properties: MessageProperties,
}

impl ConfiguredSender {
    /// Bind `sender` to `config`, which must be valid.
    pub fn new(sender: Sender, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sender,
            config,
            properties: MessageProperties::new(),
        })
    }

    /// Extra properties added to every message.
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// The bound configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSender for ConfiguredSender {
    async fn send_envelope(&self, envelope: Envelope) -> Result<DeliveryReport> {
        self.sender
            .send(&self.config, &self.properties, Item::Envelope(envelope))
            .await
    }
}
