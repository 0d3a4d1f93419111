//! Transport message model: headers, typed properties and body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::TransportError;

/// Priority a message gets when the producer sets none.
pub const DEFAULT_PRIORITY: u8 = 4;
/// Highest valid priority.
pub const MAX_PRIORITY: u8 = 9;

/// A scalar property value.
///
/// Only string, int, double, bool and float travel as message properties;
/// the other variants exist in application property maps and are dropped
/// when copied onto a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// UTF-8 string.
    String(String),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// 32-bit float.
    Float(f32),
    /// Raw bytes (not a wire property type).
    Bytes(Vec<u8>),
    /// A sequence of values (not a wire property type).
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// True for the types a message property can carry.
    pub fn is_wire_type(&self) -> bool {
        matches!(
            self,
            PropertyValue::String(_)
                | PropertyValue::Int(_)
                | PropertyValue::Double(_)
                | PropertyValue::Bool(_)
                | PropertyValue::Float(_)
        )
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Int(_) => "int",
            PropertyValue::Double(_) => "double",
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Float(_) => "float",
            PropertyValue::Bytes(_) => "bytes",
            PropertyValue::List(_) => "list",
        }
    }

    /// The string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer value, if this is an int.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The boolean value, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Double(d) => write!(f, "{}", d),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            PropertyValue::List(items) => write!(f, "<{} items>", items.len()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        PropertyValue::Bytes(v)
    }
}

/// Case-sensitive, key-ordered property map; setting an existing key replaces it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageProperties(BTreeMap<String, PropertyValue>);

impl MessageProperties {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Get a property.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Get a string property; `None` if absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_str)
    }

    /// Get an int property; `None` if absent or not an int.
    pub fn get_int(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(PropertyValue::as_int)
    }

    /// Remove a property.
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    /// True if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every entry of `other` over this map.
    pub fn merge(&mut self, other: &MessageProperties) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for MessageProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for MessageProperties {
    type Item = (String, PropertyValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, PropertyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A boxed scalar carried by an object message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ObjectValue {
    /// Arbitrary-size integer, kept within 64 bits here.
    Integer(i64),
    /// Decimal in its lexical form to keep precision.
    Decimal(String),
    /// 64-bit float.
    Double(f64),
    /// 32-bit float.
    Float(f32),
    /// Boolean.
    Boolean(bool),
}

/// Message payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// No body.
    Empty,
    /// Opaque bytes.
    Bytes(Bytes),
    /// Text.
    Text(String),
    /// A boxed scalar.
    Object(ObjectValue),
}

impl MessageBody {
    /// Shape name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Empty => "empty",
            MessageBody::Bytes(_) => "bytes",
            MessageBody::Text(_) => "text",
            MessageBody::Object(_) => "object",
        }
    }
}

/// Persistence requested for a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// May be lost if the broker restarts.
    NonPersistent,
    /// Survives broker restarts.
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// Numeric code as used on the wire (1 = non-persistent, 2 = persistent).
    pub fn code(&self) -> i32 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// A transport message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-assigned id, set on send.
    pub id: Option<String>,
    /// Application correlation id.
    pub correlation_id: Option<String>,
    /// Application message type.
    pub message_type: Option<String>,
    /// Destination the message was sent to.
    pub destination: Option<String>,
    /// Send time (ms since epoch), set on send.
    pub timestamp_ms: u64,
    /// Expiry time (ms since epoch); 0 means never.
    pub expiration_ms: u64,
    /// Priority 0..=9.
    pub priority: u8,
    /// Requested persistence.
    pub delivery_mode: DeliveryMode,
    /// True if this is not the first delivery attempt.
    pub redelivered: bool,
    /// Number of delivery attempts so far.
    pub delivery_count: u32,
    /// Application and protocol properties.
    pub properties: MessageProperties,
    /// Payload.
    pub body: MessageBody,
}

impl Message {
    fn with_body(body: MessageBody) -> Self {
        Self {
            id: None,
            correlation_id: None,
            message_type: None,
            destination: None,
            timestamp_ms: 0,
            expiration_ms: 0,
            priority: DEFAULT_PRIORITY,
            delivery_mode: DeliveryMode::default(),
            redelivered: false,
            delivery_count: 0,
            properties: MessageProperties::new(),
            body,
        }
    }

    /// A bytes message.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::with_body(MessageBody::Bytes(data.into()))
    }

    /// A text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Text(text.into()))
    }

    /// An object message.
    pub fn object(value: ObjectValue) -> Self {
        Self::with_body(MessageBody::Object(value))
    }

    /// A message without body.
    pub fn empty() -> Self {
        Self::with_body(MessageBody::Empty)
    }

    /// Set a typed property, rejecting value types that cannot travel on the wire.
    pub fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), TransportError> {
        if !value.is_wire_type() {
            return Err(TransportError::InvalidProperty {
                key: key.to_string(),
                type_name: value.type_name().to_string(),
            });
        }
        self.properties.set(key, value);
        Ok(())
    }

    /// A string property.
    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get_str(key)
    }

    /// Body length in bytes for bytes and text bodies.
    pub fn body_length(&self) -> Option<usize> {
        match &self.body {
            MessageBody::Bytes(b) => Some(b.len()),
            MessageBody::Text(t) => Some(t.len()),
            MessageBody::Empty => Some(0),
            MessageBody::Object(_) => None,
        }
    }

    /// True if the message has expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_ms != 0 && now_ms > self.expiration_ms
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire.
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        Ok(bincode::deserialize(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod properties {
        use super::*;

        #[test]
        fn test_last_write_wins() {
            let mut props = MessageProperties::new();
            props.set("k", "a");
            let old = props.set("k", 7);
            assert_eq!(old, Some(PropertyValue::String("a".to_string())));
            assert_eq!(props.get_int("k"), Some(7));
            assert_eq!(props.len(), 1);
        }

        #[test]
        fn test_keys_are_case_sensitive() {
            let mut props = MessageProperties::new();
            props.set("Key", "a");
            props.set("key", "b");
            assert_eq!(props.len(), 2);
            assert_eq!(props.get_str("Key"), Some("a"));
        }

        #[test]
        fn test_typed_getters_reject_other_types() {
            let props: MessageProperties = [("n", PropertyValue::Int(1))].into_iter().collect();
            assert_eq!(props.get_str("n"), None);
            assert_eq!(props.get_int("missing"), None);
        }

        #[test]
        fn test_merge_overwrites() {
            let mut a: MessageProperties = [("x", "1"), ("y", "2")].into_iter().collect();
            let b: MessageProperties = [("y", "3")].into_iter().collect();
            a.merge(&b);
            assert_eq!(a.get_str("x"), Some("1"));
            assert_eq!(a.get_str("y"), Some("3"));
        }
    }

    mod message {
        use super::*;

        #[test]
        fn test_set_property_rejects_non_wire_types() {
            let mut msg = Message::text("hi");
            assert!(msg.set_property("ok", PropertyValue::Float(1.5)).is_ok());
            let err = msg
                .set_property("bad", PropertyValue::Bytes(vec![1]))
                .unwrap_err();
            assert!(matches!(err, TransportError::InvalidProperty { .. }));
            assert!(!msg.properties.contains_key("bad"));
        }

        #[test]
        fn test_defaults() {
            let msg = Message::bytes(vec![1u8, 2, 3]);
            assert_eq!(msg.priority, DEFAULT_PRIORITY);
            assert_eq!(msg.delivery_mode, DeliveryMode::Persistent);
            assert_eq!(msg.body_length(), Some(3));
            assert!(msg.id.is_none());
        }

        #[test]
        fn test_expiry() {
            let mut msg = Message::empty();
            assert!(!msg.is_expired(u64::MAX));
            msg.expiration_ms = 100;
            assert!(!msg.is_expired(100));
            assert!(msg.is_expired(101));
        }

        #[test]
        fn test_wire_codec_preserves_body_and_properties() {
            let mut msg = Message::object(ObjectValue::Decimal("1.50".to_string()));
            msg.properties.set("a", true);
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }

        #[test]
        fn test_decode_garbage_fails() {
            assert!(matches!(
                Message::decode(&[0xff, 0xff, 0xff]),
                Err(TransportError::Codec(_))
            ));
        }
    }
}
