//! Replication envelopes and their wire form.
//!
//! An envelope travels as a bytes message: the payload is the body and every
//! other field is a message property under a reserved key (see [`keys`]).
//! Properties not known here are carried through untouched.

use bytes::Bytes;
use docsync_store::{DocPath, ResourceKind};
use docsync_transport::{Message, MessageBody, MessageProperties, PropertyValue};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::{ReplError, Result};

/// Reserved message property keys.
pub mod keys {
    /// Resource type, `DOCUMENT` or `COLLECTION`.
    pub const RESOURCE_TYPE: &str = "exist.resource.type";
    /// Operation, e.g. `CREATE`.
    pub const OPERATION: &str = "exist.resource.operation";
    /// Path of the affected resource.
    pub const SOURCE_PATH: &str = "exist.source.path";
    /// Target path of a move or copy.
    pub const DESTINATION_PATH: &str = "exist.destination.path";
    /// Identity of the sending instance.
    pub const INSTANCE_ID: &str = "exist.instance.id";
    /// Type name of the sent item.
    pub const XPATH_DATATYPE: &str = "exist.xpath.datatype";
    /// `XML` or `BINARY`.
    pub const DATA_TYPE: &str = "exist.data.type";
    /// Origin URI of a sent document.
    pub const DOCUMENT_URI: &str = "exist.document.uri";
    /// Mime type of a sent document.
    pub const DOCUMENT_MIMETYPE: &str = "exist.document.mimetype";
    /// Payload compression, `gzip` or `none`.
    pub const DOCUMENT_COMPRESSION: &str = "exist.document.compression";
    /// Owner account of the resource.
    pub const RESOURCE_OWNER: &str = "exist.resource.owner";
    /// Owner group of the resource.
    pub const RESOURCE_GROUP: &str = "exist.resource.group";
    /// Mode bits of the resource (int).
    pub const RESOURCE_MODE: &str = "exist.resource.mode";
    /// Mime type of the resource.
    pub const RESOURCE_MIMETYPE: &str = "exist.resource.mimetype";
    /// Account that sent the message.
    pub const USER: &str = "exist.user";
}

/// Kind of replicated resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// A document.
    Document,
    /// A collection.
    Collection,
}

impl ResourceType {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "DOCUMENT",
            ResourceType::Collection => "COLLECTION",
        }
    }
}

impl FromStr for ResourceType {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DOCUMENT" => Ok(ResourceType::Document),
            "COLLECTION" => Ok(ResourceType::Collection),
            _ => Err(ReplError::EnvelopeDecode {
                msg: format!("unknown resource type '{}'", s),
            }),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replicated operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Create a resource.
    Create,
    /// Replace a resource.
    Update,
    /// Remove a resource.
    Delete,
    /// Relocate a resource.
    Move,
    /// Duplicate a resource.
    Copy,
    /// Change resource metadata.
    Metadata,
}

impl Operation {
    /// Every operation.
    pub const ALL: [Operation; 6] = [
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Move,
        Operation::Copy,
        Operation::Metadata,
    ];

    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Move => "MOVE",
            Operation::Copy => "COPY",
            Operation::Metadata => "METADATA",
        }
    }

    /// True for operations that need a destination path.
    pub fn needs_destination(&self) -> bool {
        matches!(self, Operation::Move | Operation::Copy)
    }
}

impl FromStr for Operation {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == upper)
            .ok_or_else(|| ReplError::EnvelopeDecode {
                msg: format!("unknown operation '{}'", s),
            })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload compression marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadCompression {
    /// gzip stream.
    Gzip,
    /// Raw bytes.
    None,
}

impl PayloadCompression {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadCompression::Gzip => "gzip",
            PayloadCompression::None => "none",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" => Some(PayloadCompression::Gzip),
            "none" => Some(PayloadCompression::None),
            _ => None,
        }
    }
}

/// Wire value of [`keys::DATA_TYPE`] for a storage kind.
pub fn data_type_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Xml => "XML",
        ResourceKind::Binary => "BINARY",
    }
}

/// gzip-compress `data`.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

const STRUCTURAL_KEYS: [&str; 4] = [
    keys::RESOURCE_TYPE,
    keys::OPERATION,
    keys::SOURCE_PATH,
    keys::DESTINATION_PATH,
];

/// One replicated change.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Kind of resource.
    pub resource_type: ResourceType,
    /// What happened to it.
    pub operation: Operation,
    /// Affected resource.
    pub source_path: DocPath,
    /// Target of a move or copy.
    pub destination_path: Option<DocPath>,
    /// Serialized content, possibly gzip-compressed.
    pub payload: Option<Bytes>,
    /// Reserved and application properties, structural keys excluded.
    pub properties: MessageProperties,
}

impl Envelope {
    /// An envelope without payload or properties.
    pub fn new(resource_type: ResourceType, operation: Operation, source_path: DocPath) -> Self {
        Self {
            resource_type,
            operation,
            source_path,
            destination_path: None,
            payload: None,
            properties: MessageProperties::new(),
        }
    }

    /// Set the destination path.
    pub fn with_destination(mut self, destination: DocPath) -> Self {
        self.destination_path = Some(destination);
        self
    }

    /// Attach an uncompressed payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self.properties.set(
            keys::DOCUMENT_COMPRESSION,
            PayloadCompression::None.as_str(),
        );
        self
    }

    /// gzip-compress `content` into the payload.
    pub fn compress_payload(mut self, content: &[u8]) -> Result<Self> {
        self.payload = Some(Bytes::from(gzip(content)?));
        self.properties.set(
            keys::DOCUMENT_COMPRESSION,
            PayloadCompression::Gzip.as_str(),
        );
        Ok(self)
    }

    /// Set the owner account.
    pub fn with_owner(self, owner: &str) -> Self {
        self.with_property(keys::RESOURCE_OWNER, owner)
    }

    /// Set the owner group.
    pub fn with_group(self, group: &str) -> Self {
        self.with_property(keys::RESOURCE_GROUP, group)
    }

    /// Set the mode bits.
    pub fn with_mode(self, mode: u32) -> Self {
        match i32::try_from(mode) {
            Ok(mode) => self.with_property(keys::RESOURCE_MODE, mode),
            Err(_) => self,
        }
    }

    /// Set the mime type.
    pub fn with_mime_type(self, mime_type: &str) -> Self {
        self.with_property(keys::RESOURCE_MIMETYPE, mime_type)
    }

    /// Declare whether the payload is structured or binary content.
    pub fn with_data_type(self, kind: ResourceKind) -> Self {
        self.with_property(keys::DATA_TYPE, data_type_name(kind))
    }

    /// Set an arbitrary property.
    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.set(key, value);
        self
    }

    /// Identity of the sending instance, if stamped.
    pub fn origin(&self) -> Option<&str> {
        self.properties.get_str(keys::INSTANCE_ID)
    }

    /// Owner account name, if given as a string.
    pub fn owner(&self) -> Option<&str> {
        self.properties.get_str(keys::RESOURCE_OWNER)
    }

    /// Owner group name, if given as a string.
    pub fn group(&self) -> Option<&str> {
        self.properties.get_str(keys::RESOURCE_GROUP)
    }

    /// Mode bits, if given as an int.
    pub fn mode(&self) -> Option<u32> {
        self.properties
            .get_int(keys::RESOURCE_MODE)
            .and_then(|m| u32::try_from(m).ok())
    }

    /// Declared mime type, if given as a string.
    pub fn mime_type(&self) -> Option<&str> {
        self.properties.get_str(keys::RESOURCE_MIMETYPE)
    }

    /// Declared storage kind, if the data-type property is present and known.
    pub fn data_type(&self) -> Option<ResourceKind> {
        match self.properties.get_str(keys::DATA_TYPE)?.trim() {
            "XML" => Some(ResourceKind::Xml),
            "BINARY" => Some(ResourceKind::Binary),
            _ => None,
        }
    }

    /// Payload compression; gzip unless the marker says otherwise.
    pub fn compression(&self) -> Result<PayloadCompression> {
        match self.properties.get(keys::DOCUMENT_COMPRESSION) {
            None => Ok(PayloadCompression::Gzip),
            Some(value) => value
                .as_str()
                .and_then(PayloadCompression::parse)
                .ok_or_else(|| ReplError::EnvelopeDecode {
                    msg: format!("unknown compression marker '{}'", value),
                }),
        }
    }

    /// A reader over the decompressed payload. An absent payload reads as empty.
    pub fn content_reader(&self) -> Result<Box<dyn Read + '_>> {
        let raw: &[u8] = self.payload.as_deref().unwrap_or_default();
        Ok(match self.compression()? {
            PayloadCompression::Gzip => Box::new(GzDecoder::new(raw)),
            PayloadCompression::None => Box::new(raw),
        })
    }

    /// Check the field combination is meaningful.
    pub fn validate(&self) -> Result<()> {
        if self.operation.needs_destination() && self.destination_path.is_none() {
            return Err(ReplError::EnvelopeDecode {
                msg: format!(
                    "{} {} of {} has no destination path",
                    self.resource_type, self.operation, self.source_path
                ),
            });
        }
        self.compression()?;
        Ok(())
    }

    /// Properties as they appear on the wire, structural keys included.
    pub fn to_wire_properties(&self) -> MessageProperties {
        let mut props = self.properties.clone();
        props.set(keys::RESOURCE_TYPE, self.resource_type.as_str());
        props.set(keys::OPERATION, self.operation.as_str());
        props.set(keys::SOURCE_PATH, self.source_path.as_str());
        match &self.destination_path {
            Some(dest) => {
                props.set(keys::DESTINATION_PATH, dest.as_str());
            }
            None => {
                props.remove(keys::DESTINATION_PATH);
            }
        }
        props
    }

    /// A bytes message carrying the payload and wire properties.
    ///
    /// Properties of types that cannot travel on the wire are left out.
    pub fn to_message(&self) -> Message {
        let mut message = Message::bytes(self.payload.clone().unwrap_or_default());
        for (key, value) in self.to_wire_properties() {
            if value.is_wire_type() {
                message.properties.set(key, value);
            }
        }
        message
    }

    /// Rebuild an envelope from a received message.
    pub fn from_message(message: &Message) -> Result<Self> {
        let payload = match &message.body {
            MessageBody::Bytes(bytes) if bytes.is_empty() => None,
            MessageBody::Bytes(bytes) => Some(bytes.clone()),
            other => {
                return Err(ReplError::UnsupportedMessage {
                    kind: other.kind().to_string(),
                })
            }
        };
        let props = &message.properties;
        let required = |key: &str| {
            props.get_str(key).ok_or_else(|| ReplError::EnvelopeDecode {
                msg: format!("missing required property {}", key),
            })
        };
        let path = |key: &str, value: &str| {
            DocPath::parse(value).map_err(|e| ReplError::EnvelopeDecode {
                msg: format!("{}: {}", key, e),
            })
        };

        let resource_type: ResourceType = required(keys::RESOURCE_TYPE)?.parse()?;
        let operation: Operation = required(keys::OPERATION)?.parse()?;
        let source_path = path(keys::SOURCE_PATH, required(keys::SOURCE_PATH)?)?;
        let destination_path = match props.get_str(keys::DESTINATION_PATH) {
            Some(value) if !value.trim().is_empty() => Some(path(keys::DESTINATION_PATH, value)?),
            _ => None,
        };

        let mut properties = props.clone();
        for key in STRUCTURAL_KEYS {
            properties.remove(key);
        }

        let envelope = Self {
            resource_type,
            operation,
            source_path,
            destination_path,
            payload,
            properties,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} {} {}",
            self.resource_type, self.operation, self.source_path
        );
        if let Some(dest) = &self.destination_path {
            out.push_str(&format!(" -> {}", dest));
        }
        if let Some(payload) = &self.payload {
            out.push_str(&format!(" ({} bytes)", payload.len()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DocPath {
        DocPath::parse(s).unwrap()
    }

    fn wire(pairs: &[(&str, &str)]) -> Message {
        let mut msg = Message::bytes(Vec::<u8>::new());
        for (k, v) in pairs {
            msg.properties.set(*k, *v);
        }
        msg
    }

    mod enums {
        use super::*;

        #[test]
        fn test_parse_is_case_insensitive() {
            assert_eq!("document".parse::<ResourceType>().unwrap(), ResourceType::Document);
            assert_eq!("Metadata".parse::<Operation>().unwrap(), Operation::Metadata);
        }

        #[test]
        fn test_unknown_values_fail() {
            assert!(matches!(
                "FOLDER".parse::<ResourceType>(),
                Err(ReplError::EnvelopeDecode { .. })
            ));
            assert!(matches!(
                "RENAME".parse::<Operation>(),
                Err(ReplError::EnvelopeDecode { .. })
            ));
        }
    }

    mod decode {
        use super::*;

        #[test]
        fn test_message_round_trip() {
            let env = Envelope::new(ResourceType::Collection, Operation::Move, p("/db/a"))
                .with_destination(p("/db/b"))
                .with_owner("alice")
                .with_mode(0o750)
                .with_property("app.note", "moved");
            let decoded = Envelope::from_message(&env.to_message()).unwrap();
            assert_eq!(decoded, env);
            assert_eq!(decoded.mode(), Some(0o750));
        }

        #[test]
        fn test_unknown_keys_are_preserved() {
            let mut msg = wire(&[
                (keys::RESOURCE_TYPE, "DOCUMENT"),
                (keys::OPERATION, "DELETE"),
                (keys::SOURCE_PATH, "/db/a/x.xml"),
            ]);
            msg.properties.set("vendor.flag", true);
            let env = Envelope::from_message(&msg).unwrap();
            assert_eq!(env.properties.get("vendor.flag"), Some(&PropertyValue::Bool(true)));
            assert!(!env.properties.contains_key(keys::SOURCE_PATH));
            assert!(env.payload.is_none());
        }

        #[test]
        fn test_missing_required_key_fails() {
            let msg = wire(&[(keys::RESOURCE_TYPE, "DOCUMENT"), (keys::SOURCE_PATH, "/db/x")]);
            let err = Envelope::from_message(&msg).unwrap_err();
            assert!(err.to_string().contains(keys::OPERATION));
        }

        #[test]
        fn test_unknown_operation_fails() {
            let msg = wire(&[
                (keys::RESOURCE_TYPE, "DOCUMENT"),
                (keys::OPERATION, "TRUNCATE"),
                (keys::SOURCE_PATH, "/db/x"),
            ]);
            assert!(matches!(
                Envelope::from_message(&msg),
                Err(ReplError::EnvelopeDecode { .. })
            ));
        }

        #[test]
        fn test_relative_path_fails() {
            let msg = wire(&[
                (keys::RESOURCE_TYPE, "COLLECTION"),
                (keys::OPERATION, "CREATE"),
                (keys::SOURCE_PATH, "db/x"),
            ]);
            assert!(matches!(
                Envelope::from_message(&msg),
                Err(ReplError::EnvelopeDecode { .. })
            ));
        }

        #[test]
        fn test_move_without_destination_fails() {
            let msg = wire(&[
                (keys::RESOURCE_TYPE, "DOCUMENT"),
                (keys::OPERATION, "MOVE"),
                (keys::SOURCE_PATH, "/db/x.xml"),
            ]);
            assert!(matches!(
                Envelope::from_message(&msg),
                Err(ReplError::EnvelopeDecode { .. })
            ));
        }

        #[test]
        fn test_non_bytes_body_is_unsupported() {
            let mut msg = Message::text("hello");
            msg.properties.set(keys::RESOURCE_TYPE, "DOCUMENT");
            assert!(matches!(
                Envelope::from_message(&msg),
                Err(ReplError::UnsupportedMessage { .. })
            ));
        }

        #[test]
        fn test_empty_body_is_unsupported() {
            let mut msg = Message::empty();
            msg.properties.set(keys::RESOURCE_TYPE, "COLLECTION");
            msg.properties.set(keys::OPERATION, "DELETE");
            msg.properties.set(keys::SOURCE_PATH, "/db/a");
            let err = Envelope::from_message(&msg).unwrap_err();
            assert!(matches!(err, ReplError::UnsupportedMessage { ref kind } if kind == "empty"));

            msg.body = MessageBody::Bytes(Bytes::new());
            assert_eq!(Envelope::from_message(&msg).unwrap().payload, None);
        }
    }

    mod payload {
        use super::*;

        #[test]
        fn test_compressed_payload_reads_back() {
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/a.xml"))
                .compress_payload(b"<a/>")
                .unwrap();
            assert_eq!(env.compression().unwrap(), PayloadCompression::Gzip);
            let mut out = String::new();
            env.content_reader().unwrap().read_to_string(&mut out).unwrap();
            assert_eq!(out, "<a/>");
        }

        #[test]
        fn test_absent_marker_means_gzip() {
            let mut env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/a.xml"));
            env.payload = Some(Bytes::from(gzip(b"data").unwrap()));
            assert_eq!(env.compression().unwrap(), PayloadCompression::Gzip);
            let mut out = Vec::new();
            env.content_reader().unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, b"data");
        }

        #[test]
        fn test_raw_payload_is_not_decompressed() {
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/a.bin"))
                .with_payload(vec![1u8, 2, 3]);
            let mut out = Vec::new();
            env.content_reader().unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, vec![1, 2, 3]);
        }

        #[test]
        fn test_unknown_marker_rejected() {
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/a.bin"))
                .with_property(keys::DOCUMENT_COMPRESSION, "zstd");
            assert!(env.validate().is_err());
        }
    }

    #[test]
    fn test_summary() {
        let env = Envelope::new(ResourceType::Document, Operation::Copy, p("/db/a.xml"))
            .with_destination(p("/db/b.xml"));
        assert_eq!(env.summary(), "DOCUMENT COPY /db/a.xml -> /db/b.xml");
    }
}
