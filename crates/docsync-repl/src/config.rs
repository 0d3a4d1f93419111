//! Transport and destination configuration for senders and receivers.

use docsync_transport::{Credentials, DeliveryMode, Endpoint, FactoryRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ReplError, Result};

/// Where and how to publish or subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Naming context implementation.
    pub context_factory: String,
    /// Broker URL.
    pub broker_url: String,
    /// Connection factory name, used when no pool key is set.
    pub connection_factory: String,
    /// Pooled connection factory key; takes precedence over `connection_factory`.
    pub connection_pool: Option<String>,
    /// Topic name.
    pub destination: String,
    /// User name for authenticated connections.
    pub username: Option<String>,
    /// Password for authenticated connections.
    pub password: Option<String>,
    /// Client id for the connection.
    pub client_id: Option<String>,
    /// Message time to live in milliseconds.
    pub time_to_live_ms: Option<u64>,
    /// Message priority, 0..=9.
    pub priority: Option<u8>,
    /// Message persistence.
    pub delivery_mode: Option<DeliveryMode>,
    /// Extra settings passed through untouched.
    pub properties: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            context_factory: "memory".to_string(),
            broker_url: String::new(),
            connection_factory: "ConnectionFactory".to_string(),
            connection_pool: None,
            destination: String::new(),
            username: None,
            password: None,
            client_id: None,
            time_to_live_ms: None,
            priority: None,
            delivery_mode: None,
            properties: BTreeMap::new(),
        }
    }
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

impl TransportConfig {
    /// A configuration for `broker_url` publishing to `destination`.
    pub fn new(broker_url: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            destination: destination.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: TransportConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: TransportConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Check that everything needed to connect is present. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| {
            Err(ReplError::Configuration {
                msg: msg.to_string(),
            })
        };
        if blank(&self.context_factory) {
            return fail("context factory is blank");
        }
        if blank(&self.broker_url) {
            return fail("broker URL is blank");
        }
        if blank(&self.destination) {
            return fail("destination is blank");
        }
        match &self.connection_pool {
            Some(key) if blank(key) => return fail("connection pool key is blank"),
            None if blank(&self.connection_factory) => {
                return fail("connection factory is blank")
            }
            _ => {}
        }
        if self.password.is_some() && self.username.as_deref().map_or(true, blank) {
            return fail("password given without a username");
        }
        if matches!(&self.client_id, Some(id) if blank(id)) {
            return fail("client id is blank");
        }
        if let Some(priority) = self.priority {
            if priority > 9 {
                return Err(ReplError::Configuration {
                    msg: format!("priority {} is outside 0..=9", priority),
                });
            }
        }
        Ok(())
    }

    /// Connection factory resolution for this configuration.
    pub fn factory(&self) -> FactoryRef {
        match &self.connection_pool {
            Some(key) => FactoryRef::Pooled { key: key.clone() },
            None => FactoryRef::Named(self.connection_factory.clone()),
        }
    }

    /// The transport endpoint. Credentials are attached only when both the
    /// username and password are non-blank; otherwise the connection is anonymous.
    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint {
            context_factory: self.context_factory.clone(),
            broker_url: self.broker_url.clone(),
            factory: self.factory(),
            credentials: match (&self.username, &self.password) {
                (Some(user), Some(password)) if !blank(user) && !blank(password) => {
                    Some(Credentials::new(user.clone(), password.clone()))
                }
                _ => None,
            },
            client_id: self.client_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> TransportConfig {
        TransportConfig::new("vm://localhost", "replication")
    }

    mod validate {
        use super::*;

        #[test]
        fn test_minimal_config_is_valid() {
            assert!(valid().validate().is_ok());
        }

        #[test]
        fn test_blank_broker_url_fails() {
            let mut config = valid();
            config.broker_url = "  ".to_string();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("broker URL"));
        }

        #[test]
        fn test_blank_destination_fails() {
            let mut config = valid();
            config.destination.clear();
            assert!(matches!(config.validate(), Err(ReplError::Configuration { .. })));
        }

        #[test]
        fn test_blank_factory_fails_unless_pooled() {
            let mut config = valid();
            config.connection_factory.clear();
            assert!(config.validate().is_err());
            config.connection_pool = Some("pooled".to_string());
            assert!(config.validate().is_ok());
            config.connection_pool = Some(String::new());
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_password_needs_username() {
            let mut config = valid();
            config.password = Some("pw".to_string());
            assert!(config.validate().is_err());
            config.username = Some("admin".to_string());
            assert!(config.validate().is_ok());
        }

        #[test]
        fn test_priority_range() {
            let mut config = valid();
            config.priority = Some(9);
            assert!(config.validate().is_ok());
            config.priority = Some(10);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_endpoint_uses_pool_when_set() {
        let mut config = valid();
        assert_eq!(
            config.to_endpoint().factory,
            FactoryRef::Named("ConnectionFactory".to_string())
        );
        config.connection_pool = Some("pooled".to_string());
        config.username = Some("u".to_string());
        let endpoint = config.to_endpoint();
        assert_eq!(
            endpoint.factory,
            FactoryRef::Pooled {
                key: "pooled".to_string()
            }
        );
        assert!(endpoint.credentials.is_none());
    }

    #[test]
    fn test_endpoint_is_anonymous_without_both_credentials() {
        let mut config = valid();
        config.username = Some("admin".to_string());
        assert!(config.to_endpoint().credentials.is_none());
        config.password = Some("  ".to_string());
        assert!(config.to_endpoint().credentials.is_none());
        config.password = Some("secret".to_string());
        let credentials = config.to_endpoint().credentials.unwrap();
        assert_eq!(credentials.username, "admin");
        assert_eq!(credentials.password, "secret");
        config.username = Some(String::new());
        assert!(config.to_endpoint().credentials.is_none());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
broker_url = "vm://localhost"
destination = "replication"
connection_pool = "pooled"
time_to_live_ms = 60000
priority = 7
delivery_mode = "non_persistent"

[properties]
region = "eu"
"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.context_factory, "memory");
        assert_eq!(config.connection_pool.as_deref(), Some("pooled"));
        assert_eq!(config.time_to_live_ms, Some(60000));
        assert_eq!(config.delivery_mode, Some(DeliveryMode::NonPersistent));
        assert_eq!(config.properties.get("region").map(String::as_str), Some("eu"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"broker_url": "vm://localhost", "destination": "t", "username": "admin", "password": "pw"}}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.connection_factory, "ConnectionFactory");
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(TransportConfig::from_file(file.path()).is_err());
    }
}
