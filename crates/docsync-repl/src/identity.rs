//! Instance identity used to recognise self-originated messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Identifier of one running instance.
///
/// Senders stamp it on every message; receivers drop messages carrying their
/// own value. An empty identity is valid but disables that filtering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

static PROCESS_IDENTITY: OnceLock<Identity> = OnceLock::new();

impl Identity {
    /// Wrap an explicit value.
    pub fn new(value: impl Into<String>) -> Self {
        let identity = Self(value.into());
        if identity.is_empty() {
            error!("empty instance identity, self-originated messages will not be filtered");
        }
        identity
    }

    /// The process-wide identity, computed on first use and cached.
    pub fn process() -> Identity {
        PROCESS_IDENTITY
            .get_or_init(|| {
                let identity = Self(format!("{}-{}", host_name(), Uuid::new_v4().simple()));
                info!(identity = %identity, "instance identity initialised");
                identity
            })
            .clone()
    }

    /// The identity text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if no identity is set.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// True if `remote` names this instance. Always false for an empty identity.
    pub fn is_self(&self, remote: Option<&str>) -> bool {
        !self.is_empty() && remote == Some(self.0.as_str())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn host_name() -> String {
    match hostname::get() {
        Ok(name) => {
            let name = name.to_string_lossy().trim().to_string();
            if name.is_empty() {
                warn!("system host name is empty, using localhost");
                "localhost".to_string()
            } else {
                name
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot read system host name, using localhost");
            "localhost".to_string()
        }
    }
}
