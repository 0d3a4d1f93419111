//! Abstract publish/subscribe transport.
//!
//! A [`Transport`] resolves an [`Endpoint`] into a [`Connection`]; connections
//! create [`Producer`]s bound to a destination and register
//! [`MessageListener`]s as durable subscribers. Every listener invocation is a
//! client acknowledgement: returning `Ok` acknowledges the message, returning
//! an error hands it back to the transport's redelivery policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::message::{DeliveryMode, Message};

/// User name and password presented on connect.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How the connection factory is resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactoryRef {
    /// Look up a connection factory by name.
    Named(String),
    /// Borrow from a shared pooled factory identified by key.
    Pooled {
        /// Pool key.
        key: String,
    },
}

impl fmt::Display for FactoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactoryRef::Named(name) => f.write_str(name),
            FactoryRef::Pooled { key } => write!(f, "pool:{}", key),
        }
    }
}

/// Everything needed to open a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Naming context implementation, e.g. `memory`.
    pub context_factory: String,
    /// Broker URL.
    pub broker_url: String,
    /// Connection factory resolution.
    pub factory: FactoryRef,
    /// Optional credentials.
    pub credentials: Option<Credentials>,
    /// Optional client id; must be unique among open connections.
    pub client_id: Option<String>,
}

/// Receives messages for a subscription.
///
/// Called from a blocking worker thread; implementations may block on locks
/// and I/O. Returning an error leaves the message unacknowledged.
pub trait MessageListener: Send + Sync {
    /// Process one delivered message.
    fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

/// Options for a durable subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Durable subscriber name; messages published while it is inactive are kept.
    pub subscriber_name: String,
    /// Maximum number of messages processed at once. `1` keeps publish order.
    pub concurrency: usize,
    /// Redelivery attempts after the first failed delivery, before dead-lettering.
    pub max_redeliveries: u32,
}

impl SubscribeOptions {
    /// Options for a named subscriber with ordered delivery.
    pub fn new(subscriber_name: impl Into<String>) -> Self {
        Self {
            subscriber_name: subscriber_name.into(),
            ..Self::default()
        }
    }

    /// Set the delivery concurrency (at least one).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the redelivery limit.
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            subscriber_name: "default".to_string(),
            concurrency: 1,
            max_redeliveries: 3,
        }
    }
}

/// An active subscription. Dropping it stops delivery without waiting.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    destination: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a delivery task that stops when `shutdown` flips to true.
    pub fn new(
        name: impl Into<String>,
        destination: impl Into<String>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            shutdown,
            task: Some(task),
        }
    }

    /// Durable subscriber name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribed destination.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Stop delivery and wait for in-flight messages to finish.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(subscriber = %self.name, error = %e, "delivery task ended abnormally");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Resolves endpoints into connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to the endpoint.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>>;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Connection id assigned by the broker.
    fn id(&self) -> &str;

    /// Create a producer bound to `destination`.
    async fn create_producer(&self, destination: &str) -> Result<Box<dyn Producer>>;

    /// Register a durable subscriber on `destination`.
    async fn subscribe(
        &self,
        destination: &str,
        listener: Arc<dyn MessageListener>,
        options: SubscribeOptions,
    ) -> Result<Subscription>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Publishes messages to one destination.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Bound destination.
    fn destination(&self) -> &str;

    /// Time to live in milliseconds applied to sent messages; 0 means none.
    fn set_time_to_live(&mut self, ttl_ms: u64);

    /// Current time to live.
    fn time_to_live(&self) -> u64;

    /// Priority (0..=9) applied to sent messages.
    fn set_priority(&mut self, priority: u8);

    /// Current priority.
    fn priority(&self) -> u8;

    /// Delivery mode applied to sent messages.
    fn set_delivery_mode(&mut self, mode: DeliveryMode);

    /// Current delivery mode.
    fn delivery_mode(&self) -> DeliveryMode;

    /// Publish synchronously. On return the broker has accepted the message and
    /// its id, timestamp, expiration, priority and delivery mode are set.
    async fn send(&mut self, message: &mut Message) -> Result<()>;

    /// Close the producer. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("admin", "secret");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("admin"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_subscribe_options_defaults() {
        let opts = SubscribeOptions::new("node-a");
        assert_eq!(opts.subscriber_name, "node-a");
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.max_redeliveries, 3);
        assert_eq!(opts.with_concurrency(0).concurrency, 1);
    }

    #[test]
    fn test_factory_ref_display() {
        assert_eq!(FactoryRef::Named("cf".to_string()).to_string(), "cf");
        assert_eq!(
            FactoryRef::Pooled {
                key: "p".to_string()
            }
            .to_string(),
            "pool:p"
        );
    }

    #[tokio::test]
    async fn test_subscription_close_stops_task() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = rx.changed().await;
        });
        let sub = Subscription::new("s", "topic", tx, task);
        assert_eq!(sub.destination(), "topic");
        sub.close().await;
    }
}
