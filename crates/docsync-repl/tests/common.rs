//! Shared fixtures for replication integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use docsync_repl::{
    Applier, DeliveryReport, Envelope, Identity, Item, Receiver, ReplicationListener,
    ReportSnapshot, Sender, TransportConfig,
};
use docsync_store::{MemorySecurity, MemoryStore, MimeTable};
use docsync_transport::{
    BrokerConfig, Connection, MemoryBroker, Message, MessageListener, MessageProperties,
    SubscribeOptions, Subscription, Transport,
};
use tracing_subscriber::EnvFilter;

/// Topic every node publishes to and subscribes on.
pub const TOPIC: &str = "replication";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> TransportConfig {
    TransportConfig::new("vm://localhost", TOPIC)
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One replicating instance: a store, its receiver and a sender.
pub struct Node {
    pub name: String,
    pub store: Arc<MemoryStore>,
    pub security: Arc<MemorySecurity>,
    pub listener: Arc<ReplicationListener>,
    pub receiver: Option<Receiver>,
    pub sender: Sender,
}

impl Node {
    pub fn report(&self) -> ReportSnapshot {
        self.listener.report().snapshot()
    }

    pub async fn publish(&self, envelope: Envelope) -> DeliveryReport {
        self.sender
            .send(&config(), &MessageProperties::new(), Item::Envelope(envelope))
            .await
            .expect("publish failed")
    }

    /// Wait until `n` messages have been received and their outcome recorded.
    pub async fn wait_handled(&self, n: u64) {
        let listener = self.listener.clone();
        wait_until(&format!("{} to handle {} messages", self.name, n), move || {
            let snap = listener.report().snapshot();
            snap.total >= n && snap.success + snap.failed + snap.filtered >= n
        })
        .await;
    }

    pub async fn stop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.close().await.expect("close receiver");
        }
    }

    pub async fn resume(&mut self, broker: &MemoryBroker) {
        if self.receiver.is_none() {
            self.receiver = Some(subscribe(&self.listener, broker, &self.name).await);
        }
    }
}

async fn subscribe(listener: &Arc<ReplicationListener>, broker: &MemoryBroker, name: &str) -> Receiver {
    listener
        .clone()
        .listen(broker, &config(), SubscribeOptions::new(name).with_max_redeliveries(0))
        .await
        .expect("subscribe failed")
}

/// Records every message it sees.
#[derive(Default)]
pub struct Capture {
    seen: Mutex<Vec<Message>>,
}

impl Capture {
    pub fn messages(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl MessageListener for Capture {
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// A raw subscriber on [`TOPIC`] that decodes nothing.
pub struct Probe {
    pub capture: Arc<Capture>,
    _subscription: Subscription,
    _connection: Box<dyn Connection>,
}

/// In-process broker plus the nodes attached to it.
pub struct Cluster {
    pub broker: MemoryBroker,
}

impl Cluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            broker: MemoryBroker::new(BrokerConfig::default()),
        }
    }

    pub async fn node(&self, name: &str) -> Node {
        let store = Arc::new(MemoryStore::new());
        let security = Arc::new(MemorySecurity::new());
        security.add_account("alice", "editors");
        let applier = Applier::new(store.clone(), security.clone(), MimeTable::default());
        let listener = Arc::new(ReplicationListener::new(applier, Identity::new(name)));
        let receiver = subscribe(&listener, &self.broker, name).await;
        let sender = Sender::new(Arc::new(self.broker.clone()), Identity::new(name))
            .with_principal("alice");
        Node {
            name: name.to_string(),
            store,
            security,
            listener,
            receiver: Some(receiver),
            sender,
        }
    }

    pub async fn probe(&self) -> Probe {
        let connection = self
            .broker
            .connect(&config().to_endpoint())
            .await
            .expect("probe connect");
        let capture = Arc::new(Capture::default());
        let subscription = connection
            .subscribe(TOPIC, capture.clone(), SubscribeOptions::new("probe"))
            .await
            .expect("probe subscribe");
        Probe {
            capture,
            _subscription: subscription,
            _connection: connection,
        }
    }
}
