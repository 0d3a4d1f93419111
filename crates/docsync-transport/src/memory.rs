//! In-process publish/subscribe broker.
//!
//! Destinations are topics with durable subscribers: every subscriber name
//! registered on a destination receives each message published after its first
//! registration, including messages published while it was inactive. Frames
//! travel bincode-encoded over tokio mpsc channels, so every delivery sees a
//! fresh copy of the message, as it would from a remote broker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::message::{DeliveryMode, Message, DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::transport::{
    Connection, Credentials, Endpoint, FactoryRef, MessageListener, Producer, SubscribeOptions,
    Subscription, Transport,
};

/// Context factory name served by [`MemoryBroker`].
pub const MEMORY_CONTEXT_FACTORY: &str = "memory";

/// Broker settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// URL clients must connect to.
    pub url: String,
    /// Connection factory names that resolve.
    pub connection_factories: Vec<String>,
    /// Pooled factory keys that resolve.
    pub pool_keys: Vec<String>,
    /// Maximum number of simultaneously open connections.
    pub max_connections: usize,
    /// Required credentials; `None` accepts anonymous connections.
    pub credentials: Option<Credentials>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "vm://localhost".to_string(),
            connection_factories: vec!["ConnectionFactory".to_string()],
            pool_keys: vec!["pooled".to_string()],
            max_connections: 16,
            credentials: None,
        }
    }
}

struct BrokerStatsInner {
    published: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
}

impl BrokerStatsInner {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }
}

/// Snapshot of broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Messages accepted from producers.
    pub published: u64,
    /// Deliveries acknowledged by a listener.
    pub delivered: u64,
    /// Delivery attempts repeated after a listener failure.
    pub redelivered: u64,
    /// Messages moved to the dead-letter list.
    pub dead_lettered: u64,
    /// Messages dropped because their expiration passed.
    pub expired: u64,
}

#[derive(Default)]
struct SubscriberSlot {
    active: Option<mpsc::UnboundedSender<Vec<u8>>>,
    backlog: VecDeque<Vec<u8>>,
}

impl SubscriberSlot {
    fn offer(&mut self, frame: Vec<u8>) {
        let frame = match &self.active {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        self.active = None;
        self.backlog.push_back(frame);
    }

    fn is_active(&self) -> bool {
        self.active.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, HashMap<String, SubscriberSlot>>,
    client_ids: HashSet<String>,
    dead_letters: Vec<Message>,
}

struct BrokerInner {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    stats: BrokerStatsInner,
    open_connections: AtomicUsize,
    next_connection: AtomicU64,
    next_message: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fan a frame out to every subscriber of `destination`; returns how many.
    fn publish(&self, destination: &str, frame: Vec<u8>) -> usize {
        let mut state = self.state();
        let Some(subscribers) = state.topics.get_mut(destination) else {
            return 0;
        };
        for slot in subscribers.values_mut() {
            slot.offer(frame.clone());
        }
        subscribers.len()
    }

    fn release_connection(&self, id: &str, client_id: Option<&str>) {
        let mut state = self.state();
        if let Some(cid) = client_id {
            state.client_ids.remove(cid);
        }
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
        debug!(connection = id, "connection closed");
    }

    /// Run the listener on one frame, redelivering on failure.
    async fn deliver(
        &self,
        frame: Vec<u8>,
        destination: &str,
        listener: Arc<dyn MessageListener>,
        max_redeliveries: u32,
    ) {
        let mut message = match Message::decode(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(destination, error = %e, "dropping undecodable frame");
                return;
            }
        };
        if message.is_expired(now_ms()) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!(destination, message_id = ?message.id, "dropping expired message");
            return;
        }

        loop {
            message.delivery_count += 1;
            message.redelivered = message.delivery_count > 1;
            let attempt = message.clone();
            let handler = listener.clone();
            let outcome = tokio::task::spawn_blocking(move || handler.on_message(&attempt)).await;
            let failure = match outcome {
                Ok(Ok(())) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => format!("listener panicked: {}", e),
            };

            if message.delivery_count > max_redeliveries {
                warn!(
                    destination,
                    message_id = ?message.id,
                    attempts = message.delivery_count,
                    error = %failure,
                    "redelivery limit reached, message dead-lettered"
                );
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.state().dead_letters.push(message);
                return;
            }
            self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
            debug!(
                destination,
                message_id = ?message.id,
                attempt = message.delivery_count,
                error = %failure,
                "delivery failed, redelivering"
            );
        }
    }
}

async fn run_subscriber(
    inner: Arc<BrokerInner>,
    destination: String,
    options: SubscribeOptions,
    listener: Arc<dyn MessageListener>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done {
                    warn!(destination = %destination, error = %e, "delivery task failed");
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(permit) = permits.clone().acquire_owned().await else { break };
                let inner = inner.clone();
                let listener = listener.clone();
                let destination = destination.clone();
                let max_redeliveries = options.max_redeliveries;
                inflight.spawn(async move {
                    inner.deliver(frame, &destination, listener, max_redeliveries).await;
                    drop(permit);
                });
            }
        }
    }

    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            warn!(destination = %destination, error = %e, "delivery task failed");
        }
    }

    // Frames still queued go back to the durable backlog ahead of anything
    // published after the channel closed.
    rx.close();
    let mut pending = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        pending.push(frame);
    }
    let mut state = inner.state();
    if let Some(slot) = state
        .topics
        .get_mut(&destination)
        .and_then(|subs| subs.get_mut(&options.subscriber_name))
    {
        slot.active = None;
        for frame in pending.into_iter().rev() {
            slot.backlog.push_front(frame);
        }
    }
    info!(subscriber = %options.subscriber_name, destination = %destination, "subscriber stopped");
}

/// In-process broker implementing [`Transport`]. Cloning shares the broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("url", &self.inner.config.url)
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

impl MemoryBroker {
    /// Create a broker.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                state: Mutex::new(BrokerState::default()),
                stats: BrokerStatsInner::new(),
                open_connections: AtomicUsize::new(0),
                next_connection: AtomicU64::new(0),
                next_message: AtomicU64::new(0),
            }),
        }
    }

    /// Broker settings.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BrokerStats {
        let s = &self.inner.stats;
        BrokerStats {
            published: s.published.load(Ordering::Relaxed),
            delivered: s.delivered.load(Ordering::Relaxed),
            redelivered: s.redelivered.load(Ordering::Relaxed),
            dead_lettered: s.dead_lettered.load(Ordering::Relaxed),
            expired: s.expired.load(Ordering::Relaxed),
        }
    }

    /// Messages whose redelivery limit was reached.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.inner.state().dead_letters.clone()
    }

    /// Number of subscriber names registered on `destination`.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.inner
            .state()
            .topics
            .get(destination)
            .map_or(0, HashMap::len)
    }

    /// Messages held for an inactive durable subscriber.
    pub fn backlog_len(&self, destination: &str, subscriber: &str) -> usize {
        self.inner
            .state()
            .topics
            .get(destination)
            .and_then(|subs| subs.get(subscriber))
            .map_or(0, |slot| slot.backlog.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        let inner = &self.inner;
        if endpoint.context_factory != MEMORY_CONTEXT_FACTORY {
            return Err(TransportError::Lookup {
                name: endpoint.context_factory.clone(),
            });
        }
        if endpoint.broker_url != inner.config.url {
            return Err(TransportError::Unreachable {
                url: endpoint.broker_url.clone(),
            });
        }
        let pooled = match &endpoint.factory {
            FactoryRef::Named(name) => {
                if !inner.config.connection_factories.contains(name) {
                    return Err(TransportError::Lookup { name: name.clone() });
                }
                false
            }
            FactoryRef::Pooled { key } => {
                if !inner.config.pool_keys.contains(key) {
                    return Err(TransportError::Lookup { name: key.clone() });
                }
                true
            }
        };
        if let Some(required) = &inner.config.credentials {
            if endpoint.credentials.as_ref() != Some(required) {
                return Err(TransportError::Authentication {
                    user: endpoint.credentials.as_ref().map(|c| c.username.clone()),
                });
            }
        }

        let mut state = inner.state();
        if let Some(cid) = &endpoint.client_id {
            if state.client_ids.contains(cid) {
                return Err(TransportError::InvalidClientId {
                    client_id: cid.clone(),
                });
            }
        }
        let max = inner.config.max_connections;
        if inner.open_connections.load(Ordering::SeqCst) >= max {
            return Err(if pooled {
                TransportError::PoolExhausted {
                    cause: format!("pool limit of {} connections reached", max),
                }
            } else {
                TransportError::Refused {
                    msg: format!("broker limit of {} connections reached", max),
                }
            });
        }
        inner.open_connections.fetch_add(1, Ordering::SeqCst);
        if let Some(cid) = &endpoint.client_id {
            state.client_ids.insert(cid.clone());
        }
        drop(state);

        let id = format!("conn-{}", inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(connection = %id, factory = %endpoint.factory, "connection opened");
        Ok(Box::new(MemoryConnection {
            id,
            client_id: endpoint.client_id.clone(),
            inner: inner.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A connection to a [`MemoryBroker`]. Subscriptions outlive it until closed.
pub struct MemoryConnection {
    id: String,
    client_id: Option<String>,
    inner: Arc<BrokerInner>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.release_connection(&self.id, self.client_id.as_deref());
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                what: format!("connection {}", self.id),
            });
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_producer(&self, destination: &str) -> Result<Box<dyn Producer>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryProducer {
            destination: destination.to_string(),
            inner: self.inner.clone(),
            connection_closed: self.closed.clone(),
            closed: false,
            time_to_live: 0,
            priority: DEFAULT_PRIORITY,
            delivery_mode: DeliveryMode::default(),
        }))
    }

    async fn subscribe(
        &self,
        destination: &str,
        listener: Arc<dyn MessageListener>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state();
            let slot = state
                .topics
                .entry(destination.to_string())
                .or_default()
                .entry(options.subscriber_name.clone())
                .or_default();
            if slot.is_active() {
                return Err(TransportError::Refused {
                    msg: format!(
                        "subscriber {} already active on {}",
                        options.subscriber_name, destination
                    ),
                });
            }
            for frame in slot.backlog.drain(..) {
                let _ = tx.send(frame);
            }
            slot.active = Some(tx);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = options.subscriber_name.clone();
        info!(subscriber = %name, destination, concurrency = options.concurrency, "subscriber started");
        let task = tokio::spawn(run_subscriber(
            self.inner.clone(),
            destination.to_string(),
            options,
            listener,
            rx,
            shutdown_rx,
        ));
        Ok(Subscription::new(name, destination, shutdown_tx, task))
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

struct MemoryProducer {
    destination: String,
    inner: Arc<BrokerInner>,
    connection_closed: Arc<AtomicBool>,
    closed: bool,
    time_to_live: u64,
    priority: u8,
    delivery_mode: DeliveryMode,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn set_time_to_live(&mut self, ttl_ms: u64) {
        self.time_to_live = ttl_ms;
    }

    fn time_to_live(&self) -> u64 {
        self.time_to_live
    }

    fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(MAX_PRIORITY);
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn set_delivery_mode(&mut self, mode: DeliveryMode) {
        self.delivery_mode = mode;
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    async fn send(&mut self, message: &mut Message) -> Result<()> {
        if self.closed || self.connection_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                what: format!("producer for {}", self.destination),
            });
        }
        let now = now_ms();
        let seq = self.inner.next_message.fetch_add(1, Ordering::Relaxed) + 1;
        message.id = Some(format!("ID:{}", seq));
        message.destination = Some(self.destination.clone());
        message.timestamp_ms = now;
        message.expiration_ms = if self.time_to_live > 0 {
            now + self.time_to_live
        } else {
            0
        };
        message.priority = self.priority;
        message.delivery_mode = self.delivery_mode;
        message.redelivered = false;
        message.delivery_count = 0;

        let frame = message.encode()?;
        let receivers = self.inner.publish(&self.destination, frame);
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = ?message.id,
            destination = %self.destination,
            receivers,
            "message published"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
