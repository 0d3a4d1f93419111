//! Delivery confirmations and receiver statistics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshot returned by a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Broker-assigned message id.
    pub message_id: Option<String>,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Declared message type.
    pub message_type: Option<String>,
    /// Effective time to live in milliseconds.
    pub time_to_live_ms: u64,
    /// Effective priority.
    pub priority: u8,
    /// Effective delivery mode code (1 non-persistent, 2 persistent).
    pub delivery_mode: i32,
    /// Naming context of the endpoint.
    pub context_factory: String,
    /// Broker URL.
    pub broker_url: String,
    /// Connection factory used.
    pub connection_factory: String,
    /// Destination published to.
    pub destination: String,
    /// User the connection authenticated as.
    pub username: Option<String>,
}

/// Number of recent error messages kept by a [`Report`].
pub const MAX_RECENT_ERRORS: usize = 50;

/// Receiver statistics, shared between concurrent deliveries.
#[derive(Debug)]
pub struct Report {
    total: AtomicU64,
    success: AtomicU64,
    filtered: AtomicU64,
    converged: AtomicU64,
    failed: AtomicU64,
    elapsed_ns: AtomicU64,
    recent_errors: Mutex<VecDeque<String>>,
}

/// Measures one message; pass it back to [`Report::stop`].
#[derive(Debug)]
#[must_use = "a started timer must be passed to Report::stop"]
pub struct Timer {
    started: Instant,
}

/// Serializable view of a [`Report`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSnapshot {
    /// Messages received.
    pub total: u64,
    /// Messages handled without error, converged ones included.
    pub success: u64,
    /// Self-originated messages skipped.
    pub filtered: u64,
    /// Messages whose target state was already reached.
    pub converged: u64,
    /// Messages that raised an error.
    pub failed: u64,
    /// Accumulated processing time in milliseconds.
    pub elapsed_ms: u64,
    /// Average processing time per message in microseconds.
    pub average_us: u64,
    /// Most recent error messages, oldest first.
    pub recent_errors: Vec<String>,
}

impl Report {
    /// An empty report.
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            converged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            elapsed_ns: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
        }
    }

    /// Start timing one message.
    pub fn start(&self) -> Timer {
        Timer {
            started: Instant::now(),
        }
    }

    /// Stop timing and accumulate the elapsed time.
    pub fn stop(&self, timer: Timer) -> Duration {
        let elapsed = timer.started.elapsed();
        self.add_elapsed(elapsed);
        elapsed
    }

    /// Add processing time.
    pub fn add_elapsed(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Count a received message.
    pub fn inc_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successfully handled message.
    pub fn inc_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a self-originated message.
    pub fn inc_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message whose target state already held.
    pub fn inc_converged(&self) {
        self.converged.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed message and remember its error text.
    pub fn add_error(&self, msg: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut errors = self.recent_errors.lock().unwrap_or_else(|e| e.into_inner());
        if errors.len() == MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(msg.into());
    }

    /// Messages received.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Messages handled without error.
    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    /// Accumulated processing time.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> ReportSnapshot {
        let total = self.total();
        let elapsed_ns = self.elapsed_ns.load(Ordering::Relaxed);
        ReportSnapshot {
            total,
            success: self.success(),
            filtered: self.filtered.load(Ordering::Relaxed),
            converged: self.converged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            elapsed_ms: elapsed_ns / 1_000_000,
            average_us: if total == 0 { 0 } else { elapsed_ns / total / 1_000 },
            recent_errors: self
                .recent_errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
        }
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSnapshot {
    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} received | {} ok | {} filtered | {} converged | {} failed | avg {}us",
            self.total, self.success, self.filtered, self.converged, self.failed, self.average_us
        )
    }
}
