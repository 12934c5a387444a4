//! Process-wide event fan-out.
//!
//! Lifecycle and log events are delivered to every registered listener.
//! Each listener owns a bounded FIFO; [`NotificationManager::emit`] never
//! waits for a slow listener. When a listener's queue is full the new event
//! is dropped for that listener and counted ([`NotificationQueue::dropped`]).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use netsim_compute::notification::NotificationManager;
//!
//! # async fn demo() {
//! let notifications = NotificationManager::new(1024, "/var/lib/netsim");
//! let mut queue = notifications.queue();
//! notifications.emit("node.updated", serde_json::json!({"name": "PC1"}), Default::default());
//! let event = queue.get(Duration::from_secs(5)).await;
//! assert_eq!(event.action, "node.updated");
//! # }
//! ```

mod stats;

pub use stats::{HostSampler, HostUsage};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Action name of heartbeat events.
pub const PING_ACTION: &str = "ping";

/// One event as seen by listeners.
///
/// Serializes as `{"action": ..., "event": ..., <metadata...>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event name, e.g. `node.updated`.
    pub action: String,
    /// Opaque payload.
    pub event: Value,
    /// Extra top-level fields.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Notification {
    /// Whether this is a heartbeat.
    pub fn is_ping(&self) -> bool {
        self.action == PING_ACTION
    }
}

struct Listener {
    tx: mpsc::Sender<Notification>,
    dropped: Arc<AtomicU64>,
}

struct Shared {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
    capacity: usize,
    disk_path: PathBuf,
    sampler: HostSampler,
}

impl Shared {
    fn ping(&self) -> Notification {
        let usage = self.sampler.sample(&self.disk_path);
        Notification {
            action: PING_ACTION.to_string(),
            event: serde_json::to_value(usage).unwrap_or(Value::Null),
            metadata: Map::new(),
        }
    }
}

/// Fan-out hub. Cheap to clone; clones share listeners.
#[derive(Clone)]
pub struct NotificationManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field("listeners", &self.listener_count())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl NotificationManager {
    /// Create a hub whose listener queues hold `capacity` events.
    ///
    /// `disk_path` is the filesystem reported in heartbeats.
    pub fn new(capacity: usize, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                disk_path: disk_path.into(),
                sampler: HostSampler::new(),
            }),
        }
    }

    /// Deliver an event to every current listener.
    pub fn emit(&self, action: impl Into<String>, event: Value, metadata: Map<String, Value>) {
        let notification = Notification {
            action: action.into(),
            event,
            metadata,
        };
        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for (id, listener) in listeners.iter() {
            match listener.tx.try_send(notification.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = listener.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total == 1 || total.is_power_of_two() {
                        warn!(
                            "Listener {} is not keeping up, {} events dropped",
                            id, total
                        );
                    }
                }
                // Receiver gone; its guard removes the entry.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Emit an event tagged with its project.
    pub fn project_emit(&self, action: impl Into<String>, event: Value, project_id: Uuid) {
        let mut metadata = Map::new();
        metadata.insert("project_id".to_string(), Value::String(project_id.to_string()));
        self.emit(action, event, metadata);
    }

    /// Register a listener. It is deregistered when the queue is dropped.
    pub fn queue(&self) -> NotificationQueue {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id,
                Listener {
                    tx,
                    dropped: Arc::clone(&dropped),
                },
            );
        debug!("Notification listener {} registered", id);
        NotificationQueue {
            id,
            rx,
            dropped,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Filesystem reported in heartbeats.
    pub fn disk_path(&self) -> &Path {
        &self.shared.disk_path
    }
}

/// A listener's private queue.
pub struct NotificationQueue {
    id: u64,
    rx: mpsc::Receiver<Notification>,
    dropped: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl NotificationQueue {
    /// Wait for the next event, or return a heartbeat once `timeout` elapses.
    pub async fn get(&mut self, timeout: Duration) -> Notification {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(notification)) => notification,
            // The sender lives in the listener table until this queue drops,
            // so `None` cannot happen while we hold it; treat it as idle.
            Ok(None) | Err(_) => self.shared.ping(),
        }
    }

    /// Take an already queued event without waiting.
    pub fn try_get(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Events dropped because this queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
        debug!("Notification listener {} deregistered", self.id);
    }
}
