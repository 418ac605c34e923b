//! Live event fan-out
//!
//! Typed events from the engine, scanner, and alert engine are wrapped in a
//! `{type, data, timestamp}` envelope and pushed to every subscriber. The
//! broadcaster is best-effort: a subscriber that is full or gone is evicted
//! on the spot, never waited on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::alerts::Alert;
use crate::models::DeviceSummary;

/// Queue depth per subscriber before it counts as not ready.
const SUBSCRIBER_BUFFER: usize = 64;

/// Events emitted by the monitoring core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    MonitoringUpdate {
        devices: Vec<DeviceSummary>,
        timestamp: DateTime<Utc>,
        cycle_ms: u64,
    },
    AlertCreated {
        alert: Alert,
    },
    AlertAcknowledged {
        alert: Alert,
    },
    AlertResolved {
        alert: Alert,
    },
    AlertDeleted {
        id: String,
    },
    ScanStarted {
        range: String,
        total_ips: u32,
    },
    ScanProgress {
        percent: u8,
        ip: String,
        result: bool,
    },
    HostDiscovered {
        ip: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rtt_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ports: Option<Vec<u16>>,
    },
    ScanCompleted {
        range: String,
        total_scanned: u32,
        total_found: u32,
        duration_ms: u64,
    },
    ScanStopped {
        range: String,
    },
    ScanError {
        range: String,
        message: String,
    },
    HostOnline {
        device_id: String,
        ip: String,
    },
    HostOffline {
        device_id: String,
        ip: String,
    },
}

impl Event {
    /// Wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::MonitoringUpdate { .. } => "monitoring_update",
            Event::AlertCreated { .. } => "alert_created",
            Event::AlertAcknowledged { .. } => "alert_acknowledged",
            Event::AlertResolved { .. } => "alert_resolved",
            Event::AlertDeleted { .. } => "alert_deleted",
            Event::ScanStarted { .. } => "scan_started",
            Event::ScanProgress { .. } => "scan_progress",
            Event::HostDiscovered { .. } => "host_discovered",
            Event::ScanCompleted { .. } => "scan_completed",
            Event::ScanStopped { .. } => "scan_stopped",
            Event::ScanError { .. } => "scan_error",
            Event::HostOnline { .. } => "host_online",
            Event::HostOffline { .. } => "host_offline",
        }
    }
}

/// Wire envelope consumed by the push transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl From<Event> for Envelope {
    fn from(event: Event) -> Self {
        let kind = event.kind().to_string();
        let data = match serde_json::to_value(&event) {
            Ok(Value::Object(map)) => map.get("data").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Envelope {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

pub type SubscriberId = u64;

/// Fan-out point for all live events.
///
/// The subscriber set is keyed by handle identity so a dashboard connection
/// may come and go freely.
pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Envelope>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber and hand back its receiving end.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        (self.attach(tx), rx)
    }

    /// Register an externally created push handle.
    pub fn attach(&self, sender: mpsc::Sender<Envelope>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .insert(id, sender);
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .len()
    }

    /// Push an event to every current subscriber, evicting dead ones.
    pub fn publish(&self, event: Event) {
        let envelope = Envelope::from(event);
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber set lock poisoned");

        let mut dead: Vec<SubscriberId> = Vec::new();
        for (id, sender) in subscribers.iter() {
            if sender.is_closed() || sender.try_send(envelope.clone()).is_err() {
                dead.push(*id);
            }
        }

        for id in dead {
            tracing::debug!("Evicting subscriber {}", id);
            subscribers.remove(&id);
        }
    }

    /// Drop every subscriber handle (shutdown path).
    pub fn close_all(&self) {
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .clear();
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broadcaster = Broadcaster::new();
        let (_id, mut rx) = broadcaster.subscribe();

        broadcaster.publish(Event::HostOnline {
            device_id: "localhost".to_string(),
            ip: "127.0.0.1".to_string(),
        });

        let envelope = rx.recv().await.expect("event should arrive");
        assert_eq!(envelope.kind, "host_online");
        assert_eq!(envelope.data["device_id"], "localhost");
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_evicted() {
        let broadcaster = Broadcaster::new();
        let (_id, rx) = broadcaster.subscribe();
        drop(rx);

        broadcaster.publish(Event::ScanStopped {
            range: "10.0.0.0/24".to_string(),
        });
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_is_evicted_not_awaited() {
        let broadcaster = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(1);
        broadcaster.attach(tx.clone());

        // Fill the only slot, the next publish must evict instead of block.
        tx.try_send(Envelope::from(Event::ScanStopped {
            range: "x".to_string(),
        }))
        .unwrap();

        broadcaster.publish(Event::ScanStopped {
            range: "10.0.0.0/24".to_string(),
        });
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::from(Event::ScanProgress {
            percent: 40,
            ip: "192.168.1.7".to_string(),
            result: true,
        });
        assert_eq!(envelope.kind, "scan_progress");
        assert_eq!(envelope.data["percent"], 40);
        assert_eq!(envelope.data["result"], true);

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("type").is_some());
        assert!(json.get("timestamp").is_some());
    }
}
