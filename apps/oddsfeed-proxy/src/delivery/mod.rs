//! Delivery Hub
//!
//! Owns the per-connection outbound channels. The publisher hands it a
//! target list and an event; the hub pushes without blocking. A full
//! buffer loses that tick for that connection, a closed receiver gets
//! the connection evicted and reported back to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::channel::Channel;
use crate::domain::subscription::ConnectionId;
use crate::infrastructure::metrics::set_connections;

/// An update pushed to subscribed connections.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    /// Channel the update belongs to.
    pub channel: Channel,
    /// The payload. Shared across all receiving connections.
    pub payload: Arc<Value>,
    /// When the update was published.
    pub timestamp: DateTime<Utc>,
}

/// Registry of connected receivers.
#[derive(Debug, Default)]
pub struct DeliveryHub {
    senders: RwLock<HashMap<ConnectionId, mpsc::Sender<UpdateEvent>>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    lagged: AtomicU64,
    evicted: AtomicU64,
}

impl DeliveryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and hand back its event stream.
    pub fn register(&self, buffer: usize) -> (ConnectionId, mpsc::Receiver<UpdateEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer);
        self.senders.write().insert(id, tx);
        self.publish_connection_gauge();
        tracing::debug!(connection_id = id, "Connection registered");
        (id, rx)
    }

    /// Remove a connection.
    pub fn unregister(&self, connection_id: ConnectionId) {
        if self.senders.write().remove(&connection_id).is_some() {
            self.publish_connection_gauge();
            tracing::debug!(connection_id, "Connection unregistered");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_connection_gauge(&self) {
        set_connections(self.connection_count() as f64);
    }

    /// Connected receivers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// Push `event` to each target connection.
    ///
    /// Never blocks. Returns the ids of connections found closed; they
    /// are already evicted from the hub and the caller should clean up
    /// their subscriptions.
    pub fn deliver(&self, targets: &[ConnectionId], event: &UpdateEvent) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        {
            let senders = self.senders.read();
            for id in targets {
                let Some(sender) = senders.get(id) else {
                    continue;
                };
                match sender.try_send(event.clone()) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Lagging consumer loses this tick only.
                        self.lagged.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            connection_id = id,
                            channel = %event.channel,
                            "Receiver buffer full, tick dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut senders = self.senders.write();
            for id in &dead {
                senders.remove(id);
            }
            self.evicted.fetch_add(dead.len() as u64, Ordering::Relaxed);
            drop(senders);
            self.publish_connection_gauge();
            tracing::info!(count = dead.len(), "Evicted closed connections");
        }
        dead
    }

    /// Counter snapshot for diagnostics.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            connections: self.connection_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the delivery hub.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStats {
    /// Currently connected receivers.
    pub connections: usize,
    /// Events delivered.
    pub delivered: u64,
    /// Events dropped because a receiver buffer was full.
    pub lagged: u64,
    /// Connections evicted after their receiver closed.
    pub evicted: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::channel::DataKind;

    fn event() -> UpdateEvent {
        UpdateEvent {
            channel: Channel::entity(DataKind::Odds, "match-1"),
            payload: Arc::new(json!({"price": 2.0})),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_targets_only() {
        let hub = DeliveryHub::new();
        let (id_a, mut rx_a) = hub.register(8);
        let (id_b, mut rx_b) = hub.register(8);

        let dead = hub.deliver(&[id_a], &event());
        assert!(dead.is_empty());

        let received = rx_a.recv().await.expect("event for a");
        assert_eq!(*received.payload, json!({"price": 2.0}));
        assert!(rx_b.try_recv().is_err());
        let _ = id_b;
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted_and_reported() {
        let hub = DeliveryHub::new();
        let (id, rx) = hub.register(8);
        drop(rx);

        let dead = hub.deliver(&[id], &event());
        assert_eq!(dead, vec![id]);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.stats().evicted, 1);
    }

    #[tokio::test]
    async fn full_buffer_drops_tick_but_keeps_connection() {
        let hub = DeliveryHub::new();
        let (id, mut rx) = hub.register(1);

        assert!(hub.deliver(&[id], &event()).is_empty());
        assert!(hub.deliver(&[id], &event()).is_empty());

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.stats().lagged, 1);

        // The first tick is still there.
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_connection() {
        let hub = DeliveryHub::new();
        let (id, _rx) = hub.register(8);
        hub.unregister(id);
        assert_eq!(hub.connection_count(), 0);
    }
}
