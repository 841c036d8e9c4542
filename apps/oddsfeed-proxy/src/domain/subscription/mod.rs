//! Subscription Registry
//!
//! Tracks, for every real-time connection, which channels it is interested
//! in, and reference-counts interest per channel.
//!
//! # Design
//!
//! A channel is "active" iff its subscriber set is non-empty. The Fan-Out
//! Publisher reads `active_channels` before doing any work, so entities
//! nobody is watching are never polled: this is the primary backpressure
//! mechanism protecting upstream rate budgets, and the primary scalability
//! lever when connection counts are high (polling cost is bounded by
//! distinct active channels, not by connections).

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::channel::{Channel, DataKind};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a real-time connection.
pub type ConnectionId = u64;

// =============================================================================
// Per-kind Subscription State
// =============================================================================

/// Tracks connection↔channel edges for a single data kind.
#[derive(Debug, Default)]
struct KindSubscriptionState {
    /// Map from connection id to the channels it subscribes to.
    connection_channels: HashMap<ConnectionId, HashSet<Channel>>,
    /// Map from channel to its subscriber set.
    channel_subscribers: HashMap<Channel, HashSet<ConnectionId>>,
}

impl KindSubscriptionState {
    /// Add a subscription edge.
    ///
    /// Returns true if the channel went inactive→active (subscriber count
    /// 0→1).
    fn add(&mut self, connection: ConnectionId, channel: &Channel) -> bool {
        let channels = self.connection_channels.entry(connection).or_default();
        if !channels.insert(channel.clone()) {
            // Connection was already subscribed.
            return false;
        }

        let subscribers = self.channel_subscribers.entry(channel.clone()).or_default();
        subscribers.insert(connection);
        subscribers.len() == 1
    }

    /// Remove a subscription edge.
    ///
    /// Returns true if the channel went active→inactive (last subscriber
    /// removed).
    fn remove(&mut self, connection: ConnectionId, channel: &Channel) -> bool {
        let Some(channels) = self.connection_channels.get_mut(&connection) else {
            return false;
        };
        if !channels.remove(channel) {
            return false;
        }
        if channels.is_empty() {
            self.connection_channels.remove(&connection);
        }

        if let Some(subscribers) = self.channel_subscribers.get_mut(channel) {
            subscribers.remove(&connection);
            if subscribers.is_empty() {
                self.channel_subscribers.remove(channel);
                return true;
            }
        }
        false
    }

    /// Remove all edges for a connection.
    ///
    /// Returns the channels that went inactive.
    fn remove_connection(&mut self, connection: ConnectionId) -> Vec<Channel> {
        let Some(channels) = self.connection_channels.remove(&connection) else {
            return vec![];
        };

        let mut deactivated = Vec::new();
        for channel in channels {
            if let Some(subscribers) = self.channel_subscribers.get_mut(&channel) {
                subscribers.remove(&connection);
                if subscribers.is_empty() {
                    self.channel_subscribers.remove(&channel);
                    deactivated.push(channel);
                }
            }
        }
        deactivated
    }

    fn active_channels(&self) -> Vec<Channel> {
        self.channel_subscribers.keys().cloned().collect()
    }

    fn subscribers(&self, channel: &Channel) -> Vec<ConnectionId> {
        self.channel_subscribers
            .get(channel)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channel_subscribers
            .get(channel)
            .map_or(0, HashSet::len)
    }

    fn channel_count(&self) -> usize {
        self.channel_subscribers.len()
    }

    fn connection_count(&self) -> usize {
        self.connection_channels.len()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of connection↔channel subscription edges.
///
/// State is split per data kind behind independent locks so odds churn
/// never contends with scorecard reads.
///
/// # Example
///
/// ```rust
/// use oddsfeed_proxy::domain::channel::{Channel, DataKind};
/// use oddsfeed_proxy::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
/// let channel = Channel::entity(DataKind::Odds, "match-123");
///
/// registry.subscribe(1, &channel);
/// assert_eq!(registry.subscriber_count(&channel), 1);
///
/// registry.connection_closed(1);
/// assert_eq!(registry.subscriber_count(&channel), 0);
/// ```
pub struct SubscriptionRegistry {
    odds: RwLock<KindSubscriptionState>,
    scorecard: RwLock<KindSubscriptionState>,
    fixtures: RwLock<KindSubscriptionState>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            odds: RwLock::new(KindSubscriptionState::default()),
            scorecard: RwLock::new(KindSubscriptionState::default()),
            fixtures: RwLock::new(KindSubscriptionState::default()),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Returns true if the channel went inactive→active.
    pub fn subscribe(&self, connection: ConnectionId, channel: &Channel) -> bool {
        self.state_for(channel.kind()).write().add(connection, channel)
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns true if the channel went active→inactive.
    pub fn unsubscribe(&self, connection: ConnectionId, channel: &Channel) -> bool {
        self.state_for(channel.kind())
            .write()
            .remove(connection, channel)
    }

    /// Handle a closed connection: remove every subscription it held.
    ///
    /// Returns the channels that lost their last subscriber.
    pub fn connection_closed(&self, connection: ConnectionId) -> Vec<Channel> {
        let mut deactivated = Vec::new();
        for kind in DataKind::all() {
            deactivated.extend(self.state_for(*kind).write().remove_connection(connection));
        }
        deactivated
    }

    /// All channels of a kind with at least one subscriber.
    #[must_use]
    pub fn active_channels(&self, kind: DataKind) -> Vec<Channel> {
        self.state_for(kind).read().active_channels()
    }

    /// Subscriber connection ids for a channel.
    #[must_use]
    pub fn subscribers(&self, channel: &Channel) -> Vec<ConnectionId> {
        self.state_for(channel.kind()).read().subscribers(channel)
    }

    /// Number of subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.state_for(channel.kind())
            .read()
            .subscriber_count(channel)
    }

    /// Statistics for one data kind.
    #[must_use]
    pub fn stats(&self, kind: DataKind) -> SubscriptionStats {
        let state = self.state_for(kind).read();
        SubscriptionStats {
            channel_count: state.channel_count(),
            connection_count: state.connection_count(),
        }
    }

    /// Statistics across all data kinds.
    #[must_use]
    pub fn total_stats(&self) -> TotalSubscriptionStats {
        TotalSubscriptionStats {
            odds: self.stats(DataKind::Odds),
            scorecard: self.stats(DataKind::Scorecard),
            fixtures: self.stats(DataKind::Fixtures),
        }
    }

    const fn state_for(&self, kind: DataKind) -> &RwLock<KindSubscriptionState> {
        match kind {
            DataKind::Odds => &self.odds,
            DataKind::Scorecard => &self.scorecard,
            DataKind::Fixtures => &self.fixtures,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for a single data kind.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SubscriptionStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of connections with at least one subscription of this kind.
    pub connection_count: usize,
}

/// Registry statistics across all kinds.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TotalSubscriptionStats {
    /// Odds subscription stats.
    pub odds: SubscriptionStats,
    /// Scorecard subscription stats.
    pub scorecard: SubscriptionStats,
    /// Fixtures subscription stats.
    pub fixtures: SubscriptionStats,
}

impl TotalSubscriptionStats {
    /// Total active channels across all kinds.
    #[must_use]
    pub const fn total_channels(&self) -> usize {
        self.odds.channel_count + self.scorecard.channel_count + self.fixtures.channel_count
    }
}

// =============================================================================
// Tests
// =============================================================================
