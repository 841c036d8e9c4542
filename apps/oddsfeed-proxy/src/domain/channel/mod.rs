//! Channel and Data Kind Types
//!
//! A channel is the logical topic that groups subscribers interested in the
//! same entity and data kind (`odds:match-123`), or in a kind-wide global
//! feed (`fixtures`). Channels are the unit of fan-out: the publisher polls
//! once per active channel and delivers to every subscriber of it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

// =============================================================================
// Data Kinds
// =============================================================================

/// The kind of upstream data a channel carries.
///
/// Each kind has its own polling cadence, cache TTL, and rate budget, so a
/// failing scorecard feed never throttles odds for the same match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    /// Betting odds for a match. Fast-changing, polled aggressively.
    Odds,
    /// Live scorecard state for a match.
    Scorecard,
    /// Fixture lists and match metadata. Slow-changing.
    Fixtures,
}

impl DataKind {
    /// Get all data kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Odds, Self::Scorecard, Self::Fixtures]
    }

    /// Stable string form, used as channel prefix and resource key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Odds => "odds",
            Self::Scorecard => "scorecard",
            Self::Fixtures => "fixtures",
        }
    }

    /// Parse a kind from its string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "odds" => Some(Self::Odds),
            "scorecard" => Some(Self::Scorecard),
            "fixtures" => Some(Self::Fixtures),
            _ => None,
        }
    }

    /// Default publisher tick cadence for this kind.
    #[must_use]
    pub const fn default_tick(self) -> Duration {
        match self {
            Self::Odds => Duration::from_secs(1),
            Self::Scorecard => Duration::from_secs(30),
            Self::Fixtures => Duration::from_secs(120),
        }
    }

    /// Default cache TTL for this kind.
    #[must_use]
    pub const fn default_ttl(self) -> Duration {
        match self {
            Self::Odds => Duration::from_secs(2),
            Self::Scorecard => Duration::from_secs(60),
            Self::Fixtures => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Channels
// =============================================================================

/// A logical topic: entity-scoped (`odds:match-123`) or kind-global
/// (`fixtures`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel {
    kind: DataKind,
    entity: Option<String>,
}

impl Channel {
    /// Create an entity-scoped channel.
    #[must_use]
    pub fn entity(kind: DataKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity: Some(entity_id.into()),
        }
    }

    /// Create the global channel for a kind.
    #[must_use]
    pub const fn global(kind: DataKind) -> Self {
        Self { kind, entity: None }
    }

    /// Parse a channel from its wire form (`kind` or `kind:entityId`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once(':') {
            Some((kind, entity)) if !entity.is_empty() => {
                DataKind::parse(kind).map(|k| Self::entity(k, entity))
            }
            Some(_) => None,
            None => DataKind::parse(s).map(Self::global),
        }
    }

    /// The data kind this channel carries.
    #[must_use]
    pub const fn kind(&self) -> DataKind {
        self.kind
    }

    /// The entity id, if the channel is entity-scoped.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    /// Whether this is a kind-global channel.
    #[must_use]
    pub const fn is_global(&self) -> bool {
        self.entity.is_none()
    }

    /// Cache key for this channel. Global channels share a reserved key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.to_string()
    }

    /// Backoff-tracker entity key. Global channels use a reserved id so a
    /// failing global poll cools down independently of any real entity.
    #[must_use]
    pub fn backoff_entity(&self) -> &str {
        self.entity.as_deref().unwrap_or("_global")
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}:{entity}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

// =============================================================================
// Channel Delivery State
// =============================================================================

/// Per-channel delivery state owned by the publisher.
///
/// Updated only after a successful push, so concurrent ticks of different
/// kinds never race on it.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    /// Content hash of the last payload delivered to subscribers.
    pub last_hash: Option<String>,
    /// When the last delivery happened.
    pub last_delivered_at: Option<DateTime<Utc>>,
    /// Total deliveries on this channel.
    pub deliveries: u64,
}

/// Stable content hash of a payload, used for push deduplication.
///
/// Two byte-identical JSON payloads always hash equal; subscribers only see
/// a push when the hash changes.
#[must_use]
pub fn content_hash(payload: &Value) -> String {
    use fmt::Write;

    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
