//! Refresh-Ahead Cache
//!
//! Keyed store of time-boxed JSON payloads. Unexpired entries are
//! served without touching upstream. An entry nearing expiry triggers
//! exactly one background refresh (single-flight). When a refresh
//! fails and an old entry still exists, the old entry is served tagged
//! stale instead of surfacing an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::fetch::FetchError;

// ============================================================================
// Public value types
// ============================================================================

/// How current a served payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Served within its ttl.
    Fresh,
    /// Expired, served because the refresh that should replace it failed.
    Stale,
    /// Unexpired but a forced refresh failed, so the caller got the old value.
    Fallback,
}

/// A payload handed to a caller, with provenance.
#[derive(Debug, Clone)]
pub struct CachedValue {
    /// The payload. Shared, never cloned per caller.
    pub payload: Arc<Value>,
    /// Monotonically increasing per-key version.
    pub version: u64,
    /// Freshness classification at serve time.
    pub freshness: Freshness,
    /// Wall-clock capture time of the payload.
    pub captured_at: DateTime<Utc>,
}

/// Options for a single `get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// Bypass any existing entry and fetch now.
    pub force_refresh: bool,
    /// Override the configured ttl for the stored result.
    pub ttl_override: Option<Duration>,
}

/// Notification sent on the updated side-channel after a successful
/// store.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    /// Cache key that changed.
    pub key: String,
    /// New version of the entry.
    pub version: u64,
    /// The freshly stored payload.
    pub payload: Arc<Value>,
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Ttl applied when the caller does not override it.
    pub default_ttl: Duration,
    /// Fraction of ttl remaining at which a background refresh starts.
    pub refresh_threshold: f64,
    /// Capacity of the updated broadcast channel.
    pub update_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(2),
            refresh_threshold: 0.25,
            update_channel_capacity: 256,
        }
    }
}

// ============================================================================
// Internal entry
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    payload: Arc<Value>,
    version: u64,
    ttl: Duration,
    stored_at: Instant,
    captured_at: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }

    fn needs_refresh(&self, threshold: f64) -> bool {
        let remaining = self.ttl.saturating_sub(self.stored_at.elapsed());
        remaining.as_secs_f64() <= self.ttl.as_secs_f64() * threshold
    }

    fn to_value(&self, freshness: Freshness) -> CachedValue {
        CachedValue {
            payload: Arc::clone(&self.payload),
            version: self.version,
            freshness,
            captured_at: self.captured_at,
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Refresh-ahead cache over JSON payloads.
///
/// Shared via `Arc`; background refreshes are spawned from the shared
/// handle and never block the caller that triggered them.
#[derive(Debug)]
pub struct RefreshAheadCache {
    config: CacheConfig,
    entries: RwLock<HashMap<String, Entry>>,
    /// Per-key flight locks. Holding the inner lock means "I am the
    /// one fetch for this key right now".
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    updated_tx: broadcast::Sender<CacheUpdate>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

impl RefreshAheadCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let (updated_tx, _) = broadcast::channel(config.update_channel_capacity);
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            updated_tx,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
        }
    }

    /// Subscribe to per-key update notifications.
    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updated_tx.subscribe()
    }

    /// Get the payload for `key`, fetching through `fetch` when needed.
    ///
    /// Unexpired entries return immediately. An entry inside the
    /// refresh window additionally spawns one background refresh. A
    /// miss (or `force_refresh`) fetches in the foreground under the
    /// key's flight lock, so concurrent callers share one fetch.
    ///
    /// # Errors
    ///
    /// Propagates the fetch error only when no previous entry exists
    /// to fall back on.
    pub async fn get<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        opts: CacheOptions,
        fetch: F,
    ) -> Result<CachedValue, FetchError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let ttl = opts.ttl_override.unwrap_or(self.config.default_ttl);
        let fetch = Arc::new(fetch);

        if !opts.force_refresh
            && let Some(entry) = self.read_entry(key)
            && !entry.is_expired()
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if entry.needs_refresh(self.config.refresh_threshold) {
                self.spawn_refresh(key.to_string(), ttl, Arc::clone(&fetch));
            }
            return Ok(entry.to_value(Freshness::Fresh));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let flight = self.flight_lock(key);
        let guard = flight.lock().await;

        // Another caller may have finished the fetch while we waited.
        if let Some(entry) = self.read_entry(key)
            && !entry.is_expired()
            && entry.stored_at >= started
        {
            drop(guard);
            self.release_flight(key, &flight);
            return Ok(entry.to_value(Freshness::Fresh));
        }

        let result = match fetch().await {
            Ok(payload) => {
                let entry = self.store(key, payload, ttl);
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                Ok(entry.to_value(Freshness::Fresh))
            }
            Err(error) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                match self.read_entry(key) {
                    Some(entry) => {
                        self.stale_served.fetch_add(1, Ordering::Relaxed);
                        let freshness = if entry.is_expired() {
                            Freshness::Stale
                        } else {
                            Freshness::Fallback
                        };
                        tracing::warn!(
                            key,
                            error = %error,
                            freshness = ?freshness,
                            "Fetch failed, serving previous entry"
                        );
                        Ok(entry.to_value(freshness))
                    }
                    None => Err(error),
                }
            }
        };
        drop(guard);
        self.release_flight(key, &flight);
        result
    }

    /// Get several keys in one batched upstream read.
    ///
    /// Unexpired entries are served from memory. The remaining keys go
    /// to `fetch_batch` in a single call; keys the batch did not cover
    /// fall back to stale entries where possible. Near-expiry hits
    /// refresh in one background batch.
    ///
    /// # Errors
    ///
    /// Propagates the batch fetch error only when none of the missing
    /// keys have a fallback entry.
    pub async fn get_batch<F, Fut>(
        self: &Arc<Self>,
        keys: &[String],
        opts: CacheOptions,
        fetch_batch: F,
    ) -> Result<HashMap<String, CachedValue>, FetchError>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<(String, Value)>, FetchError>> + Send + 'static,
    {
        let ttl = opts.ttl_override.unwrap_or(self.config.default_ttl);
        let fetch_batch = Arc::new(fetch_batch);

        let mut served = HashMap::new();
        let mut missing = Vec::new();
        let mut refresh_keys = Vec::new();

        for key in keys {
            match self.read_entry(key) {
                Some(entry) if !entry.is_expired() && !opts.force_refresh => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    if entry.needs_refresh(self.config.refresh_threshold) {
                        refresh_keys.push(key.clone());
                    }
                    served.insert(key.clone(), entry.to_value(Freshness::Fresh));
                }
                _ => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    missing.push(key.clone());
                }
            }
        }

        if !refresh_keys.is_empty() {
            self.spawn_batch_refresh(refresh_keys, ttl, Arc::clone(&fetch_batch));
        }

        if missing.is_empty() {
            return Ok(served);
        }

        match fetch_batch(missing.clone()).await {
            Ok(results) => {
                let mut fetched: HashMap<String, Value> = results.into_iter().collect();
                for key in &missing {
                    if let Some(payload) = fetched.remove(key) {
                        let entry = self.store(key, payload, ttl);
                        self.refreshes.fetch_add(1, Ordering::Relaxed);
                        served.insert(key.clone(), entry.to_value(Freshness::Fresh));
                    } else if let Some(entry) = self.read_entry(key) {
                        self.stale_served.fetch_add(1, Ordering::Relaxed);
                        served.insert(key.clone(), entry.to_value(Freshness::Stale));
                    }
                }
                Ok(served)
            }
            Err(error) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                let mut any_fallback = false;
                for key in &missing {
                    if let Some(entry) = self.read_entry(key) {
                        self.stale_served.fetch_add(1, Ordering::Relaxed);
                        served.insert(key.clone(), entry.to_value(Freshness::Stale));
                        any_fallback = true;
                    }
                }
                if served.is_empty() && !any_fallback {
                    return Err(error);
                }
                tracing::warn!(
                    error = %error,
                    missing = missing.len(),
                    "Batch fetch failed, serving what the cache holds"
                );
                Ok(served)
            }
        }
    }

    /// Drop the entry for `key`, if any, along with its idle flight
    /// lock.
    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
        let mut flights = self.flights.lock();
        // One handle means only the map holds it; no fetch in flight.
        let idle = flights
            .get(key)
            .is_some_and(|flight| Arc::strong_count(flight) == 1);
        if idle {
            flights.remove(key);
        }
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Counter snapshot for diagnostics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }

    fn read_entry(&self, key: &str) -> Option<Entry> {
        self.entries.read().get(key).cloned()
    }

    fn flight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock();
        Arc::clone(
            flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Remove `key`'s flight lock once no other caller holds or awaits
    /// it, keeping the map proportional to in-flight keys.
    fn release_flight(&self, key: &str, flight: &Arc<tokio::sync::Mutex<()>>) {
        let mut flights = self.flights.lock();
        // Two handles left means the map's and ours; clones only leave
        // the map under this lock, so the count cannot grow under us.
        if Arc::strong_count(flight) == 2 {
            flights.remove(key);
        }
    }

    fn store(&self, key: &str, payload: Value, ttl: Duration) -> Entry {
        let payload = Arc::new(payload);
        let mut entries = self.entries.write();
        let version = entries.get(key).map_or(1, |entry| entry.version + 1);
        let entry = Entry {
            payload: Arc::clone(&payload),
            version,
            ttl,
            stored_at: Instant::now(),
            captured_at: Utc::now(),
        };
        entries.insert(key.to_string(), entry.clone());
        drop(entries);

        let _ = self.updated_tx.send(CacheUpdate {
            key: key.to_string(),
            version,
            payload,
        });
        entry
    }

    fn spawn_refresh<F, Fut>(self: &Arc<Self>, key: String, ttl: Duration, fetch: Arc<F>)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let flight = cache.flight_lock(&key);
            // A held flight lock means a refresh is already running.
            let Ok(guard) = flight.try_lock() else {
                return;
            };

            // Re-check under the lock; an earlier flight may have
            // already pushed the entry out of the refresh window.
            let skip = cache
                .read_entry(&key)
                .is_some_and(|entry| !entry.needs_refresh(cache.config.refresh_threshold));
            if !skip {
                match fetch().await {
                    Ok(payload) => {
                        cache.store(&key, payload, ttl);
                        cache.refreshes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        cache.refresh_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(key = %key, error = %error, "Background refresh failed");
                    }
                }
            }
            drop(guard);
            cache.release_flight(&key, &flight);
        });
    }

    fn spawn_batch_refresh<F, Fut>(self: &Arc<Self>, keys: Vec<String>, ttl: Duration, fetch: Arc<F>)
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<(String, Value)>, FetchError>> + Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            // Refresh only the keys whose flight lock is free.
            let mut flights = Vec::new();
            let mut due = Vec::new();
            for key in keys {
                let flight = cache.flight_lock(&key);
                if let Ok(guard) = Arc::clone(&flight).try_lock_owned() {
                    flights.push((key.clone(), flight, guard));
                    due.push(key);
                }
            }
            if due.is_empty() {
                return;
            }

            match fetch(due.clone()).await {
                Ok(results) => {
                    for (key, payload) in results {
                        cache.store(&key, payload, ttl);
                        cache.refreshes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(error) => {
                    cache.refresh_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = %error,
                        keys = due.len(),
                        "Background batch refresh failed"
                    );
                }
            }

            for (key, flight, guard) in flights {
                drop(guard);
                cache.release_flight(&key, &flight);
            }
        });
    }
}

/// Counter snapshot of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Stored entries, expired ones included.
    pub entries: usize,
    /// Serves answered from an unexpired entry.
    pub hits: u64,
    /// Serves that had to fetch.
    pub misses: u64,
    /// Serves answered from an expired or superseded entry.
    pub stale_served: u64,
    /// Successful fetch-and-store operations.
    pub refreshes: u64,
    /// Failed fetch attempts.
    pub refresh_failures: u64,
}
