//! Token Bucket
//!
//! Continuous-refill token bucket used as the per-resource rate budget.
//! Refill is computed lazily from elapsed time on each check; no background
//! timer is involved.

use std::time::Instant;

/// Configuration for a single rate budget.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    /// Maximum tokens the bucket can hold.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl RateBudget {
    /// Create a new budget.
    #[must_use]
    pub const fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 10.0,
        }
    }
}

/// A token bucket. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket from a budget.
    #[must_use]
    pub fn new(budget: RateBudget) -> Self {
        Self {
            capacity: f64::from(budget.capacity),
            refill_per_sec: budget.refill_per_sec,
            tokens: f64::from(budget.capacity),
            last_refill: Instant::now(),
        }
    }

    /// Take `n` tokens if available. Non-blocking.
    pub fn try_acquire(&mut self, n: u32) -> bool {
        self.refill();
        let needed = f64::from(n);
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after lazy refill.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }
}
