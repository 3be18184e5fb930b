//! Per-key token buckets with greedy refill.
//!
//! Tokens trickle back continuously at `capacity / window` per second, never
//! exceeding the capacity. Buckets are created lazily from the default config.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

/// Token bucket size and refill window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Bucket capacity; also the number of tokens refilled per window.
    pub requests: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Current state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub available_tokens: u64,
    pub capacity: u64,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.requests as f64;
        let window = config.window.as_secs_f64();
        Self {
            capacity,
            refill_per_sec: if window > 0.0 { capacity / window } else { capacity },
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, tokens: u64) -> bool {
        self.refill();
        let wanted = tokens as f64;
        if self.tokens >= wanted {
            self.tokens -= wanted;
            true
        } else {
            false
        }
    }

    fn info(&mut self) -> RateLimitInfo {
        self.refill();
        RateLimitInfo {
            available_tokens: self.tokens.floor() as u64,
            capacity: self.capacity as u64,
        }
    }
}

/// Non-blocking admission control keyed by arbitrary strings.
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    default_config: RateLimitConfig,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default_config,
        }
    }

    pub fn default_config(&self) -> &RateLimitConfig {
        &self.default_config
    }

    /// Takes one token from the bucket for `key`.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_consume(key, 1)
    }

    /// Takes `tokens` from the bucket for `key`, returning false without
    /// blocking if not enough are available.
    pub fn try_consume(&self, key: &str, tokens: u64) -> bool {
        let consumed = self.with_bucket(key, |bucket| bucket.try_consume(tokens));
        if !consumed {
            metrics::counter!("rate_limit_exceeded_total", "key" => key.to_string()).increment(1);
            warn!(key = %key, tokens, "Rate limit exceeded");
        }
        consumed
    }

    /// Replaces the bucket for `key` with a full one using `config`.
    pub fn configure(&self, key: &str, config: RateLimitConfig) {
        self.buckets
            .insert(key.to_string(), Mutex::new(Bucket::new(&config)));
    }

    /// Drops the bucket for `key`; the next use starts from the default config.
    pub fn remove(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Returns the bucket state for `key`, creating the bucket if needed.
    pub fn info(&self, key: &str) -> RateLimitInfo {
        self.with_bucket(key, Bucket::info)
    }

    fn with_bucket<R>(&self, key: &str, f: impl FnOnce(&mut Bucket) -> R) -> R {
        if let Some(bucket) = self.buckets.get(key) {
            return f(&mut bucket.lock());
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(&self.default_config)));
        f(&mut bucket.lock())
    }
}
