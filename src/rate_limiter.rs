//! In-memory token-bucket rate limiter keyed by client.
//!
//! Each client gets a bucket that refills continuously at `rate` tokens per
//! second up to `burst`. A request withdraws one token. The bucket map is
//! bounded: when it is full, idle buckets are dropped first and then the
//! least recently seen ones.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};

use crate::config::RateLimitConfig;

/// Refill rate and capacity for one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    pub rate: f64,
    pub burst: u32,
}

/// Outcome of [`RateLimiter::allow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Bucket capacity.
    pub limit: u32,
    /// Whole tokens left after this request.
    pub remaining: u32,
    /// Seconds until the next token is available. Zero when a token is left.
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct TokenBucket {
    limits: BucketLimits,
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(limits: BucketLimits, now: Instant) -> Self {
        Self {
            limits,
            tokens: limits.burst as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Instants have nanosecond resolution, so a wait of exactly `1/rate`
    /// seconds can fall short of a whole token by up to one nanosecond of
    /// refill. That shortfall still counts as a token.
    fn has_token(&self) -> bool {
        self.tokens >= 1.0 - (self.limits.rate * 1e-9 + f64::EPSILON)
    }

    fn try_acquire(&mut self, now: Instant) -> RateLimitDecision {
        let burst = self.limits.burst as f64;
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limits.rate).min(burst);
        self.last_refill = self.last_refill.max(now);
        self.last_seen = self.last_seen.max(now);

        let allowed = self.has_token();
        if allowed {
            self.tokens = (self.tokens - 1.0).max(0.0);
        }

        let retry_after_secs = if self.has_token() {
            0
        } else {
            (((1.0 - self.tokens) / self.limits.rate).ceil() as u64).max(1)
        };

        RateLimitDecision {
            allowed,
            limit: self.limits.burst,
            remaining: self.tokens.floor() as u32,
            retry_after_secs,
        }
    }
}

/// Per-client token-bucket rate limiter.
///
/// Lookups share the map's read lock; only inserting a new client or
/// evicting takes the write lock. A withdrawal locks just its own bucket.
pub struct RateLimiter {
    defaults: BucketLimits,
    overrides: RwLock<HashMap<String, BucketLimits>>,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    max_clients: usize,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(defaults: BucketLimits, max_clients: usize, idle_ttl: Duration) -> Self {
        Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            max_clients: max_clients.max(1),
            idle_ttl,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let limiter = Self::new(
            BucketLimits {
                rate: config.requests_per_second,
                burst: config.burst,
            },
            config.max_clients,
            Duration::from_secs(config.idle_ttl_secs),
        );
        for (client, limit) in &config.clients {
            limiter.register_client(client, limit.requests_per_second, limit.burst);
        }
        limiter
    }

    /// Withdraw one token for `client`, provisioning its bucket on first sight.
    pub fn allow(&self, client: &str) -> RateLimitDecision {
        self.allow_at(client, Instant::now())
    }

    pub fn allow_at(&self, client: &str, now: Instant) -> RateLimitDecision {
        let existing = self.buckets.read().get(client).cloned();
        let bucket = match existing {
            Some(bucket) => bucket,
            None => self.insert_bucket(client, now),
        };
        bucket.lock().try_acquire(now)
    }

    /// Set explicit limits for `client`. Any existing bucket is replaced with a full one.
    pub fn register_client(&self, client: &str, rate: f64, burst: u32) {
        let limits = BucketLimits { rate, burst };
        self.overrides.write().insert(client.to_string(), limits);

        let mut buckets = self.buckets.write();
        if buckets.contains_key(client) {
            buckets.insert(
                client.to_string(),
                Arc::new(Mutex::new(TokenBucket::new(limits, Instant::now()))),
            );
        }
    }

    /// Drop buckets not seen within the idle TTL. Returns how many were removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| !self.is_idle(&bucket.lock(), now));
        before - buckets.len()
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn limits_for(&self, client: &str) -> BucketLimits {
        self.overrides
            .read()
            .get(client)
            .copied()
            .unwrap_or(self.defaults)
    }

    fn is_idle(&self, bucket: &TokenBucket, now: Instant) -> bool {
        now.saturating_duration_since(bucket.last_seen) >= self.idle_ttl
    }

    fn insert_bucket(&self, client: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        let limits = self.limits_for(client);
        let mut buckets = self.buckets.write();

        // Another request may have inserted it while we waited for the lock
        if let Some(bucket) = buckets.get(client) {
            return bucket.clone();
        }

        if buckets.len() >= self.max_clients {
            self.evict(&mut buckets, now);
        }

        let bucket = Arc::new(Mutex::new(TokenBucket::new(limits, now)));
        buckets.insert(client.to_string(), bucket.clone());
        bucket
    }

    /// Make room for at least one new bucket.
    fn evict(&self, buckets: &mut HashMap<String, Arc<Mutex<TokenBucket>>>, now: Instant) {
        let before = buckets.len();
        buckets.retain(|_, bucket| !self.is_idle(&bucket.lock(), now));

        if buckets.len() >= self.max_clients {
            // Evict in batches so a full map does not re-sort on every insert
            let batch = (self.max_clients / 100).max(1);
            let excess = buckets.len() + 1 - self.max_clients;
            let count = excess.max(batch).min(buckets.len());

            let mut by_age: Vec<(Instant, String)> = buckets
                .iter()
                .map(|(key, bucket)| (bucket.lock().last_seen, key.clone()))
                .collect();
            by_age.select_nth_unstable_by_key(count - 1, |(seen, _)| *seen);
            for (_, key) in by_age.into_iter().take(count) {
                buckets.remove(&key);
            }
        }

        tracing::debug!(
            evicted = before - buckets.len(),
            remaining = buckets.len(),
            "Evicted rate limit buckets"
        );
    }
}
