//! Fixed-window rate limiting
//!
//! Counters live behind the [`CounterStore`] trait. Two stores ship with the
//! crate: [`InMemoryCounterStore`] for single-process deployments and
//! [`SharedCounterStore`], which delegates to a host-supplied atomic counter
//! backend so several processes share one budget.
//!
//! A store failure never blocks traffic: the limiter logs it and allows the call.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::classifier::AppError;
use crate::clock::{add_duration, elapsed_between, Clock};
use crate::error::{ResilienceError, ResilienceResult};

/// Counter value after an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

/// Keyed fixed-window counter storage
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Increment the counter for `key`, starting a new window when the current one has elapsed
    async fn increment(&self, key: &str, window: Duration) -> ResilienceResult<WindowCount>;

    /// Drop the counter for `key` in its current window
    async fn reset(&self, key: &str, window: Duration) -> ResilienceResult<()>;

    /// Remove windows that have elapsed, returning how many were removed
    async fn sweep(&self) -> ResilienceResult<usize> {
        Ok(0)
    }

    fn name(&self) -> &str;
}

/// Minimal atomic counter interface a shared store must offer
#[async_trait]
pub trait AtomicCounterBackend: Send + Sync + std::fmt::Debug {
    /// Atomically increment `key`, creating it at 1
    async fn increment(&self, key: &str) -> ResilienceResult<u64>;

    /// Expire `key` after `seconds`
    async fn expire(&self, key: &str, seconds: u64) -> ResilienceResult<()>;

    /// Delete `key`; backends that cannot delete report an error
    async fn delete(&self, key: &str) -> ResilienceResult<()> {
        Err(ResilienceError::counter_store(format!(
            "backend does not support deleting '{}'",
            key
        )))
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// Per-process counter store
///
/// A window starts on first use of a key and ends `window` later.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    windows: DashMap<String, WindowState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> ResilienceResult<WindowCount> {
        let now = self.clock.now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(WindowState {
            count: 0,
            reset_at: add_duration(now, window),
        });

        let state = entry.value_mut();
        if now > state.reset_at {
            state.count = 1;
            state.reset_at = add_duration(now, window);
        } else {
            state.count = state.count.saturating_add(1);
        }

        Ok(WindowCount {
            count: state.count,
            reset_at: state.reset_at,
        })
    }

    async fn reset(&self, key: &str, _window: Duration) -> ResilienceResult<()> {
        self.windows.remove(key);
        Ok(())
    }

    async fn sweep(&self) -> ResilienceResult<usize> {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, state| now <= state.reset_at);
        Ok(before.saturating_sub(self.windows.len()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Counter store over a shared atomic backend
///
/// Windows are aligned to the epoch so every process computes the same bucket
/// for a given instant.
#[derive(Debug)]
pub struct SharedCounterStore {
    backend: Arc<dyn AtomicCounterBackend>,
    clock: Arc<dyn Clock>,
    namespace: String,
}

impl SharedCounterStore {
    pub fn new(backend: Arc<dyn AtomicCounterBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            namespace: "ratelimit".to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn bucket(&self, now: DateTime<Utc>, window: Duration) -> (i64, DateTime<Utc>) {
        let window_ms = (window.as_millis() as i64).max(1);
        let bucket = now.timestamp_millis().div_euclid(window_ms);
        let reset_ms = bucket.saturating_add(1).saturating_mul(window_ms);
        let reset_at = Utc
            .timestamp_millis_opt(reset_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (bucket, reset_at)
    }

    fn storage_key(&self, key: &str, bucket: i64) -> String {
        format!("{}:{}:{}", self.namespace, key, bucket)
    }
}

#[async_trait]
impl CounterStore for SharedCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> ResilienceResult<WindowCount> {
        let now = self.clock.now();
        let (bucket, reset_at) = self.bucket(now, window);
        let storage_key = self.storage_key(key, bucket);

        let count = self.backend.increment(&storage_key).await?;
        if count == 1 {
            let seconds = window.as_secs() + u64::from(window.subsec_nanos() > 0);
            self.backend.expire(&storage_key, seconds.max(1)).await?;
        }

        Ok(WindowCount { count, reset_at })
    }

    async fn reset(&self, key: &str, window: Duration) -> ResilienceResult<()> {
        let (bucket, _) = self.bucket(self.clock.now(), window);
        let storage_key = self.storage_key(key, bucket);
        debug!(key = %storage_key, "Resetting shared rate-limit counter");
        self.backend.delete(&storage_key).await
    }

    fn name(&self) -> &str {
        "shared"
    }
}

/// Limit for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u64,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_requests == 0 {
            return Err(ResilienceError::invalid_config(
                "rate limit max_requests must be at least 1",
            ));
        }
        if self.window < Duration::from_secs(1) {
            return Err(ResilienceError::invalid_config(
                "rate limit window must be at least one second",
            ));
        }
        Ok(())
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub key: String,
    pub allowed: bool,
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Set only when the call was denied
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// `RATE_LIMITED` error for a denied call
    pub fn into_error(self) -> Option<AppError> {
        if self.allowed {
            return None;
        }
        let retry_after = self.retry_after.unwrap_or(Duration::from_secs(1));
        Some(AppError::rate_limited(&self.key, retry_after))
    }

    /// Seconds until the window resets, as reported to clients
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs())
    }
}

/// Fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    default_rule: RateLimitRule,
    overrides: RwLock<Vec<(String, RateLimitRule)>>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        default_rule: RateLimitRule,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            default_rule,
            overrides: RwLock::new(Vec::new()),
            clock,
            audit,
        }
    }

    /// Apply `rule` to every key starting with `prefix`; the longest matching prefix wins
    pub fn set_rule(&self, prefix: impl Into<String>, rule: RateLimitRule) {
        let prefix = prefix.into();
        let mut overrides = self.overrides.write();
        overrides.retain(|(p, _)| *p != prefix);
        overrides.push((prefix, rule));
        overrides.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn remove_rule(&self, prefix: &str) -> bool {
        let mut overrides = self.overrides.write();
        let before = overrides.len();
        overrides.retain(|(p, _)| p != prefix);
        overrides.len() != before
    }

    /// Rule that applies to `key`
    pub fn rule_for(&self, key: &str) -> RateLimitRule {
        self.overrides
            .read()
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, rule)| *rule)
            .unwrap_or(self.default_rule)
    }

    /// Raw counter increment
    pub async fn increment(&self, key: &str, window: Duration) -> ResilienceResult<WindowCount> {
        self.store.increment(key, window).await
    }

    /// Count one call against `key` and decide whether it may proceed
    pub async fn check_limit(&self, key: &str) -> RateLimitDecision {
        let rule = self.rule_for(key);
        let now = self.clock.now();

        let counted = match self.store.increment(key, rule.window).await {
            Ok(counted) => counted,
            Err(e) => {
                warn!(
                    key = key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return RateLimitDecision {
                    key: key.to_string(),
                    allowed: true,
                    count: 0,
                    limit: rule.max_requests,
                    remaining: rule.max_requests,
                    reset_at: add_duration(now, rule.window),
                    retry_after: None,
                };
            }
        };

        let allowed = counted.count <= rule.max_requests;
        let retry_after = if allowed {
            None
        } else {
            let wait = elapsed_between(now, counted.reset_at);
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            Some(Duration::from_secs(secs.max(1)))
        };

        if !allowed {
            debug!(key = key, count = counted.count, limit = rule.max_requests, "Rate limit exceeded");
            self.audit.record(AuditEvent::RateLimited {
                key: key.to_string(),
                count: counted.count,
                limit: rule.max_requests,
            });
        }

        RateLimitDecision {
            key: key.to_string(),
            allowed,
            count: counted.count,
            limit: rule.max_requests,
            remaining: rule.max_requests.saturating_sub(counted.count),
            reset_at: counted.reset_at,
            retry_after,
        }
    }

    /// Clear the counter for `key`
    pub async fn reset(&self, key: &str) -> ResilienceResult<()> {
        let rule = self.rule_for(key);
        self.store.reset(key, rule.window).await
    }

    /// Drop elapsed windows from the store
    pub async fn sweep(&self) -> usize {
        match self.store.sweep().await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "Rate limit sweep failed");
                0
            }
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }
}
