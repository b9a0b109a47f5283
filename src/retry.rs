//! Retry manager
//!
//! Runs an async operation until it succeeds, fails with an error the policy
//! does not retry, or runs out of attempts. Before each attempt the manager
//! checks cancellation and, when the options carry an operation key, the circuit
//! breaker and then the rate limiter for that key. Delays suspend only the calling
//! task.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{AppError, ErrorClassifier, ErrorContext};
use crate::clock::Clock;
use crate::error::{ResilienceError, ResilienceResult};
use crate::rate_limiter::RateLimiter;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * multiplier^(attempt-1)`
    Exponential,
    /// `base * attempt`
    Linear,
    /// `base`
    Fixed,
    /// `base * fib(attempt)`
    Fibonacci,
}

/// Randomization applied on top of the computed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    /// Uniform in `[0, delay]`
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`
    Equal,
    /// Uniform in `[base, previous * 3]`, capped at the maximum delay
    Decorrelated,
}

/// Caller-supplied override of the retry decision
pub trait RetryPredicate: Send + Sync {
    fn should_retry(&self, error: &AppError, attempt: u32) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&AppError, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &AppError, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Retry policy
#[derive(Clone)]
pub struct RetryOptions {
    pub strategy: BackoffStrategy,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub jitter_kind: JitterKind,
    /// Per-attempt time budget
    pub timeout: Option<Duration>,
    /// Operation key used for rate limiting, circuit breaking and metrics
    pub key: Option<String>,
    /// Context attached to every normalized failure
    pub context: Option<ErrorContext>,
    pub retry_if: Option<Arc<dyn RetryPredicate>>,
    pub cancellation: Option<CancellationToken>,
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("strategy", &self.strategy)
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("jitter_kind", &self.jitter_kind)
            .field("timeout", &self.timeout)
            .field("key", &self.key)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "<predicate>"))
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            jitter_kind: JitterKind::Full,
            timeout: None,
            key: None,
            context: None,
            retry_if: None,
            cancellation: None,
        }
    }
}

impl RetryOptions {
    /// Network calls
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Database queries
    pub fn database() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_kind: JitterKind::Equal,
            ..Default::default()
        }
    }

    /// File uploads and local file access
    pub fn file_operations() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            max_retries: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        }
    }

    /// Third-party APIs such as OCR and AI coding services
    pub fn external_api() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_kind: JitterKind::Decorrelated,
            ..Default::default()
        }
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, kind: JitterKind) -> Self {
        self.jitter = true;
        self.jitter_kind = kind;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn retry_if(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::invalid_config(format!(
                "max_delay ({}ms) must be at least base_delay ({}ms)",
                self.max_delay.as_millis(),
                self.base_delay.as_millis()
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResilienceError::invalid_config(
                "backoff multiplier must be a finite number >= 1",
            ));
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(ResilienceError::invalid_config(
                    "attempt timeout must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt `attempt`, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
                if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.max_delay
                }
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Fibonacci => {
                let factor = u32::try_from(fibonacci(attempt)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Apply the configured jitter to `delay`
    ///
    /// `previous` is the delay actually slept before the last attempt, used by
    /// decorrelated jitter.
    pub fn apply_jitter(&self, delay: Duration, previous: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }

        let mut rng = rand::thread_rng();
        match self.jitter_kind {
            JitterKind::Full => uniform(&mut rng, Duration::ZERO, delay),
            JitterKind::Equal => {
                let half = delay / 2;
                half + uniform(&mut rng, Duration::ZERO, delay - half)
            }
            JitterKind::Decorrelated => {
                let low = self.base_delay;
                let high = previous.max(self.base_delay).saturating_mul(3);
                uniform(&mut rng, low, high).min(self.max_delay)
            }
        }
    }
}

fn uniform(rng: &mut impl Rng, low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let secs = rng.gen_range(low.as_secs_f64()..=high.as_secs_f64());
    Duration::try_from_secs_f64(secs)
        .unwrap_or(high)
        .clamp(low, high)
}

/// fib(1) = 1, fib(2) = 1, fib(3) = 2, ...
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryResult<T> {
    pub outcome: Result<T, AppError>,
    /// Attempts actually made
    pub attempts: u32,
    pub elapsed: Duration,
    /// Stopped by cancellation rather than by success or a terminal error
    pub aborted: bool,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&AppError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, AppError> {
        self.outcome
    }

    /// The cancellation check opens an attempt, so at least one is reported
    fn cancelled_after(attempts: u32, started: Instant, error: AppError) -> Self {
        Self {
            outcome: Err(error),
            attempts: attempts.max(1),
            elapsed: started.elapsed(),
            aborted: true,
        }
    }
}

/// Rolling statistics for one operation key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_attempts: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub success_rate: f64,
    pub average_attempts: f64,
    pub last_operation: Option<DateTime<Utc>>,
}

impl OperationMetrics {
    fn record(&mut self, success: bool, attempts: u32, duration: Duration, at: DateTime<Utc>) {
        self.total_operations += 1;
        if success {
            self.successful_operations += 1;
        } else {
            self.failed_operations += 1;
        }
        self.total_attempts += u64::from(attempts);
        self.total_duration = self.total_duration.saturating_add(duration);
        self.last_operation = Some(at);
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.total_operations == 0 {
            self.average_duration = Duration::ZERO;
            self.success_rate = 0.0;
            self.average_attempts = 0.0;
            return;
        }
        let total = self.total_operations as f64;
        self.average_duration = self.total_duration.div_f64(total);
        self.success_rate = self.successful_operations as f64 / total;
        self.average_attempts = self.total_attempts as f64 / total;
    }
}

/// Bounds for [`RetryManager::execute_batch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Operations in flight at once
    pub concurrency: usize,
    /// Stop starting new operations once one fails for good
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fail_fast: false,
        }
    }
}

const UNKEYED_OPERATION: &str = "unkeyed";

/// Executes operations under a retry policy
#[derive(Debug)]
pub struct RetryManager {
    defaults: RetryOptions,
    classifier: ErrorClassifier,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    limiter: Option<Arc<RateLimiter>>,
    metrics: DashMap<String, Arc<Mutex<OperationMetrics>>>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl RetryManager {
    pub fn new(defaults: RetryOptions, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            defaults,
            classifier: ErrorClassifier::with_clock(clock.clone()),
            breakers: None,
            limiter: None,
            metrics: DashMap::new(),
            clock,
            audit,
        }
    }

    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Policy used by [`RetryManager::execute_default`]
    pub fn defaults(&self) -> &RetryOptions {
        &self.defaults
    }

    /// Run `operation` with the manager's default policy
    pub async fn execute_default<F, Fut, T, E>(&self, operation: F) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let options = self.defaults.clone();
        self.execute(operation, &options).await
    }

    /// Run `operation` under `options`
    pub async fn execute<F, Fut, T, E>(&self, operation: F, options: &RetryOptions) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = Instant::now();
        let key = options.key.as_deref();
        let metrics_key = key.unwrap_or(UNKEYED_OPERATION);
        let mut previous_delay = options.base_delay;
        let mut attempt: u32 = 0;

        loop {
            if is_cancelled(options) {
                debug!(key = metrics_key, attempt, "Operation cancelled before attempt");
                let result = RetryResult::cancelled_after(attempt, started, AppError::cancelled());
                self.finish(metrics_key, &result);
                return result;
            }

            attempt += 1;
            let outcome = self.attempt(&operation, options, key).await;

            let error = match outcome {
                Ok(value) => {
                    let result = RetryResult {
                        outcome: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        aborted: false,
                    };
                    self.finish(metrics_key, &result);
                    return result;
                }
                Err(error) => error,
            };

            let retry_allowed = match &options.retry_if {
                Some(predicate) => predicate.should_retry(&error, attempt),
                None => error.is_retryable(),
            };

            if attempt > options.max_retries || !retry_allowed {
                let result = RetryResult {
                    outcome: Err(error),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    aborted: false,
                };
                self.finish(metrics_key, &result);
                return result;
            }

            let mut delay = options.apply_jitter(options.delay_for(attempt), previous_delay);
            if let Some(hint) = error.retry_after() {
                delay = delay.max(hint);
            }
            previous_delay = delay;

            warn!(
                operation = metrics_key,
                attempt = attempt,
                max_attempts = options.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error_code = error.code(),
                "Retrying operation after error: {}",
                error
            );
            self.audit.record(AuditEvent::RetryScheduled {
                key: metrics_key.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                code: error.code().to_string(),
            });

            match &options.cancellation {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(key = metrics_key, attempt, "Operation cancelled during backoff");
                            let result = RetryResult::cancelled_after(attempt, started, AppError::cancelled());
                            self.finish(metrics_key, &result);
                            return result;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// One guarded invocation
    async fn attempt<F, Fut, T, E>(
        &self,
        operation: &F,
        options: &RetryOptions,
        key: Option<&str>,
    ) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let context = options.context.as_ref();
        let with_context = |error: AppError| match context {
            Some(ctx) => error.with_context(ctx.clone()),
            None => error,
        };

        // An open circuit rejects before any rate-limit quota is spent
        let guarded_key = match (key, &self.breakers) {
            (Some(key), Some(breakers)) => {
                let permit = breakers.check(key).map_err(&with_context)?;
                Some((key, breakers, permit))
            }
            _ => None,
        };

        if let (Some(key), Some(limiter)) = (key, &self.limiter) {
            let decision = limiter.check_limit(key).await;
            if let Some(denied) = decision.into_error() {
                if let Some((key, breakers, permit)) = guarded_key {
                    if permit.probe {
                        breakers.release_probe(key);
                    }
                }
                return Err(with_context(denied));
            }
        }

        let invocation = operation();
        let result = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result.map_err(|e| self.classifier.normalize(&e, context)),
                Err(_) => Err(with_context(AppError::timeout(limit))),
            },
            None => invocation
                .await
                .map_err(|e| self.classifier.normalize(&e, context)),
        };

        if let Some((key, breakers, _)) = guarded_key {
            match &result {
                Ok(_) => breakers.record_success(key),
                Err(_) => breakers.record_failure(key),
            }
        }

        result
    }

    fn finish<T>(&self, key: &str, result: &RetryResult<T>) {
        let elapsed_ms = result.elapsed.as_millis() as u64;
        match &result.outcome {
            Ok(_) => self.audit.record(AuditEvent::OperationSucceeded {
                key: key.to_string(),
                attempts: result.attempts,
                elapsed_ms,
            }),
            Err(error) => self.audit.record(AuditEvent::OperationFailed {
                key: key.to_string(),
                code: error.code().to_string(),
                attempts: result.attempts,
                elapsed_ms,
                aborted: result.aborted,
            }),
        }

        let entry = self
            .metrics
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OperationMetrics::default())))
            .clone();
        entry
            .lock()
            .record(result.is_success(), result.attempts, result.elapsed, self.clock.now());
    }

    /// Run independent operations with bounded concurrency
    ///
    /// Results keep the input order. With `fail_fast`, operations that had not
    /// started when another one failed for good are reported as aborted after
    /// a single attempt that never invoked them; operations already running
    /// finish normally.
    pub async fn execute_batch<F, Fut, T, E>(
        &self,
        operations: Vec<F>,
        options: &RetryOptions,
        batch: BatchOptions,
    ) -> Vec<RetryResult<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let semaphore = Semaphore::new(batch.concurrency.max(1));
        let failed = AtomicBool::new(false);

        let runs = operations.into_iter().map(|operation| {
            let semaphore = &semaphore;
            let failed = &failed;
            async move {
                let started = Instant::now();
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return RetryResult::cancelled_after(
                            1,
                            started,
                            AppError::internal("batch semaphore closed"),
                        )
                    }
                };

                if batch.fail_fast && failed.load(Ordering::SeqCst) {
                    return RetryResult::cancelled_after(
                        1,
                        started,
                        AppError::cancelled()
                            .with_user_message("The request was skipped after an earlier failure."),
                    );
                }

                let result = self.execute(operation, options).await;
                if !result.is_success() && !result.aborted {
                    failed.store(true, Ordering::SeqCst);
                }
                result
            }
        });

        futures_util::future::join_all(runs).await
    }

    pub fn metrics(&self, key: &str) -> Option<OperationMetrics> {
        self.metrics.get(key).map(|m| m.lock().clone())
    }

    pub fn all_metrics(&self) -> Vec<(String, OperationMetrics)> {
        let mut all: Vec<_> = self
            .metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Clear metrics for one key, or for all keys when `key` is `None`
    pub fn reset_metrics(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.metrics.remove(key);
            }
            None => self.metrics.clear(),
        }
    }
}

fn is_cancelled(options: &RetryOptions) -> bool {
    options
        .cancellation
        .as_ref()
        .map(CancellationToken::is_cancelled)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::classifier::{codes, ErrorCategory};
    use crate::clock::{system_clock, ManualClock};
    use crate::rate_limiter::{InMemoryCounterStore, RateLimitRule};
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, thiserror::Error)]
    enum UploadError {
        #[error("connection reset by peer")]
        Reset,
        #[error("claim form is invalid")]
        Invalid,
    }

    fn manager() -> (RetryManager, MemoryAuditSink) {
        let audit = MemoryAuditSink::new();
        let manager = RetryManager::new(
            RetryOptions::default(),
            system_clock(),
            Arc::new(audit.clone()),
        );
        (manager, audit)
    }

    fn fixed(max_retries: u32) -> RetryOptions {
        RetryOptions::default()
            .strategy(BackoffStrategy::Fixed)
            .max_retries(max_retries)
            .base_delay(Duration::from_millis(100))
            .without_jitter()
    }

    #[test]
    fn test_delay_strategies() {
        let base = RetryOptions::default()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .without_jitter();

        let exp = base.clone().strategy(BackoffStrategy::Exponential);
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(200));
        assert_eq!(exp.delay_for(4), Duration::from_millis(800));
        assert_eq!(exp.delay_for(5), Duration::from_secs(1));
        assert_eq!(exp.delay_for(500), Duration::from_secs(1));

        let linear = base.clone().strategy(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));
        assert_eq!(linear.delay_for(20), Duration::from_secs(1));

        let fixed = base.clone().strategy(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(7), Duration::from_millis(100));

        let fib = base.strategy(BackoffStrategy::Fibonacci);
        assert_eq!(fib.delay_for(1), Duration::from_millis(100));
        assert_eq!(fib.delay_for(2), Duration::from_millis(100));
        assert_eq!(fib.delay_for(3), Duration::from_millis(200));
        assert_eq!(fib.delay_for(5), Duration::from_millis(500));
        assert_eq!(fib.delay_for(90), Duration::from_secs(1));
    }

    #[test]
    fn test_fibonacci() {
        let seq: Vec<u64> = (1..=8).map(fibonacci).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5, 8, 13, 21]);
        assert_eq!(fibonacci(200), u64::MAX);
    }

    #[test]
    fn test_jitter_bounds() {
        let options = RetryOptions::default()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(2));
        let delay = Duration::from_millis(800);

        for _ in 0..200 {
            let full = options.clone().jitter(JitterKind::Full).apply_jitter(delay, delay);
            assert!(full <= delay);

            let equal = options.clone().jitter(JitterKind::Equal).apply_jitter(delay, delay);
            assert!(equal >= delay / 2 && equal <= delay);

            let decorrelated = options
                .clone()
                .jitter(JitterKind::Decorrelated)
                .apply_jitter(delay, delay);
            assert!(decorrelated >= Duration::from_millis(100));
            assert!(decorrelated <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(RetryOptions::default().validate().is_ok());
        assert!(RetryOptions::network().validate().is_ok());
        assert!(RetryOptions::database().validate().is_ok());
        assert!(RetryOptions::file_operations().validate().is_ok());
        assert!(RetryOptions::external_api().validate().is_ok());

        let bad = RetryOptions::default()
            .base_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1));
        assert!(bad.validate().is_err());
        assert!(RetryOptions::default().multiplier(0.5).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let (manager, audit) = manager();
        let calls = AtomicU32::new(0);

        let result = manager
            .execute(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(UploadError::Reset)
                    } else {
                        Ok("stored")
                    }
                },
                &fixed(3).key("upload"),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.value(), Some(&"stored"));
        assert_eq!(result.attempts, 3);
        assert!(!result.aborted);
        assert_eq!(audit.count("retry_scheduled"), 2);

        let metrics = manager.metrics("upload").unwrap();
        assert_eq!(metrics.total_operations, 1);
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_uses_all_attempts() {
        let (manager, _audit) = manager();
        let calls = AtomicU32::new(0);

        let result = manager
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UploadError::Reset)
                },
                &fixed(4),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(result.error().unwrap().category(), ErrorCategory::Network);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let (manager, _audit) = manager();
        let result = manager
            .execute(|| async { Err::<(), _>(UploadError::Invalid) }, &fixed(5))
            .await;

        assert_eq!(result.attempts, 1);
        assert_eq!(result.error().unwrap().code(), codes::VALIDATION_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_overrides_retryability() {
        let (manager, _audit) = manager();
        let options = fixed(5).retry_if(|_: &AppError, attempt: u32| attempt < 2);

        let result = manager
            .execute(|| async { Err::<(), _>(UploadError::Invalid) }, &options)
            .await;
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_network_failure() {
        let (manager, _audit) = manager();
        let options = fixed(1).timeout(Duration::from_millis(50));

        let result = manager
            .execute(
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, UploadError>(())
                },
                &options,
            )
            .await;

        let error = result.error().unwrap();
        assert_eq!(error.code(), codes::TIMEOUT);
        assert_eq!(error.category(), ErrorCategory::Network);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_before_and_during_backoff() {
        let (manager, _audit) = manager();

        let token = CancellationToken::new();
        token.cancel();
        let result = manager
            .execute(
                || async { Ok::<_, UploadError>(()) },
                &fixed(3).cancellation(token),
            )
            .await;
        assert!(result.aborted);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error().unwrap().code(), codes::CANCELLED);

        let token = CancellationToken::new();
        let options = fixed(3)
            .base_delay(Duration::from_secs(10))
            .cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result = manager
            .execute(|| async { Err::<(), _>(UploadError::Reset) }, &options)
            .await;
        canceller.await.unwrap();
        assert!(result.aborted);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_guard_fails_fast_without_invoking() {
        let clock = ManualClock::default();
        let audit = Arc::new(MemoryAuditSink::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new(2),
            Arc::new(clock.clone()),
            audit.clone(),
        ));
        let manager = RetryManager::new(RetryOptions::default(), Arc::new(clock), audit)
            .with_circuit_breakers(breakers.clone());
        let calls = AtomicU32::new(0);

        let result = manager
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UploadError::Reset)
                },
                &fixed(3).key("ocr"),
            )
            .await;

        assert_eq!(breakers.state("ocr"), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.error().unwrap().code(), codes::CIRCUIT_BREAKER_OPEN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_guard_denies_attempt() {
        let clock = ManualClock::default();
        let audit = Arc::new(MemoryAuditSink::new());
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(InMemoryCounterStore::new(Arc::new(clock.clone()))),
            RateLimitRule::new(1, Duration::from_secs(60)),
            Arc::new(clock.clone()),
            audit.clone(),
        ));
        let manager = RetryManager::new(RetryOptions::default(), Arc::new(clock), audit)
            .with_rate_limiter(limiter);

        let first = manager
            .execute(|| async { Ok::<_, UploadError>(1) }, &fixed(0).key("ai:u-1"))
            .await;
        assert!(first.is_success());

        let second = manager
            .execute(|| async { Ok::<_, UploadError>(2) }, &fixed(0).key("ai:u-1"))
            .await;
        let error = second.error().unwrap();
        assert_eq!(error.code(), codes::RATE_LIMITED);
        assert_eq!(error.retry_after(), Some(Duration::from_secs(60)));
    }

    fn guarded_manager(
        clock: &ManualClock,
        max_requests: u64,
    ) -> (RetryManager, Arc<CircuitBreakerRegistry>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new(2).reset_timeout(Duration::from_secs(10)),
            Arc::new(clock.clone()),
            audit.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(InMemoryCounterStore::new(Arc::new(clock.clone()))),
            RateLimitRule::new(max_requests, Duration::from_secs(60)),
            Arc::new(clock.clone()),
            audit.clone(),
        ));
        let manager = RetryManager::new(RetryOptions::default(), Arc::new(clock.clone()), audit)
            .with_circuit_breakers(breakers.clone())
            .with_rate_limiter(limiter);
        (manager, breakers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_does_not_spend_rate_limit_quota() {
        let clock = ManualClock::default();
        let (manager, breakers) = guarded_manager(&clock, 3);

        for _ in 0..2 {
            let result = manager
                .execute(|| async { Err::<(), _>(UploadError::Reset) }, &fixed(0).key("ocr"))
                .await;
            assert_eq!(result.error().unwrap().code(), codes::NETWORK_ERROR);
        }
        assert_eq!(breakers.state("ocr"), CircuitState::Open);

        for _ in 0..5 {
            let result = manager
                .execute(|| async { Ok::<_, UploadError>(()) }, &fixed(0).key("ocr"))
                .await;
            assert_eq!(result.error().unwrap().code(), codes::CIRCUIT_BREAKER_OPEN);
        }

        // The third slot of the window is still free for the probe
        clock.advance(Duration::from_secs(11));
        let probe = manager
            .execute(|| async { Ok::<_, UploadError>(7) }, &fixed(0).key("ocr"))
            .await;
        assert!(probe.is_success());
        assert_eq!(breakers.state("ocr"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_probe_is_released() {
        let clock = ManualClock::default();
        let (manager, breakers) = guarded_manager(&clock, 2);

        for _ in 0..2 {
            manager
                .execute(|| async { Err::<(), _>(UploadError::Reset) }, &fixed(0).key("ocr"))
                .await;
        }
        assert_eq!(breakers.state("ocr"), CircuitState::Open);

        clock.advance(Duration::from_secs(11));
        for _ in 0..2 {
            let result = manager
                .execute(|| async { Ok::<_, UploadError>(()) }, &fixed(0).key("ocr"))
                .await;
            // A denied probe does not leave the half-open slot occupied
            assert_eq!(result.error().unwrap().code(), codes::RATE_LIMITED);
        }
        assert_eq!(breakers.state("ocr"), CircuitState::HalfOpen);
    }

    fn batch_op<'a>(
        index: usize,
        calls: &'a AtomicU32,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<usize, UploadError>> + Send + 'a>> + 'a
    {
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                if index == 1 {
                    Err(UploadError::Invalid)
                } else {
                    Ok(index * 10)
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_order() {
        let (manager, _audit) = manager();
        let calls = AtomicU32::new(0);
        let ops: Vec<_> = (0..4).map(|i| batch_op(i, &calls)).collect();

        let results = manager
            .execute_batch(ops, &fixed(0), BatchOptions { concurrency: 2, fail_fast: false })
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].value(), Some(&0));
        assert!(!results[1].is_success());
        assert_eq!(results[2].value(), Some(&20));
        assert_eq!(results[3].value(), Some(&30));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fail_fast_skips_unstarted_work() {
        let (manager, _audit) = manager();
        let calls = AtomicU32::new(0);
        let ops: Vec<_> = (0..5).map(|i| batch_op(i, &calls)).collect();

        let results = manager
            .execute_batch(ops, &fixed(0), BatchOptions { concurrency: 2, fail_fast: true })
            .await;

        // ops 0 and 1 run together; 1 fails, so 2..5 never start
        assert_eq!(results[0].value(), Some(&0));
        assert!(!results[1].aborted);
        for skipped in &results[2..] {
            assert!(skipped.aborted);
            assert_eq!(skipped.attempts, 1);
            assert_eq!(skipped.error().unwrap().code(), codes::CANCELLED);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_metrics_reset() {
        let (manager, _audit) = manager();
        manager
            .execute(|| async { Ok::<_, UploadError>(()) }, &fixed(0).key("a"))
            .await;
        manager
            .execute(|| async { Ok::<_, UploadError>(()) }, &fixed(0).key("b"))
            .await;
        assert_eq!(manager.all_metrics().len(), 2);

        manager.reset_metrics(Some("a"));
        assert!(manager.metrics("a").is_none());
        manager.reset_metrics(None);
        assert!(manager.all_metrics().is_empty());
    }
}
