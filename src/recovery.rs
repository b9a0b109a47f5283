//! Recovery strategy engine
//!
//! Strategies are declarative rules: a set of conditions that must all match a
//! normalized error, an action, and a priority. [`RecoveryEngine::attempt_recovery`]
//! tries matching strategies in priority order until one succeeds, subject to
//! a per-error attempt cap and a per-strategy cooldown.
//!
//! Actions that need the host (fallback values, cache clearing, session
//! logout, custom callbacks) go through injected [`RecoveryHandler`]s. A
//! handler that fails, times out or panics produces a `RECOVERY_FAILED`
//! error and the engine moves on to the next candidate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::classifier::{codes, AppError, ErrorCategory, ErrorContext, ErrorSeverity};
use crate::clock::{add_duration, elapsed_between, Clock};
use crate::config::duration_format;
use crate::error::{ResilienceError, ResilienceResult};

/// Remediation performed by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Tell the caller to retry the operation
    Retry,
    /// Substitute a fallback value
    Fallback,
    /// Send the user elsewhere
    Redirect,
    CacheClear,
    Logout,
    /// Hand the problem to a human
    Escalate,
    Custom,
    Ignore,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Redirect => "redirect",
            RecoveryAction::CacheClear => "cache_clear",
            RecoveryAction::Logout => "logout",
            RecoveryAction::Escalate => "escalate",
            RecoveryAction::Custom => "custom",
            RecoveryAction::Ignore => "ignore",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied by a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    /// Regular expression match
    Matches,
    OneOf,
    GreaterThan,
    LessThan,
}

/// Expected value of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    One(String),
    Many(Vec<String>),
}

impl ConditionValue {
    fn first(&self) -> &str {
        match self {
            ConditionValue::One(value) => value,
            ConditionValue::Many(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    fn all(&self) -> Vec<&str> {
        match self {
            ConditionValue::One(value) => vec![value.as_str()],
            ConditionValue::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        ConditionValue::One(value.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(value: String) -> Self {
        ConditionValue::One(value)
    }
}

impl From<Vec<&str>> for ConditionValue {
    fn from(values: Vec<&str>) -> Self {
        ConditionValue::Many(values.into_iter().map(str::to_string).collect())
    }
}

/// Injected match function for conditions the closed set cannot express
#[derive(Clone)]
pub struct ConditionPredicate(Arc<dyn Fn(&AppError, Option<&ErrorContext>) -> bool + Send + Sync>);

impl ConditionPredicate {
    pub fn new(f: impl Fn(&AppError, Option<&ErrorContext>) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for ConditionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<predicate>")
    }
}

/// One match predicate; all conditions of a strategy must hold
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryCondition {
    ErrorCode {
        operator: ConditionOperator,
        value: ConditionValue,
    },
    Category {
        operator: ConditionOperator,
        value: ConditionValue,
    },
    Severity {
        operator: ConditionOperator,
        value: ConditionValue,
    },
    ContextField {
        field: String,
        operator: ConditionOperator,
        value: ConditionValue,
    },
    #[serde(skip)]
    Custom(ConditionPredicate),
}

impl RecoveryCondition {
    pub fn code_is(code: &str) -> Self {
        RecoveryCondition::ErrorCode {
            operator: ConditionOperator::Equals,
            value: code.into(),
        }
    }

    pub fn category_is(category: ErrorCategory) -> Self {
        RecoveryCondition::Category {
            operator: ConditionOperator::Equals,
            value: category.as_str().into(),
        }
    }

    pub fn severity_at_least(severity: ErrorSeverity) -> Self {
        let values: Vec<&str> = ErrorSeverity::ALL
            .iter()
            .filter(|s| **s >= severity)
            .map(|s| s.as_str())
            .collect();
        RecoveryCondition::Severity {
            operator: ConditionOperator::OneOf,
            value: values.into(),
        }
    }

    pub fn context_field(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        RecoveryCondition::ContextField {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn custom(f: impl Fn(&AppError, Option<&ErrorContext>) -> bool + Send + Sync + 'static) -> Self {
        RecoveryCondition::Custom(ConditionPredicate::new(f))
    }

    /// Regex patterns this condition will compile
    fn patterns(&self) -> Vec<&str> {
        match self {
            RecoveryCondition::ErrorCode { operator, value }
            | RecoveryCondition::Category { operator, value }
            | RecoveryCondition::Severity { operator, value }
            | RecoveryCondition::ContextField { operator, value, .. }
                if *operator == ConditionOperator::Matches =>
            {
                value.all()
            }
            _ => Vec::new(),
        }
    }

    fn evaluate(&self, error: &AppError, context: Option<&ErrorContext>, patterns: &PatternCache) -> bool {
        match self {
            RecoveryCondition::ErrorCode { operator, value } => {
                compare_text(Some(error.code()), *operator, value, false, patterns)
            }
            RecoveryCondition::Category { operator, value } => {
                compare_text(Some(error.category().as_str()), *operator, value, true, patterns)
            }
            RecoveryCondition::Severity { operator, value } => match operator {
                ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                    match parse_severity(value.first()) {
                        Some(expected) if *operator == ConditionOperator::GreaterThan => {
                            error.severity() > expected
                        }
                        Some(expected) => error.severity() < expected,
                        None => false,
                    }
                }
                _ => compare_text(Some(error.severity().as_str()), *operator, value, true, patterns),
            },
            RecoveryCondition::ContextField { field, operator, value } => {
                let actual = context.and_then(|ctx| ctx.field(field));
                compare_text(actual.as_deref(), *operator, value, false, patterns)
            }
            RecoveryCondition::Custom(predicate) => (predicate.0)(error, context),
        }
    }
}

fn parse_severity(value: &str) -> Option<ErrorSeverity> {
    ErrorSeverity::ALL
        .into_iter()
        .find(|s| s.as_str().eq_ignore_ascii_case(value))
}

fn compare_text(
    actual: Option<&str>,
    operator: ConditionOperator,
    expected: &ConditionValue,
    ignore_case: bool,
    patterns: &PatternCache,
) -> bool {
    let Some(actual) = actual else {
        return operator == ConditionOperator::NotEquals;
    };

    let fold = |s: &str| {
        if ignore_case {
            s.to_ascii_uppercase()
        } else {
            s.to_string()
        }
    };
    let actual_cmp = fold(actual);
    let expected_cmp = fold(expected.first());

    match operator {
        ConditionOperator::Equals => actual_cmp == expected_cmp,
        ConditionOperator::NotEquals => actual_cmp != expected_cmp,
        ConditionOperator::Contains => actual_cmp.contains(&expected_cmp),
        ConditionOperator::StartsWith => actual_cmp.starts_with(&expected_cmp),
        ConditionOperator::EndsWith => actual_cmp.ends_with(&expected_cmp),
        ConditionOperator::Matches => patterns
            .get(expected.first())
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        ConditionOperator::OneOf => expected.all().into_iter().any(|v| fold(v) == actual_cmp),
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            match (actual.trim().parse::<f64>(), expected.first().trim().parse::<f64>()) {
                (Ok(a), Ok(b)) if operator == ConditionOperator::GreaterThan => a > b,
                (Ok(a), Ok(b)) => a < b,
                _ => false,
            }
        }
    }
}

/// Compiled regex cache shared by all conditions
#[derive(Debug, Default)]
struct PatternCache {
    compiled: DashMap<String, Regex>,
}

impl PatternCache {
    fn get(&self, pattern: &str) -> Option<Regex> {
        if let Some(re) = self.compiled.get(pattern) {
            return Some(re.clone());
        }
        match Regex::new(pattern) {
            Ok(re) => {
                self.compiled.insert(pattern.to_string(), re.clone());
                Some(re)
            }
            Err(e) => {
                debug!(pattern = pattern, error = %e, "Ignoring invalid condition pattern");
                None
            }
        }
    }
}

/// Action-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub requires_confirmation: bool,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    /// Skip this strategy for the same error until this much time has passed
    #[serde(with = "duration_format")]
    pub cooldown: Duration,
    pub fallback_value: Option<serde_json::Value>,
    pub redirect_to: Option<String>,
    /// Name of the custom handler for `Custom` actions
    pub handler: Option<String>,
    #[serde(with = "duration_format::option")]
    pub retry_delay: Option<Duration>,
    pub message: Option<String>,
    pub next_steps: Vec<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            requires_confirmation: false,
            timeout: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            fallback_value: None,
            redirect_to: None,
            handler: None,
            retry_delay: None,
            message: None,
            next_steps: Vec::new(),
        }
    }
}

/// A declarative remediation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub action: RecoveryAction,
    /// Lower runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<RecoveryCondition>,
    #[serde(default)]
    pub config: StrategyConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RecoveryStrategy {
    pub fn new(id: impl Into<String>, action: RecoveryAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action,
            priority: 100,
            conditions: Vec::new(),
            config: StrategyConfig::default(),
            enabled: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn when(mut self, condition: RecoveryCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn requires_confirmation(mut self) -> Self {
        self.config.requires_confirmation = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn fallback_value(mut self, value: serde_json::Value) -> Self {
        self.config.fallback_value = Some(value);
        self
    }

    pub fn redirect_to(mut self, target: impl Into<String>) -> Self {
        self.config.redirect_to = Some(target.into());
        self
    }

    pub fn handler(mut self, name: impl Into<String>) -> Self {
        self.config.handler = Some(name.into());
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = Some(delay);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.config.message = Some(message.into());
        self
    }

    pub fn next_step(mut self, step: impl Into<String>) -> Self {
        self.config.next_steps.push(step.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.id.trim().is_empty() {
            return Err(ResilienceError::invalid_config("recovery strategy id must not be empty"));
        }
        if self.config.timeout.is_zero() {
            return Err(ResilienceError::invalid_config(format!(
                "recovery strategy '{}' timeout must be greater than zero",
                self.id
            )));
        }
        if self.action == RecoveryAction::Custom && self.config.handler.is_none() {
            return Err(ResilienceError::invalid_config(format!(
                "custom recovery strategy '{}' needs a handler name",
                self.id
            )));
        }
        if self.action == RecoveryAction::Redirect && self.config.redirect_to.is_none() {
            return Err(ResilienceError::invalid_config(format!(
                "redirect recovery strategy '{}' needs a target",
                self.id
            )));
        }
        for condition in &self.conditions {
            for pattern in condition.patterns() {
                Regex::new(pattern).map_err(|e| {
                    ResilienceError::invalid_config(format!(
                        "recovery strategy '{}' has an invalid pattern '{}': {}",
                        self.id, pattern, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn matches(&self, error: &AppError, context: Option<&ErrorContext>, patterns: &PatternCache) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.evaluate(error, context, patterns))
    }
}

/// What a handler receives
#[derive(Debug, Clone, Copy)]
pub struct RecoveryRequest<'a> {
    pub error: &'a AppError,
    pub context: Option<&'a ErrorContext>,
    pub strategy: &'a RecoveryStrategy,
}

/// Host-side implementation of an action
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Perform the action, optionally returning data for the caller
    async fn handle(&self, request: RecoveryRequest<'_>) -> Result<Option<serde_json::Value>, AppError>;
}

/// Handler built from an async closure over owned copies of the error and context
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RecoveryHandler for FnHandler<F>
where
    F: Fn(AppError, Option<ErrorContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<serde_json::Value>, AppError>> + Send,
{
    async fn handle(&self, request: RecoveryRequest<'_>) -> Result<Option<serde_json::Value>, AppError> {
        (self.0)(request.error.clone(), request.context.cloned()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RecoveryHandler>
where
    F: Fn(AppError, Option<ErrorContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<serde_json::Value>, AppError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Outcome of one recovery attempt
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub action: RecoveryAction,
    pub strategy_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    pub duration: Duration,
    pub requires_user_action: bool,
    pub next_steps: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryResult {
    fn escalation(message: impl Into<String>, error: Option<AppError>, at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            action: RecoveryAction::Escalate,
            strategy_id: None,
            message: message.into(),
            data: None,
            error,
            duration: Duration::ZERO,
            requires_user_action: false,
            next_steps: vec![
                "Contact support if the problem persists".to_string(),
                "Try again later".to_string(),
            ],
            timestamp: at,
        }
    }
}

/// Entry in the recovery history
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub error_code: String,
    pub fingerprint: String,
    pub result: RecoveryResult,
}

/// Aggregate recovery statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub escalations: u64,
    pub by_action: HashMap<RecoveryAction, u64>,
    pub success_rate: f64,
}

/// Engine-wide limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Strategy executions allowed per error identity
    pub max_attempts: u32,
    /// Attempt counters idle for longer than this are forgotten by the sweep
    #[serde(with = "duration_format")]
    pub attempt_window: Duration,
    pub history_limit: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_window: Duration::from_secs(3600),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct RegisteredStrategy {
    sequence: u64,
    strategy: RecoveryStrategy,
}

#[derive(Debug, Clone, Copy)]
struct AttemptCounter {
    count: u32,
    last_attempt: DateTime<Utc>,
}

/// Selects and runs recovery strategies
pub struct RecoveryEngine {
    settings: RecoverySettings,
    strategies: RwLock<Vec<RegisteredStrategy>>,
    sequence: AtomicU64,
    action_handlers: DashMap<RecoveryAction, Arc<dyn RecoveryHandler>>,
    custom_handlers: DashMap<String, Arc<dyn RecoveryHandler>>,
    attempts: DashMap<String, AttemptCounter>,
    cooldowns: DashMap<String, DateTime<Utc>>,
    history: RwLock<VecDeque<RecoveryRecord>>,
    stats: RwLock<RecoveryStats>,
    patterns: PatternCache,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("settings", &self.settings)
            .field("strategies", &self.strategies.read().len())
            .field("action_handlers", &"<trait objects>")
            .field("custom_handlers", &"<trait objects>")
            .field("tracked_errors", &self.attempts.len())
            .finish()
    }
}

impl RecoveryEngine {
    pub fn new(settings: RecoverySettings, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            settings,
            strategies: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
            action_handlers: DashMap::new(),
            custom_handlers: DashMap::new(),
            attempts: DashMap::new(),
            cooldowns: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(RecoveryStats::default()),
            patterns: PatternCache::default(),
            clock,
            audit,
        }
    }

    /// Engine preloaded with [`default_strategies`]
    pub fn with_defaults(
        settings: RecoverySettings,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> ResilienceResult<Self> {
        let engine = Self::new(settings, clock, audit);
        for strategy in default_strategies() {
            engine.register(strategy)?;
        }
        Ok(engine)
    }

    /// Add or replace a strategy; replacing moves it behind equal-priority peers
    pub fn register(&self, strategy: RecoveryStrategy) -> ResilienceResult<()> {
        strategy.validate()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut strategies = self.strategies.write();
        strategies.retain(|s| s.strategy.id != strategy.id);
        debug!(strategy = %strategy.id, action = %strategy.action, priority = strategy.priority, "Registered recovery strategy");
        strategies.push(RegisteredStrategy { sequence, strategy });
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut strategies = self.strategies.write();
        let before = strategies.len();
        strategies.retain(|s| s.strategy.id != id);
        strategies.len() != before
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> ResilienceResult<()> {
        let mut strategies = self.strategies.write();
        let entry = strategies
            .iter_mut()
            .find(|s| s.strategy.id == id)
            .ok_or_else(|| ResilienceError::StrategyNotFound { id: id.to_string() })?;
        entry.strategy.enabled = enabled;
        Ok(())
    }

    /// Registered strategies in evaluation order
    pub fn strategies(&self) -> Vec<RecoveryStrategy> {
        let mut all = self.strategies.read().clone();
        all.sort_by_key(|s| (s.strategy.priority, s.sequence));
        all.into_iter().map(|s| s.strategy).collect()
    }

    /// Handler used for every strategy with `action`
    pub fn set_action_handler(&self, action: RecoveryAction, handler: Arc<dyn RecoveryHandler>) {
        self.action_handlers.insert(action, handler);
    }

    /// Handler referenced by name from `Custom` strategies
    pub fn register_custom_handler(&self, name: impl Into<String>, handler: Arc<dyn RecoveryHandler>) {
        self.custom_handlers.insert(name.into(), handler);
    }

    /// Attempts recorded so far against the identity of `error`
    pub fn attempts_for(&self, error: &AppError, context: Option<&ErrorContext>) -> u32 {
        let fingerprint = identity(error, context);
        self.attempts.get(&fingerprint).map(|a| a.count).unwrap_or(0)
    }

    /// Forget attempts and cooldowns recorded for `error`
    pub fn clear_attempts(&self, error: &AppError, context: Option<&ErrorContext>) {
        let fingerprint = identity(error, context);
        self.attempts.remove(&fingerprint);
        let suffix = format!("|{}", fingerprint);
        self.cooldowns.retain(|key, _| !key.ends_with(&suffix));
    }

    /// Choose and run a recovery strategy for `error`
    pub async fn attempt_recovery(
        &self,
        error: &AppError,
        context: Option<&ErrorContext>,
        user_confirmed: bool,
    ) -> RecoveryResult {
        let now = self.clock.now();
        let merged = merged_context(error, context);
        let context = merged.as_ref();
        let fingerprint = identity(error, context);

        let used = self.attempts.get(&fingerprint).map(|a| a.count).unwrap_or(0);
        if used >= self.settings.max_attempts {
            warn!(
                error_code = error.code(),
                attempts = used,
                "Recovery attempt limit reached, escalating"
            );
            let result = RecoveryResult::escalation(
                format!("Recovery attempt limit ({}) reached", self.settings.max_attempts),
                Some(error.clone()),
                now,
            );
            self.remember(error, &fingerprint, &result);
            return result;
        }

        let candidates = self.candidates(error, context);
        if candidates.is_empty() {
            debug!(error_code = error.code(), "No recovery strategy matches");
            let result = RecoveryResult::escalation(
                "No recovery strategy available",
                Some(error.clone()),
                now,
            );
            self.remember(error, &fingerprint, &result);
            return result;
        }

        let mut failures = Vec::new();
        for strategy in candidates {
            let cooldown_key = format!("{}|{}", strategy.id, fingerprint);
            if let Some(until) = self.cooldowns.get(&cooldown_key).map(|u| *u) {
                if self.clock.now() < until {
                    debug!(strategy = %strategy.id, "Recovery strategy cooling down, skipping");
                    continue;
                }
            }

            if strategy.config.requires_confirmation && !user_confirmed {
                info!(strategy = %strategy.id, "Recovery strategy awaiting user confirmation");
                return RecoveryResult {
                    success: false,
                    action: strategy.action,
                    strategy_id: Some(strategy.id.clone()),
                    message: strategy
                        .config
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("Confirm to run '{}'", strategy.name)),
                    data: None,
                    error: None,
                    duration: Duration::ZERO,
                    requires_user_action: true,
                    next_steps: strategy.config.next_steps.clone(),
                    timestamp: self.clock.now(),
                };
            }

            let result = self.run(&strategy, error, context).await;

            let attempted_at = self.clock.now();
            self.cooldowns
                .insert(cooldown_key, add_duration(attempted_at, strategy.config.cooldown));
            self.attempts
                .entry(fingerprint.clone())
                .and_modify(|a| {
                    a.count = a.count.saturating_add(1);
                    a.last_attempt = attempted_at;
                })
                .or_insert(AttemptCounter {
                    count: 1,
                    last_attempt: attempted_at,
                });

            self.audit.record(AuditEvent::RecoveryAttempted {
                strategy_id: strategy.id.clone(),
                action: strategy.action,
                error_code: error.code().to_string(),
                success: result.success,
            });
            self.remember(error, &fingerprint, &result);

            if result.success {
                info!(
                    strategy = %strategy.id,
                    action = %strategy.action,
                    error_code = error.code(),
                    "Recovery succeeded"
                );
                return result;
            }

            warn!(
                strategy = %strategy.id,
                action = %strategy.action,
                error_code = error.code(),
                "Recovery strategy failed: {}",
                result.message
            );
            failures.push(format!("{}: {}", strategy.id, result.message));

            let used = self.attempts.get(&fingerprint).map(|a| a.count).unwrap_or(0);
            if used >= self.settings.max_attempts {
                break;
            }
        }

        let message = if failures.is_empty() {
            "All matching recovery strategies are cooling down".to_string()
        } else {
            format!("All recovery strategies failed ({})", failures.join("; "))
        };
        let result = RecoveryResult::escalation(message, Some(error.clone()), self.clock.now());
        self.remember(error, &fingerprint, &result);
        result
    }

    fn candidates(&self, error: &AppError, context: Option<&ErrorContext>) -> Vec<RecoveryStrategy> {
        let mut matching: Vec<RegisteredStrategy> = self
            .strategies
            .read()
            .iter()
            .filter(|s| s.strategy.enabled && s.strategy.matches(error, context, &self.patterns))
            .cloned()
            .collect();
        matching.sort_by_key(|s| (s.strategy.priority, s.sequence));
        matching.into_iter().map(|s| s.strategy).collect()
    }

    /// Execute one strategy under its timeout, turning failures and panics into results
    async fn run(
        &self,
        strategy: &RecoveryStrategy,
        error: &AppError,
        context: Option<&ErrorContext>,
    ) -> RecoveryResult {
        let started = Instant::now();
        let request = RecoveryRequest {
            error,
            context,
            strategy,
        };

        let guarded = AssertUnwindSafe(self.perform(request)).catch_unwind();
        let outcome = match tokio::time::timeout(strategy.config.timeout, guarded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let detail = panic_message(panic.as_ref());
                error!(strategy = %strategy.id, panic = %detail, "Recovery action panicked");
                Err(recovery_failed(strategy, format!("action panicked: {}", detail)))
            }
            Err(_) => Err(recovery_failed(
                strategy,
                format!("action timed out after {}ms", strategy.config.timeout.as_millis()),
            )),
        };

        let duration = started.elapsed();
        match outcome {
            Ok((message, data)) => RecoveryResult {
                success: true,
                action: strategy.action,
                strategy_id: Some(strategy.id.clone()),
                message: strategy.config.message.clone().unwrap_or(message),
                data,
                error: None,
                duration,
                requires_user_action: false,
                next_steps: strategy.config.next_steps.clone(),
                timestamp: self.clock.now(),
            },
            Err(failure) => {
                let failure = if failure.code() == codes::RECOVERY_FAILED {
                    failure
                } else {
                    recovery_failed(strategy, failure.technical_message().to_string())
                        .with_cause(failure)
                };
                RecoveryResult {
                    success: false,
                    action: strategy.action,
                    strategy_id: Some(strategy.id.clone()),
                    message: failure.technical_message().to_string(),
                    data: None,
                    error: Some(failure),
                    duration,
                    requires_user_action: false,
                    next_steps: strategy.config.next_steps.clone(),
                    timestamp: self.clock.now(),
                }
            }
        }
    }

    async fn perform(
        &self,
        request: RecoveryRequest<'_>,
    ) -> Result<(String, Option<serde_json::Value>), AppError> {
        let strategy = request.strategy;
        let handler = self.action_handlers.get(&strategy.action).map(|h| h.clone());

        match strategy.action {
            RecoveryAction::Retry => {
                let delay = strategy
                    .config
                    .retry_delay
                    .or_else(|| request.error.retry_after())
                    .unwrap_or(Duration::ZERO);
                Ok((
                    "Retry the operation".to_string(),
                    Some(serde_json::json!({ "retry_after_ms": delay.as_millis() as u64 })),
                ))
            }
            RecoveryAction::Fallback => match (handler, &strategy.config.fallback_value) {
                (Some(handler), _) => {
                    let data = handler.handle(request).await?;
                    Ok(("Fallback value provided".to_string(), data))
                }
                (None, Some(value)) => Ok(("Fallback value provided".to_string(), Some(value.clone()))),
                (None, None) => Err(recovery_failed(strategy, "no fallback provider configured")),
            },
            RecoveryAction::Redirect => match &strategy.config.redirect_to {
                Some(target) => Ok((
                    format!("Redirect to {}", target),
                    Some(serde_json::json!({ "redirect_to": target })),
                )),
                None => Err(recovery_failed(strategy, "no redirect target configured")),
            },
            RecoveryAction::CacheClear => match handler {
                Some(handler) => {
                    let data = handler.handle(request).await?;
                    Ok(("Cache cleared".to_string(), data))
                }
                None => Ok((
                    "Clear cached data".to_string(),
                    Some(serde_json::json!({ "cache_clear": true })),
                )),
            },
            RecoveryAction::Logout => {
                let data = match handler {
                    Some(handler) => handler.handle(request).await?,
                    None => Some(serde_json::json!({ "logout": true })),
                };
                let data = match (&strategy.config.redirect_to, data) {
                    (Some(target), None) => Some(serde_json::json!({ "redirect_to": target })),
                    (Some(target), Some(serde_json::Value::Object(mut fields))) => {
                        fields
                            .entry("redirect_to")
                            .or_insert_with(|| serde_json::json!(target));
                        Some(serde_json::Value::Object(fields))
                    }
                    (_, data) => data,
                };
                Ok(("Session ended".to_string(), data))
            }
            RecoveryAction::Escalate => {
                let data = match handler {
                    Some(handler) => handler.handle(request).await?,
                    None => None,
                };
                warn!(
                    strategy = %strategy.id,
                    error_code = request.error.code(),
                    severity = %request.error.severity(),
                    "Error escalated"
                );
                Ok(("Escalated to support".to_string(), data))
            }
            RecoveryAction::Custom => {
                let name = strategy.config.handler.as_deref().unwrap_or_default();
                let custom = self.custom_handlers.get(name).map(|h| h.clone());
                match custom {
                    Some(handler) => {
                        let data = handler.handle(request).await?;
                        Ok((format!("Custom handler '{}' completed", name), data))
                    }
                    None => Err(recovery_failed(
                        strategy,
                        format!("custom handler '{}' is not registered", name),
                    )),
                }
            }
            RecoveryAction::Ignore => Ok(("Error ignored".to_string(), None)),
        }
    }

    fn remember(&self, error: &AppError, fingerprint: &str, result: &RecoveryResult) {
        {
            let mut stats = self.stats.write();
            stats.total_attempts += 1;
            if result.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            if result.action == RecoveryAction::Escalate && result.strategy_id.is_none() {
                stats.escalations += 1;
            }
            *stats.by_action.entry(result.action).or_insert(0) += 1;
            stats.success_rate = stats.successful as f64 / stats.total_attempts as f64;
        }

        let mut history = self.history.write();
        history.push_back(RecoveryRecord {
            error_code: error.code().to_string(),
            fingerprint: fingerprint.to_string(),
            result: result.clone(),
        });
        while history.len() > self.settings.history_limit {
            history.pop_front();
        }
    }

    /// Most recent records first
    pub fn history(&self, limit: Option<usize>) -> Vec<RecoveryRecord> {
        let history = self.history.read();
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.read().clone()
    }

    /// Drop expired cooldowns and idle attempt counters
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.cooldowns.len() + self.attempts.len();
        self.cooldowns.retain(|_, until| *until > now);
        let window = self.settings.attempt_window;
        self.attempts
            .retain(|_, counter| elapsed_between(counter.last_attempt, now) <= window);
        before.saturating_sub(self.cooldowns.len() + self.attempts.len())
    }
}

fn merged_context(error: &AppError, context: Option<&ErrorContext>) -> Option<ErrorContext> {
    match (context, error.context()) {
        (Some(given), Some(own)) => Some(given.merge(own)),
        (Some(given), None) => Some(given.clone()),
        (None, Some(own)) => Some(own.clone()),
        (None, None) => None,
    }
}

fn identity(error: &AppError, context: Option<&ErrorContext>) -> String {
    match context {
        Some(ctx) => error.clone().with_context(ctx.clone()).fingerprint(),
        None => error.fingerprint(),
    }
}

fn recovery_failed(strategy: &RecoveryStrategy, detail: impl Into<String>) -> AppError {
    AppError::new(
        codes::RECOVERY_FAILED,
        ErrorCategory::System,
        format!("Recovery strategy '{}' failed: {}", strategy.id, detail.into()),
    )
    .with_severity(ErrorSeverity::Critical)
    .with_retryable(false)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Strategies every engine starts with unless built with [`RecoveryEngine::new`]
pub fn default_strategies() -> Vec<RecoveryStrategy> {
    vec![
        RecoveryStrategy::new("rate-limit-retry", RecoveryAction::Retry)
            .name("Retry after rate limit")
            .priority(5)
            .when(RecoveryCondition::code_is(codes::RATE_LIMITED))
            .next_step("Wait before sending the request again"),
        RecoveryStrategy::new("network-retry", RecoveryAction::Retry)
            .name("Retry network failure")
            .priority(10)
            .retry_delay(Duration::from_secs(1))
            .when(RecoveryCondition::category_is(ErrorCategory::Network)),
        RecoveryStrategy::new("session-logout", RecoveryAction::Logout)
            .name("Sign out expired session")
            .priority(10)
            .redirect_to("/login")
            .when(RecoveryCondition::category_is(ErrorCategory::Authentication))
            .next_step("Sign in again"),
        RecoveryStrategy::new("circuit-open-fallback", RecoveryAction::Fallback)
            .name("Serve fallback while circuit is open")
            .priority(15)
            .when(RecoveryCondition::code_is(codes::CIRCUIT_BREAKER_OPEN)),
        RecoveryStrategy::new("external-api-fallback", RecoveryAction::Fallback)
            .name("Fallback for external service")
            .priority(20)
            .when(RecoveryCondition::category_is(ErrorCategory::ExternalApi)),
        RecoveryStrategy::new("database-cache-clear", RecoveryAction::CacheClear)
            .name("Clear cached data after database error")
            .priority(30)
            .when(RecoveryCondition::category_is(ErrorCategory::Database)),
        RecoveryStrategy::new("validation-ignore", RecoveryAction::Ignore)
            .name("Let the form surface validation errors")
            .priority(50)
            .when(RecoveryCondition::category_is(ErrorCategory::Validation)),
        RecoveryStrategy::new("critical-escalate", RecoveryAction::Escalate)
            .name("Escalate critical errors")
            .priority(100)
            .when(RecoveryCondition::severity_at_least(ErrorSeverity::Critical))
            .next_step("Support has been notified"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicU32;

    fn engine() -> (RecoveryEngine, ManualClock, MemoryAuditSink) {
        let clock = ManualClock::default();
        let audit = MemoryAuditSink::new();
        let engine = RecoveryEngine::new(
            RecoverySettings::default(),
            Arc::new(clock.clone()),
            Arc::new(audit.clone()),
        );
        (engine, clock, audit)
    }

    fn failing_handler(calls: Arc<AtomicU32>) -> Arc<dyn RecoveryHandler> {
        handler_fn(move |_error, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::external_api("fallback service down"))
            }
        })
    }

    #[test]
    fn test_condition_operators() {
        let patterns = PatternCache::default();
        let error = AppError::network("socket closed")
            .with_context(ErrorContext::new().component("ocr").meta("pages", 12));
        let ctx = error.context();

        let holds = |c: RecoveryCondition| c.evaluate(&error, ctx, &patterns);

        assert!(holds(RecoveryCondition::code_is(codes::NETWORK_ERROR)));
        assert!(holds(RecoveryCondition::ErrorCode {
            operator: ConditionOperator::StartsWith,
            value: "NETWORK".into(),
        }));
        assert!(holds(RecoveryCondition::ErrorCode {
            operator: ConditionOperator::Matches,
            value: "^(NETWORK|TIMEOUT)".into(),
        }));
        assert!(holds(RecoveryCondition::Category {
            operator: ConditionOperator::Equals,
            value: "network".into(),
        }));
        assert!(holds(RecoveryCondition::Severity {
            operator: ConditionOperator::GreaterThan,
            value: "low".into(),
        }));
        assert!(!holds(RecoveryCondition::Severity {
            operator: ConditionOperator::GreaterThan,
            value: "MEDIUM".into(),
        }));
        assert!(holds(RecoveryCondition::severity_at_least(ErrorSeverity::Medium)));
        assert!(holds(RecoveryCondition::context_field(
            "component",
            ConditionOperator::OneOf,
            vec!["ocr", "ai"],
        )));
        assert!(holds(RecoveryCondition::context_field(
            "pages",
            ConditionOperator::GreaterThan,
            "10",
        )));
        assert!(!holds(RecoveryCondition::context_field(
            "pages",
            ConditionOperator::LessThan,
            "10",
        )));
        // Missing fields only satisfy NotEquals
        assert!(!holds(RecoveryCondition::context_field(
            "user_id",
            ConditionOperator::Equals,
            "u-1",
        )));
        assert!(holds(RecoveryCondition::context_field(
            "user_id",
            ConditionOperator::NotEquals,
            "u-1",
        )));
        assert!(holds(RecoveryCondition::custom(|e, _| e.is_retryable())));
    }

    #[tokio::test]
    async fn test_no_match_escalates() {
        let (engine, _clock, _audit) = engine();
        let result = engine
            .attempt_recovery(&AppError::validation("bad"), None, false)
            .await;
        assert!(!result.success);
        assert_eq!(result.action, RecoveryAction::Escalate);
        assert!(result.strategy_id.is_none());
    }

    #[tokio::test]
    async fn test_priority_and_registration_order() {
        let (engine, _clock, _audit) = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.set_action_handler(RecoveryAction::Fallback, failing_handler(calls.clone()));

        engine
            .register(
                RecoveryStrategy::new("second", RecoveryAction::Ignore)
                    .priority(10)
                    .when(RecoveryCondition::category_is(ErrorCategory::ExternalApi)),
            )
            .unwrap();
        engine
            .register(
                RecoveryStrategy::new("third", RecoveryAction::Retry)
                    .priority(10)
                    .when(RecoveryCondition::category_is(ErrorCategory::ExternalApi)),
            )
            .unwrap();
        engine
            .register(
                RecoveryStrategy::new("first", RecoveryAction::Fallback)
                    .priority(1)
                    .when(RecoveryCondition::category_is(ErrorCategory::ExternalApi)),
            )
            .unwrap();

        let ids: Vec<_> = engine.strategies().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);

        let error = AppError::external_api("ocr returned 503");
        let result = engine.attempt_recovery(&error, None, false).await;
        assert!(result.success);
        assert_eq!(result.strategy_id.as_deref(), Some("second"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.attempts_for(&error, None), 2);
    }

    #[tokio::test]
    async fn test_confirmation_required_does_not_consume_attempt() {
        let (engine, _clock, _audit) = engine();
        engine
            .register(
                RecoveryStrategy::new("logout", RecoveryAction::Redirect)
                    .redirect_to("/login")
                    .requires_confirmation()
                    .when(RecoveryCondition::category_is(ErrorCategory::Authentication)),
            )
            .unwrap();

        let error = AppError::unauthorized("token expired");
        let pending = engine.attempt_recovery(&error, None, false).await;
        assert!(pending.requires_user_action);
        assert!(!pending.success);
        assert_eq!(engine.attempts_for(&error, None), 0);

        let confirmed = engine.attempt_recovery(&error, None, true).await;
        assert!(confirmed.success);
        assert_eq!(confirmed.data.unwrap()["redirect_to"], "/login");
        assert_eq!(engine.attempts_for(&error, None), 1);
    }

    #[tokio::test]
    async fn test_cooldown_skips_recent_strategy() {
        let (engine, clock, _audit) = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.set_action_handler(RecoveryAction::Fallback, failing_handler(calls.clone()));
        engine
            .register(
                RecoveryStrategy::new("fallback", RecoveryAction::Fallback)
                    .cooldown(Duration::from_secs(60))
                    .when(RecoveryCondition::category_is(ErrorCategory::ExternalApi)),
            )
            .unwrap();

        let error = AppError::external_api("down");
        let first = engine.attempt_recovery(&error, None, false).await;
        assert!(!first.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = engine.attempt_recovery(&error, None, false).await;
        assert_eq!(second.action, RecoveryAction::Escalate);
        assert!(second.message.contains("cooling down"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different error identity is not affected
        let other = AppError::external_api("down")
            .with_context(ErrorContext::new().user("someone-else"));
        engine.attempt_recovery(&other, None, false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_secs(61));
        engine.attempt_recovery(&error, None, false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_cap_escalates() {
        let (engine, clock, _audit) = engine();
        engine
            .register(
                RecoveryStrategy::new("retry", RecoveryAction::Retry)
                    .cooldown(Duration::ZERO)
                    .when(RecoveryCondition::category_is(ErrorCategory::Network)),
            )
            .unwrap();

        let error = AppError::network("reset");
        for _ in 0..5 {
            let result = engine.attempt_recovery(&error, None, false).await;
            assert!(result.success);
            clock.advance(Duration::from_millis(1));
        }

        let capped = engine.attempt_recovery(&error, None, false).await;
        assert!(!capped.success);
        assert_eq!(capped.action, RecoveryAction::Escalate);
        assert!(capped.message.contains("limit"));

        engine.clear_attempts(&error, None);
        assert!(engine.attempt_recovery(&error, None, false).await.success);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let (engine, _clock, _audit) = engine();
        engine.register_custom_handler(
            "explode",
            handler_fn(|_error, _ctx| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(None)
            }),
        );
        engine
            .register(
                RecoveryStrategy::new("custom", RecoveryAction::Custom)
                    .handler("explode")
                    .when(RecoveryCondition::category_is(ErrorCategory::System)),
            )
            .unwrap();

        let result = engine
            .attempt_recovery(&AppError::internal("boom"), None, false)
            .await;
        assert_eq!(result.action, RecoveryAction::Escalate);

        let history = engine.history(None);
        let failed = history
            .iter()
            .find(|r| r.result.strategy_id.as_deref() == Some("custom"))
            .unwrap();
        let failure = failed.result.error.as_ref().unwrap();
        assert_eq!(failure.code(), codes::RECOVERY_FAILED);
        assert_eq!(failure.severity(), ErrorSeverity::Critical);
        assert!(failure.technical_message().contains("handler blew up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let (engine, _clock, _audit) = engine();
        engine.set_action_handler(
            RecoveryAction::CacheClear,
            handler_fn(|_error, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            }),
        );
        engine
            .register(
                RecoveryStrategy::new("cache", RecoveryAction::CacheClear)
                    .timeout(Duration::from_secs(1))
                    .when(RecoveryCondition::category_is(ErrorCategory::Database)),
            )
            .unwrap();

        let result = engine
            .attempt_recovery(&AppError::database("stale read"), None, false)
            .await;
        assert_eq!(result.action, RecoveryAction::Escalate);
        assert!(result.message.contains("timed out"));
    }

    #[test]
    fn test_default_strategies_all_register() {
        let defaults = default_strategies();
        for strategy in &defaults {
            assert!(strategy.validate().is_ok(), "{} should validate", strategy.id);
        }
        let engine = RecoveryEngine::with_defaults(
            RecoverySettings::default(),
            Arc::new(ManualClock::default()),
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap();
        let mut ids: Vec<_> = engine.strategies().into_iter().map(|s| s.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), defaults.len());
    }

    #[tokio::test]
    async fn test_defaults_cover_common_errors() {
        let clock = ManualClock::default();
        let engine = RecoveryEngine::with_defaults(
            RecoverySettings::default(),
            Arc::new(clock),
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap();
        assert_eq!(engine.strategies().len(), default_strategies().len());
        let retry = engine
            .attempt_recovery(&AppError::rate_limited("k", Duration::from_secs(7)), None, false)
            .await;
        assert!(retry.success);
        assert_eq!(retry.action, RecoveryAction::Retry);
        assert_eq!(retry.data.unwrap()["retry_after_ms"], 7000);

        let logout = engine
            .attempt_recovery(&AppError::unauthorized("expired"), None, false)
            .await;
        assert!(logout.success);
        assert_eq!(logout.action, RecoveryAction::Logout);
        let data = logout.data.unwrap();
        assert_eq!(data["logout"], true);
        assert_eq!(data["redirect_to"], "/login");

        let cache = engine
            .attempt_recovery(&AppError::database("stale read"), None, false)
            .await;
        assert!(cache.success);
        assert_eq!(cache.action, RecoveryAction::CacheClear);
        assert_eq!(cache.data.unwrap()["cache_clear"], true);

        let ignore = engine
            .attempt_recovery(&AppError::validation("bad"), None, false)
            .await;
        assert_eq!(ignore.action, RecoveryAction::Ignore);
        assert!(ignore.success);
    }

    #[tokio::test]
    async fn test_registered_session_handler_runs() {
        let (engine, _clock, _audit) = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        engine.set_action_handler(
            RecoveryAction::Logout,
            handler_fn(move |_error, _ctx| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        );
        engine
            .register(
                RecoveryStrategy::new("logout", RecoveryAction::Logout)
                    .redirect_to("/signin")
                    .when(RecoveryCondition::category_is(ErrorCategory::Authentication)),
            )
            .unwrap();

        let result = engine
            .attempt_recovery(&AppError::unauthorized("token expired"), None, false)
            .await;
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.data.unwrap()["redirect_to"], "/signin");
    }

    #[tokio::test]
    async fn test_enable_toggle_and_remove() {
        let (engine, _clock, _audit) = engine();
        engine
            .register(
                RecoveryStrategy::new("ignore", RecoveryAction::Ignore)
                    .when(RecoveryCondition::category_is(ErrorCategory::Validation)),
            )
            .unwrap();

        engine.set_enabled("ignore", false).unwrap();
        let result = engine
            .attempt_recovery(&AppError::validation("x"), None, false)
            .await;
        assert_eq!(result.action, RecoveryAction::Escalate);

        assert!(matches!(
            engine.set_enabled("missing", true),
            Err(ResilienceError::StrategyNotFound { .. })
        ));
        assert!(engine.remove("ignore"));
        assert!(engine.strategies().is_empty());
    }

    #[test]
    fn test_strategy_validation() {
        assert!(RecoveryStrategy::new("c", RecoveryAction::Custom).validate().is_err());
        assert!(RecoveryStrategy::new("r", RecoveryAction::Redirect).validate().is_err());
        assert!(RecoveryStrategy::new("x", RecoveryAction::Ignore)
            .when(RecoveryCondition::ErrorCode {
                operator: ConditionOperator::Matches,
                value: "([".into(),
            })
            .validate()
            .is_err());
        for strategy in default_strategies() {
            assert!(strategy.validate().is_ok(), "{}", strategy.id);
        }
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_stats_accumulate() {
        let clock = ManualClock::default();
        let engine = RecoveryEngine::new(
            RecoverySettings {
                history_limit: 3,
                ..Default::default()
            },
            Arc::new(clock.clone()),
            Arc::new(MemoryAuditSink::new()),
        );
        engine
            .register(
                RecoveryStrategy::new("ignore", RecoveryAction::Ignore)
                    .cooldown(Duration::ZERO)
                    .when(RecoveryCondition::category_is(ErrorCategory::Validation)),
            )
            .unwrap();

        for i in 0..5 {
            let error = AppError::validation(format!("field {}", i))
                .with_context(ErrorContext::new().user(format!("u-{}", i)));
            engine.attempt_recovery(&error, None, false).await;
        }

        assert_eq!(engine.history(None).len(), 3);
        let stats = engine.stats();
        assert_eq!(stats.total_attempts, 5);
        assert_eq!(stats.successful, 5);
        assert_eq!(stats.by_action.get(&RecoveryAction::Ignore), Some(&5));
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_bookkeeping() {
        let (engine, clock, _audit) = engine();
        engine
            .register(
                RecoveryStrategy::new("retry", RecoveryAction::Retry)
                    .cooldown(Duration::from_secs(10))
                    .when(RecoveryCondition::category_is(ErrorCategory::Network)),
            )
            .unwrap();
        engine
            .attempt_recovery(&AppError::network("reset"), None, false)
            .await;

        clock.advance(Duration::from_secs(11));
        assert_eq!(engine.sweep(), 1);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(engine.sweep(), 1);
    }
}
