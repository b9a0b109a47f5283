//! Threshold alert rules and notification dispatch
//!
//! An [`AlertRule`] fires when enough matching errors land inside its window,
//! then stays quiet until its cooldown has elapsed. Delivery is delegated to a
//! [`NotificationDispatcher`]; a failed delivery is logged and recorded but
//! never surfaces to the caller that reported the error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::classifier::{AppError, ErrorCategory, ErrorContext, ErrorSeverity};
use crate::clock::{elapsed_between, Clock};
use crate::config::duration_format;
use crate::error::{ResilienceError, ResilienceResult};

const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Kind of outbound channel a target names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Chat,
    Webhook,
    Sms,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::Email => write!(f, "email"),
            NotificationChannel::Chat => write!(f, "chat"),
            NotificationChannel::Webhook => write!(f, "webhook"),
            NotificationChannel::Sms => write!(f, "sms"),
        }
    }
}

/// Where a fired alert is sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub channel: NotificationChannel,
    /// Address, room, URL or phone number, depending on the channel
    pub target: String,
}

impl NotificationTarget {
    pub fn new(channel: NotificationChannel, target: impl Into<String>) -> Self {
        Self {
            channel,
            target: target.into(),
        }
    }
}

/// Which errors a rule counts; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertCondition {
    pub code: Option<String>,
    pub category: Option<ErrorCategory>,
    pub min_severity: Option<ErrorSeverity>,
}

impl AlertCondition {
    pub fn matches(&self, error: &AppError) -> bool {
        self.code.as_deref().map_or(true, |code| code == error.code())
            && self.category.map_or(true, |category| category == error.category())
            && self
                .min_severity
                .map_or(true, |severity| error.severity() >= severity)
    }
}

/// Threshold-and-window notification trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub condition: AlertCondition,
    pub threshold: usize,
    #[serde(with = "duration_format")]
    pub window: Duration,
    #[serde(with = "duration_format", default = "default_cooldown")]
    pub cooldown: Duration,
    #[serde(default)]
    pub targets: Vec<NotificationTarget>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> Duration {
    Duration::from_secs(15 * 60)
}

impl AlertRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, threshold: usize, window: Duration) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition: AlertCondition::default(),
            threshold,
            window,
            cooldown: default_cooldown(),
            targets: Vec::new(),
            enabled: true,
            last_triggered: None,
        }
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.condition.code = Some(code.into());
        self
    }

    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.condition.category = Some(category);
        self
    }

    pub fn min_severity(mut self, severity: ErrorSeverity) -> Self {
        self.condition.min_severity = Some(severity);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn notify(mut self, channel: NotificationChannel, target: impl Into<String>) -> Self {
        self.targets.push(NotificationTarget::new(channel, target));
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.id.trim().is_empty() {
            return Err(ResilienceError::invalid_config("alert rule id must not be empty"));
        }
        if self.threshold == 0 {
            return Err(ResilienceError::invalid_config(format!(
                "alert rule '{}' threshold must be at least 1",
                self.id
            )));
        }
        if self.window.is_zero() {
            return Err(ResilienceError::invalid_config(format!(
                "alert rule '{}' window must be greater than zero",
                self.id
            )));
        }
        Ok(())
    }

    pub fn matches(&self, error: &AppError) -> bool {
        self.condition.matches(error)
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered {
            Some(last) => elapsed_between(last, now) < self.cooldown,
            None => false,
        }
    }
}

/// Structured content handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub error_code: String,
    pub error_message: String,
    pub severity: ErrorSeverity,
    pub count: usize,
    pub threshold: usize,
    pub window_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,
    pub triggered_at: DateTime<Utc>,
}

impl AlertPayload {
    /// One-line summary used by text channels
    pub fn summary(&self) -> String {
        format!(
            "ALERT [{}] {}: {} occurrences of {} in {}s (threshold {}) - {}",
            self.severity,
            self.rule_name,
            self.count,
            self.error_code,
            self.window_secs,
            self.threshold,
            self.error_message
        )
    }
}

/// Delivers alert payloads to a target
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, target: &NotificationTarget, payload: &AlertPayload) -> ResilienceResult<()>;

    fn name(&self) -> &str;
}

/// Dispatcher that writes alerts to the log
#[derive(Debug)]
pub struct LogDispatcher {
    name: String,
}

impl LogDispatcher {
    pub fn new() -> Self {
        Self {
            name: "log".to_string(),
        }
    }
}

impl Default for LogDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, target: &NotificationTarget, payload: &AlertPayload) -> ResilienceResult<()> {
        let message = payload.summary();
        match payload.severity {
            ErrorSeverity::Low => info!(channel = %target.channel, target = %target.target, "{}", message),
            ErrorSeverity::Medium => warn!(channel = %target.channel, target = %target.target, "{}", message),
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(channel = %target.channel, target = %target.target, "{}", message)
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Dispatcher that POSTs the payload as JSON to the target URL
#[derive(Debug)]
pub struct WebhookDispatcher {
    name: String,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(name: impl Into<String>, timeout: Duration) -> ResilienceResult<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResilienceError::notification(name.clone(), e.to_string()))?;
        Ok(Self { name, client })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn dispatch(&self, target: &NotificationTarget, payload: &AlertPayload) -> ResilienceResult<()> {
        let body = serde_json::json!({
            "alert": payload,
            "summary": payload.summary(),
            "channel": target.channel,
        });

        let response = self
            .client
            .post(&target.target)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ResilienceError::notification(&self.name, format!("Failed to send webhook alert: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(ResilienceError::notification(
                &self.name,
                format!("Webhook returned error status: {}", response.status()),
            ));
        }

        debug!("Alert sent via webhook: {}", payload.alert_id);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Routes each target to the dispatcher registered for its channel kind
pub struct MultiDispatcher {
    routes: HashMap<NotificationChannel, Arc<dyn NotificationDispatcher>>,
    fallback: Option<Arc<dyn NotificationDispatcher>>,
}

impl fmt::Debug for MultiDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDispatcher")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}

impl MultiDispatcher {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: None,
        }
    }

    pub fn route(mut self, channel: NotificationChannel, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.routes.insert(channel, dispatcher);
        self
    }

    /// Dispatcher for channels without an explicit route
    pub fn fallback(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.fallback = Some(dispatcher);
        self
    }
}

impl Default for MultiDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationDispatcher for MultiDispatcher {
    async fn dispatch(&self, target: &NotificationTarget, payload: &AlertPayload) -> ResilienceResult<()> {
        match self.routes.get(&target.channel).or(self.fallback.as_ref()) {
            Some(dispatcher) => dispatcher.dispatch(target, payload).await,
            None => Err(ResilienceError::notification(
                target.channel.to_string(),
                "no dispatcher registered for channel",
            )),
        }
    }

    fn name(&self) -> &str {
        "multi"
    }
}

/// Result of delivering one alert to one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub target: NotificationTarget,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A fired alert, kept in the history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub payload: AlertPayload,
    pub deliveries: Vec<DeliveryOutcome>,
}

/// Alert rule registry and trigger logic
pub struct AlertEngine {
    rules: RwLock<Vec<AlertRule>>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    history: RwLock<Vec<AlertRecord>>,
    max_history: usize,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("rules", &self.rules.read().len())
            .field("dispatcher", &"<trait object>")
            .field("history", &self.history.read().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl AlertEngine {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            dispatcher,
            history: RwLock::new(Vec::new()),
            max_history: DEFAULT_HISTORY_LIMIT,
            clock,
            audit,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.max_history = limit;
        self
    }

    /// Add a rule, replacing any rule with the same id
    pub fn add_rule(&self, rule: AlertRule) -> ResilienceResult<()> {
        rule.validate()?;
        let mut rules = self.rules.write();
        rules.retain(|r| r.id != rule.id);
        info!(rule_id = %rule.id, threshold = rule.threshold, window_secs = rule.window.as_secs(), "Alert rule added");
        rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> ResilienceResult<()> {
        let mut rules = self.rules.write();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ResilienceError::AlertRuleNotFound { id: id.to_string() })?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    pub fn rule(&self, id: &str) -> Option<AlertRule> {
        self.rules.read().iter().find(|r| r.id == id).cloned()
    }

    /// Enabled rules whose condition matches `error`
    pub fn matching_rules(&self, error: &AppError) -> Vec<AlertRule> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.matches(error))
            .cloned()
            .collect()
    }

    /// Claim the right to fire `rule_id` given `count` matches in its window
    ///
    /// Checks threshold and cooldown and stamps `last_triggered` under one
    /// lock, so concurrent reporters cannot both fire the same rule.
    pub fn try_trigger(&self, rule_id: &str, count: usize) -> Option<AlertRule> {
        let now = self.clock.now();
        let mut rules = self.rules.write();
        let rule = rules.iter_mut().find(|r| r.id == rule_id && r.enabled)?;

        if count < rule.threshold {
            return None;
        }
        if rule.in_cooldown(now) {
            debug!(rule_id = %rule.id, count, "Alert threshold reached during cooldown");
            return None;
        }

        rule.last_triggered = Some(now);
        Some(rule.clone())
    }

    /// Deliver a claimed alert to every target of `rule`
    pub async fn fire(
        &self,
        rule: &AlertRule,
        count: usize,
        error: &AppError,
        context: Option<&ErrorContext>,
    ) -> AlertRecord {
        let payload = AlertPayload {
            alert_id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            error_code: error.code().to_string(),
            error_message: error.technical_message().to_string(),
            severity: error.severity(),
            count,
            threshold: rule.threshold,
            window_secs: rule.window.as_secs(),
            context: context.cloned().or_else(|| error.context().cloned()),
            triggered_at: rule.last_triggered.unwrap_or_else(|| self.clock.now()),
        };

        warn!(
            rule_id = %rule.id,
            rule = %rule.name,
            count,
            threshold = rule.threshold,
            targets = rule.targets.len(),
            "Alert rule triggered"
        );
        self.audit.record(AuditEvent::AlertTriggered {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            count,
            threshold: rule.threshold,
        });

        let mut deliveries = Vec::with_capacity(rule.targets.len());
        for target in &rule.targets {
            let outcome = match self.dispatcher.dispatch(target, &payload).await {
                Ok(()) => DeliveryOutcome {
                    target: target.clone(),
                    delivered: true,
                    error: None,
                },
                Err(e) => {
                    error!(
                        "Failed to send alert via {} to {}: {}",
                        target.channel, target.target, e
                    );
                    DeliveryOutcome {
                        target: target.clone(),
                        delivered: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            deliveries.push(outcome);
        }

        let record = AlertRecord { payload, deliveries };
        let mut history = self.history.write();
        history.push(record.clone());
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(0..excess);
        }
        record
    }

    /// Most recent alerts first
    pub fn history(&self, limit: Option<usize>) -> Vec<AlertRecord> {
        let history = self.history.read();
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Clear `last_triggered` on rules whose cooldown has elapsed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut cleared = 0;
        for rule in self.rules.write().iter_mut() {
            if rule.last_triggered.is_some() && !rule.in_cooldown(now) {
                rule.last_triggered = None;
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<(NotificationTarget, AlertPayload)>>,
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn dispatch(&self, target: &NotificationTarget, payload: &AlertPayload) -> ResilienceResult<()> {
            self.sent.lock().push((target.clone(), payload.clone()));
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[derive(Debug)]
    struct FailingDispatcher;

    #[async_trait]
    impl NotificationDispatcher for FailingDispatcher {
        async fn dispatch(&self, target: &NotificationTarget, _payload: &AlertPayload) -> ResilienceResult<()> {
            Err(ResilienceError::notification(target.channel.to_string(), "unreachable"))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn auth_rule() -> AlertRule {
        AlertRule::new("auth-spike", "Authentication spike", 3, Duration::from_secs(300))
            .category(ErrorCategory::Authentication)
            .cooldown(Duration::from_secs(600))
            .notify(NotificationChannel::Chat, "#intake-ops")
    }

    #[test]
    fn test_condition_matching() {
        let any = AlertCondition::default();
        assert!(any.matches(&AppError::validation("x")));

        let severe = AlertCondition {
            min_severity: Some(ErrorSeverity::High),
            ..Default::default()
        };
        assert!(severe.matches(&AppError::unauthorized("x")));
        assert!(!severe.matches(&AppError::network("x")));

        let coded = AlertCondition {
            code: Some("TIMEOUT".to_string()),
            category: Some(ErrorCategory::Network),
            min_severity: None,
        };
        assert!(coded.matches(&AppError::timeout(Duration::from_secs(1))));
        assert!(!coded.matches(&AppError::network("x")));
    }

    #[test]
    fn test_rule_validation() {
        assert!(auth_rule().validate().is_ok());
        assert!(AlertRule::new("r", "r", 0, Duration::from_secs(1)).validate().is_err());
        assert!(AlertRule::new("r", "r", 1, Duration::ZERO).validate().is_err());
        assert!(AlertRule::new(" ", "r", 1, Duration::from_secs(1)).validate().is_err());
    }

    #[test]
    fn test_trigger_respects_threshold_and_cooldown() {
        let clock = ManualClock::default();
        let engine = AlertEngine::new(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(clock.clone()),
            Arc::new(MemoryAuditSink::new()),
        );
        engine.add_rule(auth_rule()).unwrap();

        assert!(engine.try_trigger("auth-spike", 2).is_none());
        let fired = engine.try_trigger("auth-spike", 3).unwrap();
        assert_eq!(fired.last_triggered, Some(clock.now()));

        clock.advance(Duration::from_secs(599));
        assert!(engine.try_trigger("auth-spike", 10).is_none());

        clock.advance(Duration::from_secs(1));
        assert!(engine.try_trigger("auth-spike", 3).is_some());
    }

    #[test]
    fn test_disabled_rules_never_trigger() {
        let engine = AlertEngine::new(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(ManualClock::default()),
            Arc::new(MemoryAuditSink::new()),
        );
        engine.add_rule(auth_rule()).unwrap();
        engine.set_enabled("auth-spike", false).unwrap();

        assert!(engine.matching_rules(&AppError::unauthorized("x")).is_empty());
        assert!(engine.try_trigger("auth-spike", 100).is_none());
        assert!(matches!(
            engine.set_enabled("nope", true),
            Err(ResilienceError::AlertRuleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fire_dispatches_to_every_target() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let audit = MemoryAuditSink::new();
        let engine = AlertEngine::new(
            dispatcher.clone(),
            Arc::new(ManualClock::default()),
            Arc::new(audit.clone()),
        );
        let rule = auth_rule().notify(NotificationChannel::Email, "oncall@example.com");
        engine.add_rule(rule).unwrap();

        let rule = engine.try_trigger("auth-spike", 3).unwrap();
        let error = AppError::unauthorized("token expired")
            .with_context(ErrorContext::new().user("u-7"));
        let record = engine.fire(&rule, 3, &error, None).await;

        assert_eq!(record.deliveries.len(), 2);
        assert!(record.deliveries.iter().all(|d| d.delivered));
        assert_eq!(record.payload.count, 3);
        assert_eq!(record.payload.window_secs, 300);
        assert_eq!(
            record.payload.context.as_ref().and_then(|c| c.user_id.as_deref()),
            Some("u-7")
        );

        let sent = dispatcher.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.channel, NotificationChannel::Chat);
        assert_eq!(audit.count("alert_triggered"), 1);
        assert_eq!(engine.history(None).len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_recorded_not_raised() {
        let engine = AlertEngine::new(
            Arc::new(FailingDispatcher),
            Arc::new(ManualClock::default()),
            Arc::new(MemoryAuditSink::new()),
        );
        engine.add_rule(auth_rule()).unwrap();
        let rule = engine.try_trigger("auth-spike", 3).unwrap();

        let record = engine
            .fire(&rule, 3, &AppError::unauthorized("x"), None)
            .await;
        assert!(!record.deliveries[0].delivered);
        assert!(record.deliveries[0].error.as_ref().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_multi_dispatcher_routes_by_channel() {
        let chat = Arc::new(RecordingDispatcher::default());
        let multi = MultiDispatcher::new().route(NotificationChannel::Chat, chat.clone());

        let payload = AlertPayload {
            alert_id: "a".to_string(),
            rule_id: "r".to_string(),
            rule_name: "rule".to_string(),
            error_code: "TIMEOUT".to_string(),
            error_message: "slow".to_string(),
            severity: ErrorSeverity::Medium,
            count: 1,
            threshold: 1,
            window_secs: 60,
            context: None,
            triggered_at: Utc::now(),
        };

        multi
            .dispatch(&NotificationTarget::new(NotificationChannel::Chat, "#ops"), &payload)
            .await
            .unwrap();
        assert_eq!(chat.sent.lock().len(), 1);

        let missing = multi
            .dispatch(&NotificationTarget::new(NotificationChannel::Sms, "+100"), &payload)
            .await;
        assert!(matches!(missing, Err(ResilienceError::Notification { .. })));

        let multi = multi.fallback(Arc::new(LogDispatcher::new()));
        assert!(multi
            .dispatch(&NotificationTarget::new(NotificationChannel::Sms, "+100"), &payload)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let engine = AlertEngine::new(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(ManualClock::default()),
            Arc::new(MemoryAuditSink::new()),
        )
        .with_history_limit(2);
        let rule = auth_rule();
        for _ in 0..4 {
            engine.fire(&rule, 3, &AppError::unauthorized("x"), None).await;
        }
        assert_eq!(engine.history(None).len(), 2);
        assert_eq!(engine.history(Some(1)).len(), 1);
    }

    #[test]
    fn test_sweep_clears_expired_stamps() {
        let clock = ManualClock::default();
        let engine = AlertEngine::new(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(clock.clone()),
            Arc::new(MemoryAuditSink::new()),
        );
        engine.add_rule(auth_rule()).unwrap();
        engine.try_trigger("auth-spike", 3).unwrap();

        assert_eq!(engine.sweep(), 0);
        clock.advance(Duration::from_secs(600));
        assert_eq!(engine.sweep(), 1);
        assert!(engine.rule("auth-spike").unwrap().last_triggered.is_none());
    }
}
