//! Error report store and metrics aggregation
//!
//! Every terminal failure handed to [`ErrorMonitor::report_error`] becomes an
//! [`ErrorReport`]. Reports are append-only apart from their resolution
//! metadata and are purged by [`ErrorMonitor::prune`] once they age past the
//! retention horizon. Alert rules are evaluated against the store on every
//! report.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alerting::{AlertEngine, AlertRecord};
use crate::audit::{AuditEvent, AuditSink};
use crate::classifier::{AppError, ErrorCategory, ErrorContext, ErrorSeverity};
use crate::clock::{elapsed_between, sub_duration, Clock};
use crate::error::{ResilienceError, ResilienceResult};

/// A stored error occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub error: AppError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ErrorReport {
    /// User the report is attributed to, falling back to the session
    pub fn affected_entity(&self) -> Option<&str> {
        fn entity(ctx: &ErrorContext) -> Option<&str> {
            ctx.user_id.as_deref().or(ctx.session_id.as_deref())
        }
        self.context
            .as_ref()
            .and_then(entity)
            .or_else(|| self.error.context().and_then(entity))
    }

    pub fn time_to_resolution(&self) -> Option<Duration> {
        self.resolved_at
            .map(|resolved_at| elapsed_between(self.timestamp, resolved_at))
    }
}

/// Inclusive time interval for metrics queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `span` leading up to `now`
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start: sub_duration(now, span),
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }

    pub fn hours(&self) -> f64 {
        elapsed_between(self.start, self.end).as_secs_f64() / 3600.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeCount {
    pub code: String,
    pub count: usize,
}

/// Aggregated view over the reports in a range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorMetrics {
    pub range: TimeRange,
    pub total: usize,
    pub rate_per_hour: f64,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    /// Ten most frequent codes, most frequent first
    pub top_codes: Vec<CodeCount>,
    pub affected_entities: usize,
    pub resolved: usize,
    pub mean_time_to_resolution: Option<Duration>,
    pub hourly: BTreeMap<DateTime<Utc>, usize>,
    pub daily: BTreeMap<DateTime<Utc>, usize>,
}

/// Outcome of reporting one error
#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub report_id: String,
    pub alerts: Vec<AlertRecord>,
}

/// Error report store with alert evaluation
pub struct ErrorMonitor {
    reports: RwLock<Vec<ErrorReport>>,
    counters: DashMap<(ErrorCategory, String), u64>,
    alerts: Arc<AlertEngine>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for ErrorMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorMonitor")
            .field("reports", &self.reports.read().len())
            .field("counters", &self.counters.len())
            .field("alerts", &self.alerts)
            .finish()
    }
}

impl ErrorMonitor {
    pub fn new(alerts: Arc<AlertEngine>, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            reports: RwLock::new(Vec::new()),
            counters: DashMap::new(),
            alerts,
            clock,
            audit,
        }
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    /// Store `error` and evaluate alert rules; returns the report id
    pub async fn report_error(&self, error: &AppError, context: Option<&ErrorContext>) -> String {
        self.report(error, context).await.report_id
    }

    /// Like [`report_error`](Self::report_error), also returning any alerts fired
    pub async fn report(&self, error: &AppError, context: Option<&ErrorContext>) -> ReportOutcome {
        let now = self.clock.now();
        let report = ErrorReport {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            error: error.clone(),
            context: context.cloned(),
            resolved: false,
            resolved_by: None,
            resolution_notes: None,
            resolved_at: None,
        };
        let report_id = report.id.clone();

        log_report(&report);
        self.reports.write().push(report);
        *self
            .counters
            .entry((error.category(), error.code().to_string()))
            .or_insert(0) += 1;
        self.audit.record(AuditEvent::ErrorReported {
            report_id: report_id.clone(),
            code: error.code().to_string(),
            severity: error.severity(),
        });

        let mut alerts = Vec::new();
        for rule in self.alerts.matching_rules(error) {
            let window = TimeRange::last(rule.window, now);
            let count = self
                .reports
                .read()
                .iter()
                .filter(|r| window.contains(r.timestamp) && rule.matches(&r.error))
                .count();

            if let Some(claimed) = self.alerts.try_trigger(&rule.id, count) {
                alerts.push(self.alerts.fire(&claimed, count, error, context).await);
            }
        }

        ReportOutcome { report_id, alerts }
    }

    /// Mark a report resolved; a report can only be resolved once
    pub fn resolve_error(
        &self,
        id: &str,
        resolved_by: impl Into<String>,
        notes: Option<String>,
    ) -> ResilienceResult<ErrorReport> {
        let now = self.clock.now();
        let mut reports = self.reports.write();
        let report = reports
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ResilienceError::ReportNotFound { id: id.to_string() })?;

        if report.resolved {
            return Err(ResilienceError::ReportAlreadyResolved { id: id.to_string() });
        }

        report.resolved = true;
        report.resolved_by = Some(resolved_by.into());
        report.resolution_notes = notes;
        report.resolved_at = Some(now);
        info!(report_id = %id, code = report.error.code(), "Error report resolved");
        Ok(report.clone())
    }

    pub fn get_report(&self, id: &str) -> Option<ErrorReport> {
        self.reports.read().iter().find(|r| r.id == id).cloned()
    }

    /// Most recent reports first
    pub fn recent_reports(&self, limit: usize) -> Vec<ErrorReport> {
        self.reports.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }

    /// Occurrences of `code` in `category` since start, including pruned reports
    pub fn counter(&self, category: ErrorCategory, code: &str) -> u64 {
        self.counters
            .get(&(category, code.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Drop reports older than `older_than`; returns how many were removed
    pub fn prune(&self, older_than: Duration) -> usize {
        let cutoff = sub_duration(self.clock.now(), older_than);
        let mut reports = self.reports.write();
        let before = reports.len();
        reports.retain(|r| r.timestamp >= cutoff);
        let removed = before - reports.len();
        if removed > 0 {
            debug!(removed, retention_secs = older_than.as_secs(), "Pruned error reports");
        }
        removed
    }

    /// Aggregate the reports falling inside `range`
    pub fn get_error_metrics(&self, range: TimeRange) -> ErrorMetrics {
        let reports = self.reports.read();
        let in_range: Vec<&ErrorReport> = reports
            .iter()
            .filter(|r| range.contains(r.timestamp))
            .collect();

        let total = in_range.len();
        let hours = range.hours();
        let rate_per_hour = if hours > 0.0 {
            total as f64 / hours
        } else {
            total as f64
        };

        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut codes: HashMap<&str, usize> = HashMap::new();
        let mut entities = HashSet::new();
        let mut hourly = BTreeMap::new();
        let mut daily = BTreeMap::new();
        let mut resolved = 0usize;
        let mut resolution_total = Duration::ZERO;

        for report in &in_range {
            *by_category.entry(report.error.category()).or_insert(0) += 1;
            *by_severity.entry(report.error.severity()).or_insert(0) += 1;
            *codes.entry(report.error.code()).or_insert(0) += 1;
            if let Some(entity) = report.affected_entity() {
                entities.insert(entity);
            }
            *hourly.entry(bucket(report.timestamp, ChronoDuration::hours(1))).or_insert(0) += 1;
            *daily.entry(bucket(report.timestamp, ChronoDuration::days(1))).or_insert(0) += 1;
            if let Some(ttr) = report.time_to_resolution() {
                resolved += 1;
                resolution_total += ttr;
            }
        }

        let mut top_codes: Vec<CodeCount> = codes
            .into_iter()
            .map(|(code, count)| CodeCount {
                code: code.to_string(),
                count,
            })
            .collect();
        top_codes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));
        top_codes.truncate(10);

        let mean_time_to_resolution = if resolved > 0 {
            Some(resolution_total / resolved as u32)
        } else {
            None
        };

        ErrorMetrics {
            range,
            total,
            rate_per_hour,
            by_category,
            by_severity,
            top_codes,
            affected_entities: entities.len(),
            resolved,
            mean_time_to_resolution,
            hourly,
            daily,
        }
    }
}

fn bucket(at: DateTime<Utc>, size: ChronoDuration) -> DateTime<Utc> {
    at.duration_trunc(size).unwrap_or(at)
}

fn log_report(report: &ErrorReport) {
    let error = &report.error;
    let category = error.category();
    let retryable = error.is_retryable();
    let component = report
        .context
        .as_ref()
        .and_then(|c| c.component.as_deref())
        .or_else(|| error.context().and_then(|c| c.component.as_deref()))
        .unwrap_or("none");

    match error.severity() {
        ErrorSeverity::Low => info!(
            error_category = %category,
            retryable = retryable,
            component = component,
            report_id = %report.id,
            "Error reported: {}", error
        ),
        ErrorSeverity::Medium => warn!(
            error_category = %category,
            retryable = retryable,
            component = component,
            report_id = %report.id,
            "Error reported: {}", error
        ),
        ErrorSeverity::High | ErrorSeverity::Critical => error!(
            error_category = %category,
            retryable = retryable,
            component = component,
            report_id = %report.id,
            "Error reported: {}", error
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{AlertRule, LogDispatcher, NotificationChannel};
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn monitor_at(start: DateTime<Utc>) -> (ErrorMonitor, ManualClock) {
        let clock = ManualClock::new(start);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
        let alerts = Arc::new(AlertEngine::new(
            Arc::new(LogDispatcher::new()),
            shared.clone(),
            audit.clone(),
        ));
        (ErrorMonitor::new(alerts, shared, audit), clock)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap()
    }

    #[tokio::test]
    async fn test_report_and_lookup() {
        let (monitor, _clock) = monitor_at(start());
        let error = AppError::network("connection refused");
        let id = monitor
            .report_error(&error, Some(&ErrorContext::new().user("u-1")))
            .await;

        let report = monitor.get_report(&id).unwrap();
        assert_eq!(report.error.code(), "NETWORK_ERROR");
        assert_eq!(report.timestamp, start());
        assert_eq!(report.affected_entity(), Some("u-1"));
        assert!(!report.resolved);
        assert_eq!(monitor.counter(ErrorCategory::Network, "NETWORK_ERROR"), 1);
        assert_eq!(monitor.recent_reports(10).len(), 1);
        assert!(monitor.get_report("missing").is_none());
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let (monitor, clock) = monitor_at(start());
        let id = monitor.report_error(&AppError::database("deadlock"), None).await;

        clock.advance(Duration::from_secs(90));
        let resolved = monitor
            .resolve_error(&id, "ops", Some("restarted pool".to_string()))
            .unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops"));
        assert_eq!(resolved.time_to_resolution(), Some(Duration::from_secs(90)));

        assert!(matches!(
            monitor.resolve_error(&id, "someone", None),
            Err(ResilienceError::ReportAlreadyResolved { .. })
        ));
        assert!(matches!(
            monitor.resolve_error("nope", "someone", None),
            Err(ResilienceError::ReportNotFound { .. })
        ));
        assert_eq!(
            monitor.get_report(&id).unwrap().resolution_notes.as_deref(),
            Some("restarted pool")
        );
    }

    #[tokio::test]
    async fn test_metrics_aggregation() {
        let (monitor, clock) = monitor_at(start());

        let first = monitor
            .report_error(&AppError::network("a"), Some(&ErrorContext::new().user("u-1")))
            .await;
        monitor
            .report_error(&AppError::network("b"), Some(&ErrorContext::new().user("u-2")))
            .await;
        clock.advance(Duration::from_secs(3600));
        monitor
            .report_error(&AppError::validation("c"), Some(&ErrorContext::new().user("u-1")))
            .await;
        monitor.report_error(&AppError::database("d"), None).await;

        clock.advance(Duration::from_secs(60));
        monitor.resolve_error(&first, "ops", None).unwrap();

        let range = TimeRange::new(start(), start() + ChronoDuration::hours(2));
        let metrics = monitor.get_error_metrics(range);

        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.rate_per_hour, 2.0);
        assert_eq!(metrics.by_category.get(&ErrorCategory::Network), Some(&2));
        assert_eq!(metrics.by_severity.get(&ErrorSeverity::Critical), Some(&1));
        assert_eq!(metrics.top_codes[0], CodeCount { code: "NETWORK_ERROR".to_string(), count: 2 });
        assert_eq!(metrics.top_codes.len(), 3);
        assert_eq!(metrics.affected_entities, 2);
        assert_eq!(metrics.resolved, 1);
        assert_eq!(metrics.mean_time_to_resolution, Some(Duration::from_secs(3660)));

        let hours: Vec<usize> = metrics.hourly.values().copied().collect();
        assert_eq!(hours, vec![2, 2]);
        assert_eq!(
            metrics.hourly.keys().next().copied(),
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
        );
        assert_eq!(metrics.daily.len(), 1);

        // Read-only
        assert_eq!(monitor.len(), 4);
    }

    #[tokio::test]
    async fn test_metrics_outside_range_are_excluded() {
        let (monitor, clock) = monitor_at(start());
        monitor.report_error(&AppError::network("old"), None).await;
        clock.advance(Duration::from_secs(7200));
        monitor.report_error(&AppError::network("new"), None).await;

        let metrics = monitor.get_error_metrics(TimeRange::last(Duration::from_secs(3600), clock.now()));
        assert_eq!(metrics.total, 1);
        assert!(metrics.mean_time_to_resolution.is_none());
    }

    #[tokio::test]
    async fn test_prune_drops_old_reports_only() {
        let (monitor, clock) = monitor_at(start());
        monitor.report_error(&AppError::network("old"), None).await;
        clock.advance(Duration::from_secs(31 * 24 * 3600));
        monitor.report_error(&AppError::network("new"), None).await;

        assert_eq!(monitor.prune(Duration::from_secs(30 * 24 * 3600)), 1);
        assert_eq!(monitor.len(), 1);
        // Cumulative counters survive pruning
        assert_eq!(monitor.counter(ErrorCategory::Network, "NETWORK_ERROR"), 2);
    }

    #[tokio::test]
    async fn test_alert_counts_only_reports_inside_window() {
        let (monitor, clock) = monitor_at(start());
        monitor
            .alerts()
            .add_rule(
                AlertRule::new("net", "Network errors", 2, Duration::from_secs(60))
                    .category(ErrorCategory::Network)
                    .notify(NotificationChannel::Chat, "#ops"),
            )
            .unwrap();

        let outcome = monitor.report(&AppError::network("a"), None).await;
        assert!(outcome.alerts.is_empty());

        clock.advance(Duration::from_secs(61));
        let outcome = monitor.report(&AppError::network("b"), None).await;
        assert!(outcome.alerts.is_empty());

        // Unmatched categories do not count toward the rule
        monitor.report(&AppError::validation("x"), None).await;

        clock.advance(Duration::from_secs(60));
        let outcome = monitor.report(&AppError::network("c"), None).await;
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].payload.count, 2);
    }
}
