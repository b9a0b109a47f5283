//! Audit sink seam
//!
//! The core reports noteworthy events (retries, breaker transitions, recovery
//! attempts, alerts) to an [`AuditSink`]. Durability and delivery are the
//! sink's concern; the default sink writes structured `tracing` events.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::classifier::ErrorSeverity;
use crate::recovery::RecoveryAction;

/// Event emitted by the resilience core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    OperationSucceeded {
        key: String,
        attempts: u32,
        elapsed_ms: u64,
    },
    OperationFailed {
        key: String,
        code: String,
        attempts: u32,
        elapsed_ms: u64,
        aborted: bool,
    },
    RetryScheduled {
        key: String,
        attempt: u32,
        delay_ms: u64,
        code: String,
    },
    CircuitTransition {
        key: String,
        from: CircuitState,
        to: CircuitState,
    },
    RateLimited {
        key: String,
        count: u64,
        limit: u64,
    },
    RecoveryAttempted {
        strategy_id: String,
        action: RecoveryAction,
        error_code: String,
        success: bool,
    },
    ErrorReported {
        report_id: String,
        code: String,
        severity: ErrorSeverity,
    },
    AlertTriggered {
        rule_id: String,
        rule_name: String,
        count: usize,
        threshold: usize,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::OperationSucceeded { .. } => "operation_succeeded",
            AuditEvent::OperationFailed { .. } => "operation_failed",
            AuditEvent::RetryScheduled { .. } => "retry_scheduled",
            AuditEvent::CircuitTransition { .. } => "circuit_transition",
            AuditEvent::RateLimited { .. } => "rate_limited",
            AuditEvent::RecoveryAttempted { .. } => "recovery_attempted",
            AuditEvent::ErrorReported { .. } => "error_reported",
            AuditEvent::AlertTriggered { .. } => "alert_triggered",
        }
    }
}

/// Receiver of audit events
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: AuditEvent);
}

/// Sink that writes every event as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::OperationSucceeded { key, attempts, elapsed_ms } => {
                debug!(key = %key, attempts, elapsed_ms, "Operation succeeded");
            }
            AuditEvent::OperationFailed { key, code, attempts, elapsed_ms, aborted } => {
                warn!(key = %key, code = %code, attempts, elapsed_ms, aborted, "Operation failed");
            }
            AuditEvent::RetryScheduled { key, attempt, delay_ms, code } => {
                debug!(key = %key, attempt, delay_ms, code = %code, "Retry scheduled");
            }
            AuditEvent::CircuitTransition { key, from, to } => {
                info!(circuit_breaker = %key, from = %from, to = %to, "Circuit breaker transition");
            }
            AuditEvent::RateLimited { key, count, limit } => {
                info!(key = %key, count, limit, "Rate limit exceeded");
            }
            AuditEvent::RecoveryAttempted { strategy_id, action, error_code, success } => {
                info!(
                    strategy = %strategy_id,
                    action = %action,
                    error_code = %error_code,
                    success,
                    "Recovery attempted"
                );
            }
            AuditEvent::ErrorReported { report_id, code, severity } => {
                debug!(report_id = %report_id, code = %code, severity = %severity, "Error reported");
            }
            AuditEvent::AlertTriggered { rule_id, rule_name, count, threshold } => {
                warn!(rule_id = %rule_id, rule = %rule_name, count, threshold, "Alert triggered");
            }
        }
    }
}

/// Sink that keeps events in memory, for hosts that inspect them directly
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<(DateTime<Utc>, AuditEvent)>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|(_, e)| e.kind() == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push((Utc::now(), event));
    }
}

/// Shared default sink
pub fn tracing_sink() -> Arc<dyn AuditSink> {
    Arc::new(TracingAuditSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects_events() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::RetryScheduled {
            key: "ocr".to_string(),
            attempt: 1,
            delay_ms: 100,
            code: "NETWORK_ERROR".to_string(),
        });
        sink.record(AuditEvent::RateLimited {
            key: "upload:u-1".to_string(),
            count: 4,
            limit: 3,
        });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count("rate_limited"), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_all_events() {
        let sink = TracingAuditSink;
        sink.record(AuditEvent::CircuitTransition {
            key: "ocr".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });
        sink.record(AuditEvent::AlertTriggered {
            rule_id: "r1".to_string(),
            rule_name: "auth spike".to_string(),
            count: 5,
            threshold: 5,
        });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = AuditEvent::ErrorReported {
            report_id: "abc".to_string(),
            code: "TIMEOUT".to_string(),
            severity: ErrorSeverity::Medium,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error_reported");
        assert_eq!(json["severity"], "MEDIUM");
    }
}
