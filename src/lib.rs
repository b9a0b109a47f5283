//! Intake Resilience Library
//!
//! Resilience core for the claims-intake service: failure classification,
//! retries with backoff, per-key circuit breakers and rate limits, rule-driven
//! recovery and error monitoring with threshold alerts.

pub mod alerting;
pub mod audit;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod maintenance;
pub mod monitoring;
pub mod rate_limiter;
pub mod recovery;
pub mod retry;

// Re-export commonly used types
pub use crate::core::{Execution, HandledError, ResilienceCore, ResilienceCoreBuilder};
pub use alerting::{AlertEngine, AlertRule, NotificationChannel, NotificationDispatcher, NotificationTarget};
pub use audit::{AuditEvent, AuditSink};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use classifier::{codes, AppError, ErrorCategory, ErrorClassifier, ErrorContext, ErrorSeverity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ResilienceConfig, TimeUnit};
pub use error::*;
pub use maintenance::MaintenanceHandle;
pub use monitoring::{ErrorMetrics, ErrorMonitor, ErrorReport, TimeRange};
pub use rate_limiter::{RateLimitDecision, RateLimitRule, RateLimiter};
pub use recovery::{RecoveryAction, RecoveryCondition, RecoveryEngine, RecoveryResult, RecoveryStrategy};
pub use retry::{BackoffStrategy, JitterKind, RetryManager, RetryOptions, RetryResult};
