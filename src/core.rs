//! Wiring of the resilience components into one registry object
//!
//! A host builds one [`ResilienceCore`] at startup and shares it. There is no
//! process-global state: two cores never see each other's breakers, windows
//! or reports.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::alerting::{
    AlertEngine, LogDispatcher, MultiDispatcher, NotificationChannel, NotificationDispatcher,
    WebhookDispatcher,
};
use crate::audit::{tracing_sink, AuditSink};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{AppError, ErrorClassifier, ErrorContext};
use crate::clock::{system_clock, Clock};
use crate::config::{CounterStoreKind, ResilienceConfig};
use crate::error::{ResilienceError, ResilienceResult};
use crate::maintenance::{MaintenanceHandle, MaintenanceTargets};
use crate::monitoring::ErrorMonitor;
use crate::rate_limiter::{
    AtomicCounterBackend, CounterStore, InMemoryCounterStore, RateLimiter, SharedCounterStore,
};
use crate::recovery::{RecoveryEngine, RecoveryResult};
use crate::retry::{RetryManager, RetryOptions, RetryResult};

/// Builder for [`ResilienceCore`]
pub struct ResilienceCoreBuilder {
    config: ResilienceConfig,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    counter_backend: Option<Arc<dyn AtomicCounterBackend>>,
}

impl std::fmt::Debug for ResilienceCoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceCoreBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("audit", &self.audit)
            .field("dispatcher", &self.dispatcher.as_ref().map(|d| d.name().to_string()))
            .field("counter_backend", &self.counter_backend)
            .finish()
    }
}

impl ResilienceCoreBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            clock: None,
            audit: None,
            dispatcher: None,
            counter_backend: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the default log/webhook notification routing
    pub fn dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Backend for the `shared` rate-limit store
    pub fn counter_backend(mut self, backend: Arc<dyn AtomicCounterBackend>) -> Self {
        self.counter_backend = Some(backend);
        self
    }

    pub fn build(self) -> ResilienceResult<ResilienceCore> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let audit = self.audit.unwrap_or_else(tracing_sink);

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.to_config(),
            clock.clone(),
            audit.clone(),
        ));
        for (key, breaker_config) in config.circuit_breaker.override_configs() {
            breakers.set_config(key, breaker_config);
        }

        let store: Arc<dyn CounterStore> = match config.rate_limit.store {
            CounterStoreKind::Memory => Arc::new(InMemoryCounterStore::new(clock.clone())),
            CounterStoreKind::Shared => {
                let backend = self.counter_backend.ok_or_else(|| {
                    ResilienceError::invalid_config(
                        "rate_limit.store is 'shared' but no counter backend was supplied",
                    )
                })?;
                Arc::new(
                    SharedCounterStore::new(backend, clock.clone())
                        .with_namespace(config.rate_limit.namespace.clone()),
                )
            }
        };
        let limiter = Arc::new(RateLimiter::new(
            store,
            config.rate_limit.default_rule(),
            clock.clone(),
            audit.clone(),
        ));
        for (prefix, rule) in config.rate_limit.prefix_rules() {
            limiter.set_rule(prefix, rule);
        }

        let retry = RetryManager::new(config.retry.to_options(), clock.clone(), audit.clone())
            .with_circuit_breakers(breakers.clone())
            .with_rate_limiter(limiter.clone());

        let recovery = if config.recovery.default_strategies {
            RecoveryEngine::with_defaults(config.recovery.settings.clone(), clock.clone(), audit.clone())?
        } else {
            RecoveryEngine::new(config.recovery.settings.clone(), clock.clone(), audit.clone())
        };
        for strategy in &config.recovery.strategies {
            recovery.register(strategy.clone())?;
        }

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => default_dispatcher(config.monitoring.webhook_timeout.into())?,
        };
        let alerts = Arc::new(
            AlertEngine::new(dispatcher, clock.clone(), audit.clone())
                .with_history_limit(config.monitoring.alert_history_limit),
        );
        for rule in &config.monitoring.alert_rules {
            alerts.add_rule(rule.clone())?;
        }
        let monitor = Arc::new(ErrorMonitor::new(alerts, clock.clone(), audit.clone()));

        info!(
            rate_limit_store = limiter.store_name(),
            recovery_strategies = recovery.strategies().len(),
            alert_rules = config.monitoring.alert_rules.len(),
            "Resilience core initialized"
        );

        Ok(ResilienceCore {
            config,
            classifier: ErrorClassifier::with_clock(clock.clone()),
            clock,
            breakers,
            limiter,
            retry,
            recovery: Arc::new(recovery),
            monitor,
        })
    }
}

fn default_dispatcher(webhook_timeout: Duration) -> ResilienceResult<Arc<dyn NotificationDispatcher>> {
    let webhook = WebhookDispatcher::with_timeout("webhook", webhook_timeout)?;
    Ok(Arc::new(
        MultiDispatcher::new()
            .route(NotificationChannel::Webhook, Arc::new(webhook))
            .fallback(Arc::new(LogDispatcher::new())),
    ))
}

/// Outcome of [`ResilienceCore::execute`]
#[derive(Debug)]
pub struct Execution<T> {
    pub result: RetryResult<T>,
    /// Set when a terminal failure was reported to the monitor
    pub report_id: Option<String>,
    /// Set when a terminal failure went through the recovery engine
    pub recovery: Option<RecoveryResult>,
}

/// A failure after it has been reported and run through recovery
#[derive(Debug, Clone)]
pub struct HandledError {
    pub error: AppError,
    pub report_id: String,
    pub recovery: RecoveryResult,
}

/// The assembled resilience core
#[derive(Debug)]
pub struct ResilienceCore {
    config: ResilienceConfig,
    clock: Arc<dyn Clock>,
    classifier: ErrorClassifier,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    retry: RetryManager,
    recovery: Arc<RecoveryEngine>,
    monitor: Arc<ErrorMonitor>,
}

impl ResilienceCore {
    pub fn builder(config: ResilienceConfig) -> ResilienceCoreBuilder {
        ResilienceCoreBuilder::new(config)
    }

    /// Core with default configuration, system clock and tracing audit sink
    pub fn with_defaults() -> ResilienceResult<Self> {
        Self::builder(ResilienceConfig::default()).build()
    }

    /// Run `operation` under `options`; terminal failures are reported and recovered
    ///
    /// Cancelled runs are returned as they are, without a report.
    pub async fn execute<F, Fut, T, E>(&self, operation: F, options: &RetryOptions) -> Execution<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let result = self.retry.execute(operation, options).await;

        let handled = match (&result.outcome, result.aborted) {
            (Err(error), false) => Some(self.handle(error, options.context.as_ref(), false).await),
            _ => None,
        };

        match handled {
            Some(handled) => Execution {
                result,
                report_id: Some(handled.report_id),
                recovery: Some(handled.recovery),
            },
            None => Execution {
                result,
                report_id: None,
                recovery: None,
            },
        }
    }

    /// Normalize, report and recover a failure raised outside [`execute`](Self::execute)
    pub async fn handle_error(
        &self,
        error: &(dyn std::error::Error + 'static),
        context: Option<&ErrorContext>,
        user_confirmed: bool,
    ) -> HandledError {
        let normalized = self.classifier.normalize(error, context);
        self.handle(&normalized, context, user_confirmed).await
    }

    async fn handle(
        &self,
        error: &AppError,
        context: Option<&ErrorContext>,
        user_confirmed: bool,
    ) -> HandledError {
        let report_id = self.monitor.report_error(error, context).await;
        let recovery = self
            .recovery
            .attempt_recovery(error, context, user_confirmed)
            .await;
        debug!(
            report_id = %report_id,
            code = error.code(),
            action = %recovery.action,
            recovered = recovery.success,
            "Terminal failure handled"
        );
        HandledError {
            error: error.clone(),
            report_id,
            recovery,
        }
    }

    /// Spawn report pruning and bookkeeping sweeps on the current runtime
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        MaintenanceHandle::start(
            MaintenanceTargets {
                monitor: self.monitor.clone(),
                limiter: self.limiter.clone(),
                recovery: self.recovery.clone(),
            },
            self.config.monitoring.maintenance(),
        )
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        self.monitor.alerts()
    }
}
