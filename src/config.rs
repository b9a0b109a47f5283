//! Configuration for the resilience core

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::alerting::AlertRule;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::maintenance::MaintenanceSettings;
use crate::rate_limiter::RateLimitRule;
use crate::recovery::{RecoverySettings, RecoveryStrategy};
use crate::retry::{BackoffStrategy, JitterKind, RetryOptions};

// =============================================================================
// UNIT PARSING UTILITIES
// =============================================================================

/// Time unit that supports parsing from strings with units (ms, s, m, h, d)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeUnit(pub u64); // Store as milliseconds

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60_000;
const MS_PER_HOUR: u64 = 3_600_000;
const MS_PER_DAY: u64 = 86_400_000;

impl TimeUnit {
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty time string".to_string());
        }

        // Extract number and unit
        let (num_str, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
            (num, 1)
        } else if let Some(num) = s.strip_suffix('s') {
            (num, MS_PER_SECOND)
        } else if let Some(num) = s.strip_suffix('m') {
            (num, MS_PER_MINUTE)
        } else if let Some(num) = s.strip_suffix('h') {
            (num, MS_PER_HOUR)
        } else if let Some(num) = s.strip_suffix('d') {
            (num, MS_PER_DAY)
        } else {
            // No unit, assume seconds
            (s, MS_PER_SECOND)
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number: {}", num_str))?;

        num.checked_mul(unit_ms)
            .map(TimeUnit)
            .ok_or_else(|| format!("Time value out of range: {}", s))
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        if ms == 0 {
            write!(f, "0ms")
        } else if ms % MS_PER_DAY == 0 {
            write!(f, "{}d", ms / MS_PER_DAY)
        } else if ms % MS_PER_HOUR == 0 {
            write!(f, "{}h", ms / MS_PER_HOUR)
        } else if ms % MS_PER_MINUTE == 0 {
            write!(f, "{}m", ms / MS_PER_MINUTE)
        } else if ms % MS_PER_SECOND == 0 {
            write!(f, "{}s", ms / MS_PER_SECOND)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

impl TryFrom<String> for TimeUnit {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeUnit> for String {
    fn from(time: TimeUnit) -> String {
        time.to_string()
    }
}

impl From<Duration> for TimeUnit {
    fn from(duration: Duration) -> Self {
        TimeUnit(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<TimeUnit> for Duration {
    fn from(time: TimeUnit) -> Duration {
        time.as_duration()
    }
}

/// Serde adapter writing `Duration` fields as [`TimeUnit`] strings
///
/// Bare integers are read as seconds.
pub mod duration_format {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Seconds(u64),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&TimeUnit::from(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text
                .parse::<TimeUnit>()
                .map(Duration::from)
                .map_err(serde::de::Error::custom),
            Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            match Option::<Repr>::deserialize(deserializer)? {
                Some(Repr::Text(text)) => text
                    .parse::<TimeUnit>()
                    .map(|t| Some(t.into()))
                    .map_err(serde::de::Error::custom),
                Some(Repr::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
                None => Ok(None),
            }
        }
    }
}

// =============================================================================
// MAIN CONFIGURATION STRUCTURE
// =============================================================================

/// Top-level configuration, one section per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub logging: LoggingSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limit: RateLimitSettings,
    pub recovery: RecoveryConfig,
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Default retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: BackoffStrategy,
    pub max_retries: u32,
    pub base_delay: TimeUnit,
    pub max_delay: TimeUnit,
    pub multiplier: f64,
    pub jitter: bool,
    pub jitter_kind: JitterKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeUnit>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from(&RetryOptions::default())
    }
}

impl From<&RetryOptions> for RetrySettings {
    fn from(options: &RetryOptions) -> Self {
        Self {
            strategy: options.strategy,
            max_retries: options.max_retries,
            base_delay: options.base_delay.into(),
            max_delay: options.max_delay.into(),
            multiplier: options.multiplier,
            jitter: options.jitter,
            jitter_kind: options.jitter_kind,
            timeout: options.timeout.map(TimeUnit::from),
        }
    }
}

impl RetrySettings {
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            strategy: self.strategy,
            max_retries: self.max_retries,
            base_delay: self.base_delay.into(),
            max_delay: self.max_delay.into(),
            multiplier: self.multiplier,
            jitter: self.jitter,
            jitter_kind: self.jitter_kind,
            timeout: self.timeout.map(Duration::from),
            ..Default::default()
        }
    }
}

/// Breaker thresholds, with per-key overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: TimeUnit,
    pub monitor_window: TimeUnit,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, BreakerOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    pub failure_threshold: u32,
    pub reset_timeout: TimeUnit,
    pub monitor_window: TimeUnit,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout.into(),
            monitor_window: config.monitor_window.into(),
            overrides: HashMap::new(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.failure_threshold)
            .reset_timeout(self.reset_timeout.into())
            .monitor_window(self.monitor_window.into())
    }

    pub fn override_configs(&self) -> Vec<(String, CircuitBreakerConfig)> {
        self.overrides
            .iter()
            .map(|(key, o)| {
                (
                    key.clone(),
                    CircuitBreakerConfig::new(o.failure_threshold)
                        .reset_timeout(o.reset_timeout.into())
                        .monitor_window(o.monitor_window.into()),
                )
            })
            .collect()
    }
}

/// Which counter store backs the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterStoreKind {
    /// Per-process map
    Memory,
    /// Host-supplied atomic counter backend shared between processes
    Shared,
}

/// Rate-limit thresholds, with per-prefix rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub store: CounterStoreKind,
    /// Prefix for keys written to a shared store
    pub namespace: String,
    pub max_requests: u64,
    pub window: TimeUnit,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub rules: HashMap<String, PrefixRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixRule {
    pub max_requests: u64,
    pub window: TimeUnit,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let rule = RateLimitRule::default();
        Self {
            store: CounterStoreKind::Memory,
            namespace: "ratelimit".to_string(),
            max_requests: rule.max_requests,
            window: rule.window.into(),
            rules: HashMap::new(),
        }
    }
}

impl RateLimitSettings {
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.max_requests, self.window.into())
    }

    pub fn prefix_rules(&self) -> Vec<(String, RateLimitRule)> {
        self.rules
            .iter()
            .map(|(prefix, r)| (prefix.clone(), RateLimitRule::new(r.max_requests, r.window.into())))
            .collect()
    }
}

/// Recovery engine limits and the initial strategy set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Register the built-in strategies before the configured ones
    pub default_strategies: bool,
    #[serde(flatten)]
    pub settings: RecoverySettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<RecoveryStrategy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_strategies: true,
            settings: RecoverySettings::default(),
            strategies: Vec::new(),
        }
    }
}

/// Report retention, housekeeping intervals and alert rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub report_retention: TimeUnit,
    pub prune_interval: TimeUnit,
    pub sweep_interval: TimeUnit,
    pub alert_history_limit: usize,
    /// Per-request timeout for webhook notifications
    pub webhook_timeout: TimeUnit,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alert_rules: Vec<AlertRule>,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        let maintenance = MaintenanceSettings::default();
        Self {
            report_retention: maintenance.report_retention.into(),
            prune_interval: maintenance.prune_interval.into(),
            sweep_interval: maintenance.sweep_interval.into(),
            alert_history_limit: 1000,
            webhook_timeout: TimeUnit(10_000),
            alert_rules: Vec::new(),
        }
    }
}

impl MonitoringSettings {
    pub fn maintenance(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            report_retention: self.report_retention.into(),
            prune_interval: self.prune_interval.into(),
            sweep_interval: self.sweep_interval.into(),
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from file or defaults
    pub fn load(config_path: Option<&Path>) -> ResilienceResult<Self> {
        let config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                if path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    toml::from_str::<ResilienceConfig>(&content)?
                } else {
                    // YAML is the default format
                    serde_yaml::from_str::<ResilienceConfig>(&content)?
                }
            }
            None => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RESILIENCE_*` environment variables
    pub fn from_env() -> ResilienceResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides looked up by variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ResilienceResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("RESILIENCE_LOG_LEVEL") {
            self.logging.level = level;
        }
        override_value(&lookup, "RESILIENCE_MAX_RETRIES", &mut self.retry.max_retries)?;
        override_value(&lookup, "RESILIENCE_BASE_DELAY", &mut self.retry.base_delay)?;
        override_value(&lookup, "RESILIENCE_MAX_DELAY", &mut self.retry.max_delay)?;
        override_value(
            &lookup,
            "RESILIENCE_FAILURE_THRESHOLD",
            &mut self.circuit_breaker.failure_threshold,
        )?;
        override_value(
            &lookup,
            "RESILIENCE_RESET_TIMEOUT",
            &mut self.circuit_breaker.reset_timeout,
        )?;
        override_value(&lookup, "RESILIENCE_RATE_LIMIT_MAX", &mut self.rate_limit.max_requests)?;
        override_value(&lookup, "RESILIENCE_RATE_LIMIT_WINDOW", &mut self.rate_limit.window)?;
        if let Some(store) = lookup("RESILIENCE_RATE_LIMIT_STORE") {
            self.rate_limit.store = match store.trim().to_ascii_lowercase().as_str() {
                "memory" => CounterStoreKind::Memory,
                "shared" => CounterStoreKind::Shared,
                other => {
                    return Err(ResilienceError::invalid_config(format!(
                        "RESILIENCE_RATE_LIMIT_STORE must be 'memory' or 'shared', got '{}'",
                        other
                    )))
                }
            };
        }
        override_value(
            &lookup,
            "RESILIENCE_REPORT_RETENTION",
            &mut self.monitoring.report_retention,
        )?;
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> ResilienceResult<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> ResilienceResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> ResilienceResult<()> {
        self.retry.to_options().validate()?;

        self.circuit_breaker.to_config().validate()?;
        for (key, config) in self.circuit_breaker.override_configs() {
            config.validate().map_err(|e| {
                ResilienceError::invalid_config(format!("circuit breaker override '{}': {}", key, e))
            })?;
        }

        self.rate_limit.default_rule().validate()?;
        for (prefix, rule) in self.rate_limit.prefix_rules() {
            rule.validate().map_err(|e| {
                ResilienceError::invalid_config(format!("rate limit rule '{}': {}", prefix, e))
            })?;
        }
        if self.rate_limit.namespace.trim().is_empty() {
            return Err(ResilienceError::invalid_config(
                "rate limit namespace cannot be empty",
            ));
        }

        if self.recovery.settings.max_attempts == 0 {
            return Err(ResilienceError::invalid_config(
                "recovery max_attempts must be at least 1",
            ));
        }
        for strategy in &self.recovery.strategies {
            strategy.validate()?;
        }

        if self.monitoring.prune_interval.0 == 0 || self.monitoring.sweep_interval.0 == 0 {
            return Err(ResilienceError::invalid_config(
                "maintenance intervals must be greater than zero",
            ));
        }
        for rule in &self.monitoring.alert_rules {
            rule.validate()?;
        }

        Ok(())
    }
}

fn override_value<T, F>(lookup: &F, name: &str, target: &mut T) -> ResilienceResult<()>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *target = raw.trim().parse().map_err(|e: T::Err| {
            ResilienceError::invalid_config(format!("{}='{}': {}", name, raw, e))
        })?;
    }
    Ok(())
}
