//! Error types for the resilience machinery itself
//!
//! Failures of wrapped operations are modelled as [`crate::classifier::AppError`].
//! This module covers what can go wrong inside the core: bad configuration,
//! unreachable counter stores, notification delivery and bookkeeping lookups.

use thiserror::Error;

/// Main error type for resilience core operations
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Counter store error: {message}")]
    CounterStore { message: String },

    #[error("Notification delivery failed via {channel}: {message}")]
    Notification { channel: String, message: String },

    #[error("Error report not found: {id}")]
    ReportNotFound { id: String },

    #[error("Error report {id} is already resolved")]
    ReportAlreadyResolved { id: String },

    #[error("Recovery strategy not found: {id}")]
    StrategyNotFound { id: String },

    #[error("Alert rule not found: {id}")]
    AlertRuleNotFound { id: String },
}

impl ResilienceError {
    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a counter store error
    pub fn counter_store(message: impl Into<String>) -> Self {
        Self::CounterStore {
            message: message.into(),
        }
    }

    /// Create a notification error
    pub fn notification(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Notification {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for resilience core operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_resilience_error_display() {
        let err = ResilienceError::invalid_config("max_delay below base_delay");
        assert_eq!(
            format!("{}", err),
            "Invalid configuration: max_delay below base_delay"
        );

        let err = ResilienceError::counter_store("connection reset");
        assert_eq!(format!("{}", err), "Counter store error: connection reset");

        let err = ResilienceError::notification("webhook", "status 500");
        assert_eq!(
            format!("{}", err),
            "Notification delivery failed via webhook: status 500"
        );

        let err = ResilienceError::ReportNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(format!("{}", err), "Error report not found: abc");
    }

    #[test]
    fn test_resilience_error_from_io_error() {
        let io_error = Error::new(ErrorKind::NotFound, "config missing");
        let err: ResilienceError = io_error.into();

        match err {
            ResilienceError::Io(ref e) => assert_eq!(e.kind(), ErrorKind::NotFound),
            _ => panic!("Expected ResilienceError::Io"),
        }
    }

    #[test]
    fn test_resilience_error_from_yaml_error() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("key: [unclosed").unwrap_err();
        let err: ResilienceError = yaml_error.into();
        assert!(matches!(err, ResilienceError::Yaml(_)));
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = Error::new(ErrorKind::PermissionDenied, "Access denied");
        let err = ResilienceError::Io(io_error);

        let source = std::error::Error::source(&err);
        assert!(source.is_some());
        if let Some(source) = source {
            assert_eq!(source.to_string(), "Access denied");
        }
    }
}
