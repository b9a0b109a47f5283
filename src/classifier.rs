//! Error classification and normalization
//!
//! Every failure that crosses the resilience core is turned into an [`AppError`]
//! carrying a category, a severity, a retryability flag and a user-safe message.
//! Classification is a pure function: the same failure with the same context
//! always produces the same category/severity/retryable triple.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Well-known error codes
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const EXTERNAL_API_ERROR: &str = "EXTERNAL_API_ERROR";
    pub const FILE_SYSTEM_ERROR: &str = "FILE_SYSTEM_ERROR";
    pub const BUSINESS_LOGIC_ERROR: &str = "BUSINESS_LOGIC_ERROR";
    pub const SYSTEM_ERROR: &str = "SYSTEM_ERROR";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const RECOVERY_FAILED: &str = "RECOVERY_FAILED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    /// Codes that are never retried regardless of category
    pub const NON_RETRYABLE: [&str; 4] = [VALIDATION_ERROR, UNAUTHORIZED, FORBIDDEN, NOT_FOUND];
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    Network,
    Database,
    ExternalApi,
    FileSystem,
    BusinessLogic,
    System,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::Validation,
        ErrorCategory::Authentication,
        ErrorCategory::Authorization,
        ErrorCategory::Network,
        ErrorCategory::Database,
        ErrorCategory::ExternalApi,
        ErrorCategory::FileSystem,
        ErrorCategory::BusinessLogic,
        ErrorCategory::System,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::Authorization => "AUTHORIZATION",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Database => "DATABASE",
            ErrorCategory::ExternalApi => "EXTERNAL_API",
            ErrorCategory::FileSystem => "FILE_SYSTEM",
            ErrorCategory::BusinessLogic => "BUSINESS_LOGIC",
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// Severity assigned when none is given explicitly
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Database | ErrorCategory::System => ErrorSeverity::Critical,
            ErrorCategory::Authentication | ErrorCategory::Authorization => ErrorSeverity::High,
            ErrorCategory::Network | ErrorCategory::ExternalApi => ErrorSeverity::Medium,
            ErrorCategory::Unknown => ErrorSeverity::Medium,
            ErrorCategory::Validation
            | ErrorCategory::FileSystem
            | ErrorCategory::BusinessLogic => ErrorSeverity::Low,
        }
    }

    /// Code assigned when the failure carries none
    pub fn default_code(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => codes::VALIDATION_ERROR,
            ErrorCategory::Authentication => codes::UNAUTHORIZED,
            ErrorCategory::Authorization => codes::FORBIDDEN,
            ErrorCategory::Network => codes::NETWORK_ERROR,
            ErrorCategory::Database => codes::DATABASE_ERROR,
            ErrorCategory::ExternalApi => codes::EXTERNAL_API_ERROR,
            ErrorCategory::FileSystem => codes::FILE_SYSTEM_ERROR,
            ErrorCategory::BusinessLogic => codes::BUSINESS_LOGIC_ERROR,
            ErrorCategory::System => codes::SYSTEM_ERROR,
            ErrorCategory::Unknown => codes::UNKNOWN_ERROR,
        }
    }

    /// Whether failures in this category are transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::ExternalApi
                | ErrorCategory::Database
                | ErrorCategory::System
        )
    }

    /// Message shown to end users
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "Please check the information you entered and try again.",
            ErrorCategory::Authentication => "Your session has expired. Please sign in again.",
            ErrorCategory::Authorization => "You do not have permission to perform this action.",
            ErrorCategory::Network => {
                "We are having trouble connecting. Please check your connection and try again."
            }
            ErrorCategory::Database => {
                "We could not save or load your data right now. Please try again shortly."
            }
            ErrorCategory::ExternalApi => {
                "A service we depend on is temporarily unavailable. Please try again later."
            }
            ErrorCategory::FileSystem => "There was a problem processing your file.",
            ErrorCategory::BusinessLogic => "This request could not be completed.",
            ErrorCategory::System => "Something went wrong on our side. Please try again later.",
            ErrorCategory::Unknown => "An unexpected error occurred. Please try again.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub const ALL: [ErrorSeverity; 4] = [
        ErrorSeverity::Low,
        ErrorSeverity::Medium,
        ErrorSeverity::High,
        ErrorSeverity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Situational metadata attached to an error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a field by name; unknown names fall through to the metadata map
    pub fn field(&self, name: &str) -> Option<String> {
        let scalar = match name {
            "user_id" | "userId" => self.user_id.as_ref(),
            "session_id" | "sessionId" => self.session_id.as_ref(),
            "request_id" | "requestId" => self.request_id.as_ref(),
            "ip_address" | "ipAddress" => self.ip_address.as_ref(),
            "user_agent" | "userAgent" => self.user_agent.as_ref(),
            "component" => self.component.as_ref(),
            "action" => self.action.as_ref(),
            _ => {
                return self.metadata.get(name).map(|value| match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            }
        };
        scalar.cloned()
    }

    /// Combine two contexts; fields already set on `self` win
    pub fn merge(&self, other: &ErrorContext) -> ErrorContext {
        let mut metadata = other.metadata.clone();
        metadata.extend(self.metadata.clone());

        ErrorContext {
            user_id: self.user_id.clone().or_else(|| other.user_id.clone()),
            session_id: self.session_id.clone().or_else(|| other.session_id.clone()),
            request_id: self.request_id.clone().or_else(|| other.request_id.clone()),
            ip_address: self.ip_address.clone().or_else(|| other.ip_address.clone()),
            user_agent: self.user_agent.clone().or_else(|| other.user_agent.clone()),
            component: self.component.clone().or_else(|| other.component.clone()),
            action: self.action.clone().or_else(|| other.action.clone()),
            metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ErrorContext::default()
    }
}

/// A normalized failure
///
/// Built once through [`AppError::new`] and the `with_*` methods, then shared.
/// Fields are only exposed through accessors so an error that has been
/// handed to the core cannot change underneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    code: String,
    category: ErrorCategory,
    severity: ErrorSeverity,
    retryable: bool,
    user_message: String,
    technical_message: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause_message: Option<String>,
    #[serde(skip)]
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<ErrorContext>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_millis")]
    retry_after: Option<Duration>,
}

impl AppError {
    /// Create an error with severity, retryability and user message derived
    /// from `category` and `code`
    pub fn new(
        code: impl Into<String>,
        category: ErrorCategory,
        technical_message: impl Into<String>,
    ) -> Self {
        let code = code.into();
        let retryable = derive_retryable(category, &code);

        Self {
            code,
            category,
            severity: category.default_severity(),
            retryable,
            user_message: category.user_message().to_string(),
            technical_message: technical_message.into(),
            timestamp: Utc::now(),
            cause_message: None,
            cause: None,
            context: None,
            retry_after: None,
        }
    }

    /// Create an error using the category's default code
    pub fn from_category(category: ErrorCategory, technical_message: impl Into<String>) -> Self {
        Self::new(category.default_code(), category, technical_message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::Network, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::Database, message)
    }

    pub fn external_api(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::ExternalApi, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::Authentication, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::from_category(ErrorCategory::Authorization, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, ErrorCategory::BusinessLogic, message)
    }

    /// Fast-fail error produced by an open circuit breaker
    pub fn circuit_breaker_open(key: &str) -> Self {
        Self::new(
            codes::CIRCUIT_BREAKER_OPEN,
            ErrorCategory::System,
            format!("Circuit breaker for '{}' is open", key),
        )
        .with_severity(ErrorSeverity::High)
        .with_user_message("This service is temporarily unavailable. Please try again shortly.")
    }

    /// Denial produced by the rate limiter
    pub fn rate_limited(key: &str, retry_after: Duration) -> Self {
        Self::new(
            codes::RATE_LIMITED,
            ErrorCategory::System,
            format!(
                "Rate limit exceeded for '{}', retry after {}s",
                key,
                retry_after.as_secs()
            ),
        )
        .with_severity(ErrorSeverity::Medium)
        .with_user_message("Too many requests. Please wait a moment and try again.")
        .with_retry_after(retry_after)
    }

    /// Attempt exceeded its time budget
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            codes::TIMEOUT,
            ErrorCategory::Network,
            format!("Operation timed out after {}ms", after.as_millis()),
        )
    }

    /// Operation aborted by its cancellation token
    pub fn cancelled() -> Self {
        Self::new(
            codes::CANCELLED,
            ErrorCategory::System,
            "Operation was cancelled",
        )
        .with_severity(ErrorSeverity::Low)
        .with_retryable(false)
        .with_user_message("The request was cancelled.")
    }

    /// Failure inside the resilience machinery itself
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, ErrorCategory::System, message)
            .with_severity(ErrorSeverity::Critical)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(match self.context.take() {
            Some(existing) => existing.merge(&context),
            None => context,
        });
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause_message = Some(cause.to_string());
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn technical_message(&self) -> &str {
        &self.technical_message
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn cause_message(&self) -> Option<&str> {
        self.cause_message.as_deref()
    }

    /// Key identifying "the same error" for attempt tracking and cooldowns
    pub fn fingerprint(&self) -> String {
        let context = self.context.as_ref();
        let scope = context
            .and_then(|ctx| ctx.user_id.as_deref().or(ctx.session_id.as_deref()))
            .unwrap_or("anonymous");
        let component = context
            .and_then(|ctx| ctx.component.as_deref())
            .unwrap_or("-");
        format!("{}:{}:{}", self.code, component, scope)
    }

    /// Convert error to a flat map for structured logging
    pub fn to_log_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("code".to_string(), self.code.clone());
        fields.insert("category".to_string(), self.category.to_string());
        fields.insert("severity".to_string(), self.severity.to_string());
        fields.insert("retryable".to_string(), self.retryable.to_string());
        fields.insert("message".to_string(), self.technical_message.clone());
        fields.insert("timestamp".to_string(), self.timestamp.to_rfc3339());

        if let Some(cause) = &self.cause_message {
            fields.insert("cause".to_string(), cause.clone());
        }
        if let Some(retry_after) = self.retry_after {
            fields.insert("retry_after_ms".to_string(), retry_after.as_millis().to_string());
        }
        if let Some(ctx) = &self.context {
            for name in ["user_id", "session_id", "request_id", "component", "action"] {
                if let Some(value) = ctx.field(name) {
                    fields.insert(name.to_string(), value);
                }
            }
        }

        fields
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.technical_message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for AppError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.category == other.category
            && self.severity == other.severity
            && self.retryable == other.retryable
            && self.technical_message == other.technical_message
    }
}

fn derive_retryable(category: ErrorCategory, code: &str) -> bool {
    category.is_transient() && !codes::NON_RETRYABLE.contains(&code)
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

// =============================================================================
// CLASSIFIER
// =============================================================================

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "timedout",
    "connection",
    "connect",
    "econnrefused",
    "econnreset",
    "enotfound",
    "socket",
    "dns",
    "unreachable",
    "broken pipe",
    "brokenpipe",
    "fetch failed",
];

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "timedout"];

const VALIDATION_KEYWORDS: &[&str] = &[
    "validation",
    "invalid",
    "required",
    "must be",
    "malformed",
    "missing field",
    "out of range",
];

const AUTHENTICATION_KEYWORDS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "not authenticated",
    "token expired",
    "session expired",
    "login",
    "credentials",
];

const AUTHORIZATION_KEYWORDS: &[&str] = &[
    "forbidden",
    "permission denied",
    "access denied",
    "not permitted",
    "insufficient privileges",
];

const DATABASE_KEYWORDS: &[&str] = &[
    "database",
    "sql",
    "query",
    "deadlock",
    "constraint",
    "duplicate key",
    "transaction",
    "postgres",
    "postgresql",
    "sqlite",
];

const FILE_SYSTEM_KEYWORDS: &[&str] = &[
    "no such file",
    "enoent",
    "eacces",
    "file",
    "directory",
    "disk",
    "upload",
];

const EXTERNAL_API_KEYWORDS: &[&str] = &[
    "api",
    "upstream",
    "bad gateway",
    "service unavailable",
    "status code",
    "http",
    "https",
    "too many requests",
];

const BUSINESS_LOGIC_KEYWORDS: &[&str] = &[
    "not found",
    "business",
    "rule",
    "conflict",
    "already exists",
    "insufficient",
    "not allowed",
];

const SYSTEM_KEYWORDS: &[&str] = &[
    "panic",
    "out of memory",
    "internal",
    "overflow",
    "system",
    "resource exhausted",
];

/// Keyword set compiled into one word-bounded pattern
struct KeywordSet {
    keywords: &'static [&'static str],
    pattern: Option<Regex>,
}

impl KeywordSet {
    fn new(keywords: &'static [&'static str]) -> Self {
        let alternation = keywords
            .iter()
            .map(|kw| regex::escape(kw))
            .collect::<Vec<_>>()
            .join("|");
        // Plural forms count as the keyword ("files", "uploads")
        let pattern = Regex::new(&format!(r"\b(?:{})(?:s|es)?\b", alternation)).ok();
        Self { keywords, pattern }
    }

    fn matches(&self, text: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(text),
            None => self.keywords.iter().any(|kw| text.contains(kw)),
        }
    }
}

struct KeywordTable {
    network: KeywordSet,
    timeout: KeywordSet,
    validation: KeywordSet,
    authentication: KeywordSet,
    authorization: KeywordSet,
    database: KeywordSet,
    file_system: KeywordSet,
    external_api: KeywordSet,
    business_logic: KeywordSet,
    not_found: KeywordSet,
    system: KeywordSet,
}

fn keyword_table() -> &'static KeywordTable {
    static TABLE: OnceLock<KeywordTable> = OnceLock::new();
    TABLE.get_or_init(|| KeywordTable {
        network: KeywordSet::new(NETWORK_KEYWORDS),
        timeout: KeywordSet::new(TIMEOUT_KEYWORDS),
        validation: KeywordSet::new(VALIDATION_KEYWORDS),
        authentication: KeywordSet::new(AUTHENTICATION_KEYWORDS),
        authorization: KeywordSet::new(AUTHORIZATION_KEYWORDS),
        database: KeywordSet::new(DATABASE_KEYWORDS),
        file_system: KeywordSet::new(FILE_SYSTEM_KEYWORDS),
        external_api: KeywordSet::new(EXTERNAL_API_KEYWORDS),
        business_logic: KeywordSet::new(BUSINESS_LOGIC_KEYWORDS),
        not_found: KeywordSet::new(&["not found"]),
        system: KeywordSet::new(SYSTEM_KEYWORDS),
    })
}

/// Keyword-driven failure classifier
///
/// Normalized errors are stamped from the classifier's [`Clock`].
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    clock: Arc<dyn Clock>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Normalize any failure into an [`AppError`]
    ///
    /// An `AppError` anywhere in the source chain is passed through with the
    /// given context merged in. Never fails.
    pub fn normalize(
        &self,
        failure: &(dyn std::error::Error + 'static),
        context: Option<&ErrorContext>,
    ) -> AppError {
        if let Some(existing) = find_app_error(failure) {
            let error = existing.clone();
            return match context {
                Some(ctx) if !ctx.is_empty() => error.with_context(ctx.clone()),
                _ => error,
            };
        }

        let message = failure.to_string();
        let (category, code) = match failure.downcast_ref::<std::io::Error>() {
            Some(io_error) => {
                classify_io_kind(io_error.kind()).unwrap_or_else(|| self.classify(&message))
            }
            None => self.classify(&message),
        };

        let mut error = AppError::new(code, category, message).with_timestamp(self.clock.now());
        error.cause_message = failure.source().map(|source| source.to_string());
        match context {
            Some(ctx) if !ctx.is_empty() => error.with_context(ctx.clone()),
            _ => error,
        }
    }

    /// Normalize a bare message, e.g. a failure reported across a process boundary
    pub fn normalize_message(&self, message: &str, context: Option<&ErrorContext>) -> AppError {
        let (category, code) = self.classify(message);
        let error = AppError::new(code, category, message).with_timestamp(self.clock.now());
        match context {
            Some(ctx) if !ctx.is_empty() => error.with_context(ctx.clone()),
            _ => error,
        }
    }

    /// Assign a category and code from a failure message
    ///
    /// Keywords match whole words only, so "profile" is not a file error.
    pub fn classify(&self, message: &str) -> (ErrorCategory, &'static str) {
        let text = message.to_lowercase();
        let table = keyword_table();

        if table.network.matches(&text) {
            let code = if table.timeout.matches(&text) {
                codes::TIMEOUT
            } else {
                codes::NETWORK_ERROR
            };
            (ErrorCategory::Network, code)
        } else if table.validation.matches(&text) {
            (ErrorCategory::Validation, codes::VALIDATION_ERROR)
        } else if table.authorization.matches(&text) {
            (ErrorCategory::Authorization, codes::FORBIDDEN)
        } else if table.authentication.matches(&text) {
            (ErrorCategory::Authentication, codes::UNAUTHORIZED)
        } else if table.database.matches(&text) {
            (ErrorCategory::Database, codes::DATABASE_ERROR)
        } else if table.file_system.matches(&text) {
            (ErrorCategory::FileSystem, codes::FILE_SYSTEM_ERROR)
        } else if table.external_api.matches(&text) {
            (ErrorCategory::ExternalApi, codes::EXTERNAL_API_ERROR)
        } else if table.business_logic.matches(&text) {
            let code = if table.not_found.matches(&text) {
                codes::NOT_FOUND
            } else {
                codes::BUSINESS_LOGIC_ERROR
            };
            (ErrorCategory::BusinessLogic, code)
        } else if table.system.matches(&text) {
            (ErrorCategory::System, codes::SYSTEM_ERROR)
        } else {
            (ErrorCategory::Unknown, codes::UNKNOWN_ERROR)
        }
    }
}

/// Normalize with the default classifier
pub fn normalize(
    failure: &(dyn std::error::Error + 'static),
    context: Option<&ErrorContext>,
) -> AppError {
    ErrorClassifier::new().normalize(failure, context)
}

fn find_app_error<'a>(failure: &'a (dyn std::error::Error + 'static)) -> Option<&'a AppError> {
    let mut current: Option<&'a (dyn std::error::Error + 'static)> = Some(failure);
    while let Some(err) = current {
        if let Some(app_error) = err.downcast_ref::<AppError>() {
            return Some(app_error);
        }
        current = err.source();
    }
    None
}

fn classify_io_kind(kind: std::io::ErrorKind) -> Option<(ErrorCategory, &'static str)> {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => Some((ErrorCategory::Network, codes::TIMEOUT)),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => Some((ErrorCategory::Network, codes::NETWORK_ERROR)),
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::AlreadyExists => {
            Some((ErrorCategory::FileSystem, codes::FILE_SYSTEM_ERROR))
        }
        ErrorKind::InvalidInput | ErrorKind::InvalidData => {
            Some((ErrorCategory::Validation, codes::VALIDATION_ERROR))
        }
        ErrorKind::OutOfMemory => Some((ErrorCategory::System, codes::SYSTEM_ERROR)),
        _ => None,
    }
}
