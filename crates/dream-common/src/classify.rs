//! Error classification engine
//!
//! Maps raw errors plus call context onto the gateway error taxonomy and
//! produces a recovery plan per class. Classification is deterministic:
//! the same error and context always yield the same classification.

use crate::backoff;
use crate::error::Error;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Keys removed from context before logging or persistence
const SENSITIVE_KEYS: &[&str] = &["apikey", "api_key", "x-api-key", "credentials", "authorization"];

/// Response payloads longer than this are truncated in the sanitized context
const MAX_RESPONSE_DATA_BYTES: usize = 1024;

const TRUNCATION_SENTINEL: &str = "…[truncated]";

/// Identical classifications within this window are logged once
const LOG_COALESCE_WINDOW: Duration = Duration::from_secs(5);

static PARSING_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)substring is not a function|Cannot read propert(y|ies) of (undefined|null)|Unexpected token|in JSON|expected value|EOF while parsing",
    )
    .expect("parsing pattern regex")
});

static NETWORK_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ECONNREFUSED|ENOTFOUND|ECONNRESET|ETIMEDOUT|network|connection failed")
        .expect("network pattern regex")
});

/// Closed error taxonomy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ResponseParsing,
    ProviderMethod,
    Network,
    Timeout,
    RateLimit,
    Authentication,
    ProviderError,
    Configuration,
    Validation,
    Unknown,
}

impl ErrorType {
    /// Types that never drive retries regardless of context
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorType::Configuration
                | ErrorType::Authentication
                | ErrorType::Validation
                | ErrorType::ProviderMethod
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ResponseParsing => "response_parsing",
            ErrorType::ProviderMethod => "provider_method",
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Authentication => "authentication",
            ErrorType::ProviderError => "provider_error",
            ErrorType::Configuration => "configuration",
            ErrorType::Validation => "validation",
            ErrorType::Unknown => "unknown",
        }
    }
}

/// Classified severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Recovery plan priority: critical=1, high=2, medium=3, low=4
    pub fn priority(&self) -> u8 {
        match self {
            Severity::Critical => 1,
            Severity::High => 2,
            Severity::Medium => 3,
            Severity::Low => 4,
        }
    }
}

/// A single step of a recovery plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAction {
    pub kind: RecoveryKind,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    EnhanceParsing,
    SwitchProvider,
    ImplementMethod,
    ExponentialBackoffRetry,
    RateLimitBackoff,
    RefreshCredentials,
    RetryWithBackoff,
    ValidateConfig,
    RejectInput,
}

/// Recovery plan attached to a classified error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStrategy {
    pub actions: Vec<RecoveryAction>,
    pub priority: u8,
    pub fallback_options: Vec<String>,
}

/// Call context fed to the classifier
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub provider: String,
    pub operation: String,
    pub attempt_number: u32,
    pub consecutive_failures: u32,
    pub response_time_ms: Option<u64>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_data: Option<String>,
    pub all_providers_failed: bool,
}

impl ClassifyContext {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Strip secret-bearing keys and truncate oversized payloads.
    ///
    /// Logs are emitted only from the sanitized form, so secrets cannot
    /// reach log output by construction.
    pub fn sanitized(&self) -> SanitizedContext {
        let headers = self.response_headers.as_ref().map(|headers| {
            headers
                .iter()
                .filter(|(k, _)| !SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        });

        let response_data = self.response_data.as_ref().map(|data| {
            if data.len() > MAX_RESPONSE_DATA_BYTES {
                let mut cut = MAX_RESPONSE_DATA_BYTES;
                while !data.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}{}", &data[..cut], TRUNCATION_SENTINEL)
            } else {
                data.clone()
            }
        });

        SanitizedContext {
            provider: self.provider.clone(),
            operation: self.operation.clone(),
            attempt_number: self.attempt_number,
            consecutive_failures: self.consecutive_failures,
            response_time_ms: self.response_time_ms,
            response_headers: headers,
            response_data,
            all_providers_failed: self.all_providers_failed,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.response_headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }
}

/// Context with secrets removed, safe to log and persist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedContext {
    pub provider: String,
    pub operation: String,
    pub attempt_number: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<String>,
    pub all_providers_failed: bool,
}

/// A fully classified error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub severity: Severity,
    pub retryable: bool,
    pub recoverable: bool,
    pub recovery_strategy: RecoveryStrategy,
    pub message: String,
    pub context: SanitizedContext,
}

impl ClassifiedError {
    /// Delay before the next retry of this error, per the plan's first
    /// actionable step. Parsing retries and provider switches are
    /// immediate; backoff-bearing actions carry their base delay.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        for action in &self.recovery_strategy.actions {
            match action.kind {
                RecoveryKind::RateLimitBackoff => {
                    return Duration::from_millis(action.timeout_ms);
                }
                RecoveryKind::ExponentialBackoffRetry | RecoveryKind::RetryWithBackoff => {
                    return backoff::exponential_delay_with(
                        attempt,
                        Duration::from_millis(action.timeout_ms),
                        backoff::MAX_DELAY,
                    );
                }
                RecoveryKind::EnhanceParsing | RecoveryKind::SwitchProvider => {
                    return Duration::ZERO;
                }
                _ => continue,
            }
        }
        backoff::exponential_delay(attempt)
    }
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub max_retry_attempts: u32,
    pub critical_failure_threshold: u32,
    pub slow_response_threshold_ms: u64,
    /// Base delay planted in backoff-bearing recovery actions
    pub backoff_base_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            critical_failure_threshold: 5,
            slow_response_threshold_ms: 10_000,
            backoff_base_ms: backoff::BASE_DELAY.as_millis() as u64,
        }
    }
}

/// Deterministic error classifier
pub struct ErrorClassifier {
    config: ClassifierConfig,
    recent_logs: Mutex<HashMap<(ErrorType, String), Instant>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            recent_logs: Mutex::new(HashMap::new()),
        }
    }

    /// Classify a raw error against the taxonomy. First matching rule wins.
    pub fn classify(&self, error: &Error, context: &ClassifyContext) -> ClassifiedError {
        let message = error.to_string();
        let error_type = self.classify_type(error, &message);
        let mut severity = self.base_severity(error_type, context);

        // Escalations applied after base severity, strongest first
        if context.consecutive_failures >= self.config.critical_failure_threshold
            || context.all_providers_failed
        {
            severity = severity.max(Severity::Critical);
        } else if context.consecutive_failures >= 3 {
            severity = severity.max(Severity::High);
        }

        let mut retryable = self.base_retryable(error_type);
        if context.attempt_number > self.config.max_retry_attempts || error_type.is_terminal() {
            retryable = false;
        }

        let recoverable = error_type != ErrorType::ProviderMethod;
        let recovery_strategy = self.strategy_for(error_type, severity, context);

        let classified = ClassifiedError {
            error_type,
            severity,
            retryable,
            recoverable,
            recovery_strategy,
            message,
            context: context.sanitized(),
        };

        self.log_classification(&classified);
        classified
    }

    fn classify_type(&self, error: &Error, message: &str) -> ErrorType {
        // Rule order mirrors the recovery policy: parsing problems first,
        // terminal defects before transient transport failures.
        match error {
            Error::ResponseParsing(_) | Error::Serialization(_) => ErrorType::ResponseParsing,
            Error::ProviderMethod(_) => ErrorType::ProviderMethod,
            Error::Network(_) => ErrorType::Network,
            Error::Timeout(_) => ErrorType::Timeout,
            Error::RateLimit { .. } => ErrorType::RateLimit,
            Error::Authentication(_) => ErrorType::Authentication,
            Error::Provider { status, .. } => match status {
                429 => ErrorType::RateLimit,
                401 | 403 => ErrorType::Authentication,
                400 => ErrorType::Validation,
                s if *s >= 500 => ErrorType::ProviderError,
                _ => ErrorType::ProviderError,
            },
            Error::CircuitOpen(_) => ErrorType::ProviderError,
            Error::Configuration(_) => ErrorType::Configuration,
            Error::Validation(_) => ErrorType::Validation,
            Error::Generic(_) | Error::Unknown(_) => self.sniff_message(message),
        }
    }

    /// Message-pattern rules for errors that arrive without a typed variant
    fn sniff_message(&self, message: &str) -> ErrorType {
        if PARSING_PATTERNS.is_match(message) {
            return ErrorType::ResponseParsing;
        }
        if message.contains("is not a function") {
            return ErrorType::ProviderMethod;
        }
        if NETWORK_PATTERNS.is_match(message) {
            return ErrorType::Network;
        }
        let lower = message.to_ascii_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorType::Timeout;
        }
        if lower.contains("rate limit") || lower.contains("quota exceeded") {
            return ErrorType::RateLimit;
        }
        if lower.contains("unauthorized") || lower.contains("invalid api key") {
            return ErrorType::Authentication;
        }
        if (lower.contains("missing") || lower.contains("invalid"))
            && (lower.contains("config") || lower.contains("api key"))
        {
            return ErrorType::Configuration;
        }
        ErrorType::Unknown
    }

    fn base_severity(&self, error_type: ErrorType, context: &ClassifyContext) -> Severity {
        match error_type {
            ErrorType::ResponseParsing => Severity::High,
            ErrorType::ProviderMethod => Severity::Critical,
            ErrorType::Network => Severity::Medium,
            ErrorType::Timeout => Severity::Medium,
            ErrorType::RateLimit => Severity::Medium,
            ErrorType::Authentication => Severity::High,
            ErrorType::ProviderError => {
                let slow = context
                    .response_time_ms
                    .map(|t| t > self.config.slow_response_threshold_ms)
                    .unwrap_or(false);
                if slow {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            ErrorType::Configuration => Severity::Critical,
            ErrorType::Validation => Severity::Low,
            ErrorType::Unknown => Severity::Low,
        }
    }

    fn base_retryable(&self, error_type: ErrorType) -> bool {
        match error_type {
            ErrorType::ResponseParsing
            | ErrorType::Network
            | ErrorType::Timeout
            | ErrorType::RateLimit
            | ErrorType::ProviderError
            | ErrorType::Unknown => true,
            ErrorType::ProviderMethod
            | ErrorType::Authentication
            | ErrorType::Configuration
            | ErrorType::Validation => false,
        }
    }

    fn strategy_for(
        &self,
        error_type: ErrorType,
        severity: Severity,
        context: &ClassifyContext,
    ) -> RecoveryStrategy {
        let actions = match error_type {
            ErrorType::ResponseParsing => vec![
                RecoveryAction {
                    kind: RecoveryKind::EnhanceParsing,
                    timeout_ms: 0,
                    max_attempts: Some(1),
                },
                RecoveryAction {
                    kind: RecoveryKind::SwitchProvider,
                    timeout_ms: 0,
                    max_attempts: None,
                },
            ],
            ErrorType::ProviderMethod => vec![RecoveryAction {
                kind: RecoveryKind::ImplementMethod,
                timeout_ms: 0,
                max_attempts: None,
            }],
            ErrorType::Network => vec![RecoveryAction {
                kind: RecoveryKind::ExponentialBackoffRetry,
                timeout_ms: self.config.backoff_base_ms,
                max_attempts: Some(self.config.max_retry_attempts),
            }],
            ErrorType::Timeout => vec![RecoveryAction {
                kind: RecoveryKind::RetryWithBackoff,
                timeout_ms: self.config.backoff_base_ms,
                max_attempts: Some(self.config.max_retry_attempts),
            }],
            ErrorType::RateLimit => vec![RecoveryAction {
                kind: RecoveryKind::RateLimitBackoff,
                timeout_ms: rate_limit_wait_ms(context),
                max_attempts: Some(1),
            }],
            ErrorType::Authentication => vec![RecoveryAction {
                kind: RecoveryKind::RefreshCredentials,
                timeout_ms: 0,
                max_attempts: None,
            }],
            ErrorType::ProviderError => vec![
                RecoveryAction {
                    kind: RecoveryKind::SwitchProvider,
                    timeout_ms: 0,
                    max_attempts: None,
                },
                RecoveryAction {
                    kind: RecoveryKind::RetryWithBackoff,
                    timeout_ms: self.config.backoff_base_ms,
                    max_attempts: Some(self.config.max_retry_attempts),
                },
            ],
            ErrorType::Configuration => vec![RecoveryAction {
                kind: RecoveryKind::ValidateConfig,
                timeout_ms: 0,
                max_attempts: None,
            }],
            ErrorType::Validation => vec![RecoveryAction {
                kind: RecoveryKind::RejectInput,
                timeout_ms: 0,
                max_attempts: None,
            }],
            ErrorType::Unknown => vec![RecoveryAction {
                kind: RecoveryKind::RetryWithBackoff,
                timeout_ms: self.config.backoff_base_ms,
                max_attempts: Some(1),
            }],
        };

        let fallback_options = if error_type.is_terminal() {
            Vec::new()
        } else {
            vec!["local_fallback".to_string(), "safe_fallback".to_string()]
        };

        RecoveryStrategy {
            actions,
            priority: severity.priority(),
            fallback_options,
        }
    }

    /// Log once per classification; identical classifications inside the
    /// coalescing window are suppressed.
    fn log_classification(&self, classified: &ClassifiedError) {
        let key = (classified.error_type, classified.context.provider.clone());
        let now = Instant::now();
        {
            let mut recent = self.recent_logs.lock();
            if let Some(last) = recent.get(&key) {
                if now.duration_since(*last) < LOG_COALESCE_WINDOW {
                    return;
                }
            }
            recent.insert(key, now);
            recent.retain(|_, t| now.duration_since(*t) < LOG_COALESCE_WINDOW * 4);
        }

        let kind = classified.error_type.as_str();
        let provider = classified.context.provider.as_str();
        match classified.severity {
            Severity::Critical | Severity::High => {
                error!(kind, provider, retryable = classified.retryable, "{}", classified.message)
            }
            Severity::Medium => {
                warn!(kind, provider, retryable = classified.retryable, "{}", classified.message)
            }
            Severity::Low => {
                info!(kind, provider, retryable = classified.retryable, "{}", classified.message)
            }
        }
    }
}

/// Wait time for a rate-limited provider, from Retry-After or
/// X-RateLimit-Reset in seconds, else 60s.
fn rate_limit_wait_ms(context: &ClassifyContext) -> u64 {
    let from_header = context
        .header("Retry-After")
        .or_else(|| context.header("X-RateLimit-Reset"))
        .and_then(|v| v.trim().parse::<u64>().ok());
    from_header.map(|secs| secs * 1000).unwrap_or(60_000)
}
