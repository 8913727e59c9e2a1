//! Engine error types and the retry classifier.
//!
//! Stage handlers and source clients signal failures with [`EngineError`].
//! The scheduler never inspects raw errors directly; it asks
//! [`classify_error`] for an [`ErrorInfo`] that carries the retry decision:
//! kind, severity, strategy, budget, base delay, and whether a human needs
//! to step in.
//!
//! Classification resolves in three steps:
//! 1. Typed mapping for engine-known variants (network, auth, not-found,
//!    download-limit, status-mismatch).
//! 2. Keyword match against the lowercased message.
//! 3. A default: medium severity, exponential backoff, 2 retries, 60 s base.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Cap for exponential backoff delays (1 hour).
const MAX_BACKOFF_SECS: u64 = 3600;

/// Errors raised by stage handlers, source clients, and the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure (timeout, connection, DNS, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// Authentication or authorization failure (login, 401/403).
    #[error("auth error: {0}")]
    Auth(String),

    /// The requested resource does not exist remotely.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The remote account's download allowance is used up.
    #[error("download limit exhausted: {message}")]
    DownloadLimitExhausted {
        message: String,
        /// When the remote allowance resets, if the service said.
        reset_time: Option<String>,
    },

    /// The item's committed state does not match what the stage expects.
    ///
    /// Usually read-after-commit lag; the scheduler retries these on a
    /// short fuse instead of burning the normal backoff schedule.
    #[error("status mismatch: {0}")]
    StatusMismatch(String),

    /// Domain-level processing failure with a free-form kind.
    #[error("processing error ({kind}): {message}")]
    Processing {
        kind: String,
        message: String,
        retryable: bool,
    },

    /// Store failure; always propagated, never classified as permanent
    /// item damage.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database failure surfaced directly from sqlx (e.g. transaction commit).
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl EngineError {
    /// Network error from a displayable cause.
    pub fn network(message: impl fmt::Display) -> Self {
        Self::Network(message.to_string())
    }

    /// Auth error from a displayable cause.
    pub fn auth(message: impl fmt::Display) -> Self {
        Self::Auth(message.to_string())
    }

    /// Not-found error from a displayable cause.
    pub fn not_found(message: impl fmt::Display) -> Self {
        Self::NotFound(message.to_string())
    }

    /// Generic retryable processing error.
    pub fn processing(message: impl fmt::Display) -> Self {
        Self::Processing {
            kind: "processing".to_string(),
            message: message.to_string(),
            retryable: true,
        }
    }

    /// Non-retryable data error (`data_missing` / `data_invalid`).
    pub fn data(kind: &str, message: impl fmt::Display) -> Self {
        Self::Processing {
            kind: kind.to_string(),
            message: message.to_string(),
            retryable: false,
        }
    }

    /// `true` when this error is the download-limit signal.
    #[must_use]
    pub fn is_download_limit(&self) -> bool {
        matches!(self, Self::DownloadLimitExhausted { .. })
    }

    /// `true` when this error is auth-family.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Classified error kind, stable strings used in task rows and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkTimeout,
    NetworkConnection,
    NetworkDns,
    NetworkUnknown,
    AuthLogin,
    AuthUnauthorized,
    AuthForbidden,
    ResourceNotFound,
    SystemDiskSpace,
    SystemPermission,
    DataMissing,
    DataInvalid,
    DownloadLimitExhausted,
    QuotaExhausted,
    QuotaCheckFailed,
    StatusMismatch,
    Unknown,
}

impl ErrorKind {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkConnection => "network_connection",
            Self::NetworkDns => "network_dns",
            Self::NetworkUnknown => "network_unknown",
            Self::AuthLogin => "auth_login",
            Self::AuthUnauthorized => "auth_unauthorized",
            Self::AuthForbidden => "auth_forbidden",
            Self::ResourceNotFound => "resource_not_found",
            Self::SystemDiskSpace => "system_disk_space",
            Self::SystemPermission => "system_permission",
            Self::DataMissing => "data_missing",
            Self::DataInvalid => "data_invalid",
            Self::DownloadLimitExhausted => "download_limit_exhausted",
            Self::QuotaExhausted => "quota_exhausted",
            Self::QuotaCheckFailed => "quota_check_failed",
            Self::StatusMismatch => "status_mismatch",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// How a classified error should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate,
    FixedDelay,
    ExponentialBackoff,
    NoRetry,
}

/// The retry decision for one classified error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub retry_strategy: RetryStrategy,
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub retryable: bool,
    pub needs_human_intervention: bool,
}

impl ErrorInfo {
    const fn retryable(
        kind: ErrorKind,
        severity: ErrorSeverity,
        retry_strategy: RetryStrategy,
        max_retries: u32,
        base_delay_seconds: u64,
    ) -> Self {
        Self {
            kind,
            severity,
            retry_strategy,
            max_retries,
            base_delay_seconds,
            retryable: true,
            needs_human_intervention: false,
        }
    }

    const fn permanent(kind: ErrorKind, severity: ErrorSeverity, needs_human: bool) -> Self {
        Self {
            kind,
            severity,
            retry_strategy: RetryStrategy::NoRetry,
            max_retries: 0,
            base_delay_seconds: 0,
            retryable: false,
            needs_human_intervention: needs_human,
        }
    }

    /// Computes the delay before retry number `retry_count` (0-indexed).
    ///
    /// Exponential backoff doubles per retry and is capped at one hour.
    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let secs = match self.retry_strategy {
            RetryStrategy::Immediate | RetryStrategy::NoRetry => 0,
            RetryStrategy::FixedDelay => self.base_delay_seconds,
            RetryStrategy::ExponentialBackoff => {
                let factor = 2u64.saturating_pow(retry_count.min(63));
                self.base_delay_seconds
                    .saturating_mul(factor)
                    .min(MAX_BACKOFF_SECS)
            }
        };
        Duration::from_secs(secs)
    }
}

/// Keyword patterns checked against the lowercased message, in order.
/// More specific patterns come first so e.g. `download_limit` wins over
/// a message that also mentions `connection`.
const PATTERNS: &[&str] = &[
    "download_limit",
    "quota_exhausted",
    "quota_check_failed",
    "timeout",
    "connection",
    "dns",
    "403",
    "login",
    "unauthorized",
    "404",
    "not found",
    "disk space",
    "permission",
    "data_missing",
    "data_invalid",
];

fn pattern_info(pattern: &str) -> Option<ErrorInfo> {
    use ErrorSeverity::{Critical, High, Low, Medium};
    use RetryStrategy::{ExponentialBackoff, FixedDelay};

    let info = match pattern {
        "timeout" => ErrorInfo::retryable(ErrorKind::NetworkTimeout, Low, ExponentialBackoff, 5, 30),
        "connection" => {
            ErrorInfo::retryable(ErrorKind::NetworkConnection, Medium, ExponentialBackoff, 3, 60)
        }
        "dns" => ErrorInfo::retryable(ErrorKind::NetworkDns, Medium, FixedDelay, 3, 300),
        "login" => ErrorInfo::permanent(ErrorKind::AuthLogin, High, true),
        "unauthorized" => ErrorInfo::permanent(ErrorKind::AuthUnauthorized, High, true),
        "403" => ErrorInfo {
            kind: ErrorKind::AuthForbidden,
            severity: High,
            retry_strategy: FixedDelay,
            max_retries: 2,
            base_delay_seconds: 3600,
            retryable: true,
            needs_human_intervention: true,
        },
        "404" | "not found" => ErrorInfo::permanent(ErrorKind::ResourceNotFound, Low, false),
        "disk space" => ErrorInfo::permanent(ErrorKind::SystemDiskSpace, Critical, true),
        "permission" => ErrorInfo::permanent(ErrorKind::SystemPermission, High, true),
        "data_missing" => ErrorInfo::permanent(ErrorKind::DataMissing, Medium, false),
        "data_invalid" => ErrorInfo::permanent(ErrorKind::DataInvalid, Medium, false),
        "download_limit" => ErrorInfo::permanent(ErrorKind::DownloadLimitExhausted, Medium, true),
        "quota_exhausted" => ErrorInfo::permanent(ErrorKind::QuotaExhausted, Low, false),
        "quota_check_failed" => {
            ErrorInfo::retryable(ErrorKind::QuotaCheckFailed, Medium, ExponentialBackoff, 3, 60)
        }
        _ => return None,
    };
    Some(info)
}

fn default_info() -> ErrorInfo {
    ErrorInfo::retryable(
        ErrorKind::Unknown,
        ErrorSeverity::Medium,
        RetryStrategy::ExponentialBackoff,
        2,
        60,
    )
}

fn match_message(message: &str) -> Option<ErrorInfo> {
    let lowered = message.to_lowercase();
    PATTERNS
        .iter()
        .find(|pattern| lowered.contains(*pattern))
        .and_then(|pattern| pattern_info(pattern))
}

/// Classifies an engine error into a retry decision.
///
/// Typed variants resolve first; only then is the message matched against
/// the keyword table; anything else gets the default decision.
#[must_use]
pub fn classify_error(error: &EngineError) -> ErrorInfo {
    match error {
        EngineError::DownloadLimitExhausted { .. } => {
            pattern_info("download_limit").unwrap_or_else(default_info)
        }
        EngineError::Network(message) => {
            let lowered = message.to_lowercase();
            // Most specific first: a failed quota probe usually wraps a
            // plain connection error in its message.
            for pattern in ["quota_check_failed", "timeout", "connection", "dns"] {
                if lowered.contains(pattern)
                    && let Some(info) = pattern_info(pattern)
                {
                    return info;
                }
            }
            ErrorInfo::retryable(
                ErrorKind::NetworkUnknown,
                ErrorSeverity::Medium,
                RetryStrategy::ExponentialBackoff,
                3,
                60,
            )
        }
        EngineError::Auth(message) => {
            let lowered = message.to_lowercase();
            let pattern = if lowered.contains("403") {
                "403"
            } else if lowered.contains("login") {
                "login"
            } else {
                "unauthorized"
            };
            pattern_info(pattern).unwrap_or_else(default_info)
        }
        EngineError::NotFound(_) => pattern_info("not found").unwrap_or_else(default_info),
        EngineError::StatusMismatch(_) => ErrorInfo::retryable(
            ErrorKind::StatusMismatch,
            ErrorSeverity::Low,
            RetryStrategy::Immediate,
            3,
            5,
        ),
        EngineError::Processing {
            kind,
            message,
            retryable,
        } => {
            if let Some(info) = pattern_info(kind).or_else(|| match_message(message)) {
                return info;
            }
            let mut info = default_info();
            info.retryable = *retryable;
            if !info.retryable {
                info.retry_strategy = RetryStrategy::NoRetry;
            }
            info
        }
        EngineError::Store(_) | EngineError::Io(_) | EngineError::Sqlx(_) => {
            match_message(&error.to_string()).unwrap_or_else(default_info)
        }
    }
}
