//! Error types for Syndicast

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicastError>;

/// Result type returned by platform adapters
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SyndicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::Config(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

#[derive(Error, Debug, Clone)]
pub enum NotificationError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),

    #[error("notification channel unavailable: {0}")]
    ChannelUnavailable(String),
}

/// Classification of a delivery failure
///
/// Drives the retry decision in the dispatch engine. Adapters never return
/// `MaxRetriesExceeded`; the engine assigns it once the backoff schedule is
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimit,
    TransientNetwork,
    PlatformUnavailable,
    Rejected,
    MaxRetriesExceeded,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::TransientNetwork | ErrorKind::PlatformUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::PlatformUnavailable => "platform_unavailable",
            ErrorKind::Rejected => "rejected",
            ErrorKind::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned by platform adapters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Unsupported platform: {0}")]
    Unsupported(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Credentials expired: {0}")]
    CredentialsExpired(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Platform unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected by platform: {0}")]
    Rejected(String),
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::Unsupported(_) | PlatformError::Validation(_) => ErrorKind::Validation,
            PlatformError::Authentication(_) | PlatformError::CredentialsExpired(_) => {
                ErrorKind::Auth
            }
            PlatformError::RateLimit { .. } => ErrorKind::RateLimit,
            PlatformError::Network(_) | PlatformError::Timeout(_) => ErrorKind::TransientNetwork,
            PlatformError::Unavailable(_) => ErrorKind::PlatformUnavailable,
            PlatformError::Rejected(_) => ErrorKind::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Delay requested by the platform before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_config_error() {
        let error = SyndicastError::Config(ConfigError::MissingField("database.path".into()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_runtime_errors() {
        assert_eq!(SyndicastError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(
            SyndicastError::Platform(PlatformError::Network("down".into())).exit_code(),
            1
        );
        assert_eq!(SyndicastError::NotFound("task".into()).exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = SyndicastError::Platform(PlatformError::Authentication("bad token".into()));
        assert_eq!(
            error.to_string(),
            "Platform error: Authentication failed: bad token"
        );

        let timeout = PlatformError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout.to_string(), "Request timed out after 30s");

        let config = ConfigError::InvalidValue {
            field: "engine.backoff_schedule".into(),
            reason: "must not be empty".into(),
        };
        assert_eq!(
            config.to_string(),
            "Invalid value for engine.backoff_schedule: must not be empty"
        );
    }

    #[test]
    fn test_platform_error_kinds() {
        assert_eq!(PlatformError::Unsupported("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(PlatformError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(PlatformError::Authentication("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(PlatformError::CredentialsExpired("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(
            PlatformError::RateLimit {
                message: "x".into(),
                retry_after: None
            }
            .kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(PlatformError::Network("x".into()).kind(), ErrorKind::TransientNetwork);
        assert_eq!(
            PlatformError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            PlatformError::Unavailable("x".into()).kind(),
            ErrorKind::PlatformUnavailable
        );
        assert_eq!(PlatformError::Rejected("x".into()).kind(), ErrorKind::Rejected);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PlatformError::Network("reset".into()).is_retryable());
        assert!(PlatformError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(PlatformError::Unavailable("circuit open".into()).is_retryable());
        assert!(!PlatformError::Authentication("nope".into()).is_retryable());
        assert!(!PlatformError::Validation("too long".into()).is_retryable());
        assert!(!PlatformError::Rejected("duplicate".into()).is_retryable());
        assert!(!ErrorKind::MaxRetriesExceeded.is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let limited = PlatformError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(120)));
        assert_eq!(PlatformError::Network("x".into()).retry_after(), None);
    }

    #[test]
    fn test_error_conversion_from_platform_error() {
        let error: SyndicastError = PlatformError::Rejected("dup".into()).into();
        match error {
            SyndicastError::Platform(PlatformError::Rejected(msg)) => assert_eq!(msg, "dup"),
            _ => panic!("Expected SyndicastError::Platform"),
        }
    }

    #[test]
    fn test_error_conversion_from_db_error() {
        let db_error = DbError::IoError(std::io::Error::new(std::io::ErrorKind::NotFound, "test"));
        let error: SyndicastError = db_error.into();
        assert!(matches!(error, SyndicastError::Database(_)));
    }

    #[test]
    fn test_platform_error_clone() {
        // Retry bookkeeping keeps a copy of the last failure
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }
}
