//! Error types for Slotline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SlotlineError>;

#[derive(Error, Debug)]
pub enum SlotlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Item `posted` (0-based) failed after `posted` items were already
    /// published; the platform now holds a truncated thread.
    #[error("Thread truncated after {posted} of {total} items: {source}")]
    PartialThread {
        posted: usize,
        total: usize,
        #[source]
        source: Box<SlotlineError>,
    },
}

/// Failure classes recorded against a publish job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed job, missing post, items or media
    Input,
    /// No account, refresh failure
    Credential,
    /// Non-2xx platform responses, processing timeouts, storage hiccups
    Transient,
    /// Earlier items were posted before a later one failed
    PartialThread,
}

impl SlotlineError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SlotlineError::InvalidInput(_) => 3,
            SlotlineError::Credential(_) => 2,
            SlotlineError::Platform(PlatformError::Authentication(_)) => 2,
            SlotlineError::Platform(_) => 1,
            SlotlineError::Config(_) => 1,
            SlotlineError::Database(_) => 1,
            SlotlineError::Storage(_) => 1,
            SlotlineError::PartialThread { .. } => 1,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SlotlineError::InvalidInput(_) | SlotlineError::Config(_) => ErrorCategory::Input,
            SlotlineError::Credential(_) => ErrorCategory::Credential,
            SlotlineError::Platform(PlatformError::Authentication(_)) => ErrorCategory::Credential,
            SlotlineError::PartialThread { .. } => ErrorCategory::PartialThread,
            SlotlineError::Platform(_) | SlotlineError::Storage(_) | SlotlineError::Database(_) => {
                ErrorCategory::Transient
            }
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
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Media processing failed: {0}")]
    Processing(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        PlatformError::Network(e.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    #[error("No {0} account connected")]
    NotConnected(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Failed to sign download URL for {path}: {reason}")]
    Sign { path: String, reason: String },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = SlotlineError::InvalidInput("Empty thread".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_credential_errors() {
        let error = SlotlineError::Credential(CredentialError::NotConnected("x".to_string()));
        assert_eq!(error.exit_code(), 2);

        let error = SlotlineError::Platform(PlatformError::Authentication("401".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_platform_error() {
        let error = SlotlineError::Platform(PlatformError::Upload("APPEND failed".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_upload() {
        let error: SlotlineError =
            PlatformError::Upload("APPEND failed at segment 1 - status 503".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Platform error: Upload failed: APPEND failed at segment 1 - status 503"
        );
    }

    #[test]
    fn test_error_message_formatting_not_connected() {
        let error: SlotlineError = CredentialError::NotConnected("x".to_string()).into();
        assert_eq!(error.to_string(), "Credential error: No x account connected");
    }

    #[test]
    fn test_partial_thread_message_keeps_cause() {
        let cause: SlotlineError = PlatformError::Posting("status 500".to_string()).into();
        let error = SlotlineError::PartialThread {
            posted: 2,
            total: 5,
            source: Box::new(cause),
        };
        let message = error.to_string();
        assert!(message.starts_with("Thread truncated after 2 of 5 items"));
        assert!(message.contains("status 500"));
        assert_eq!(error.category(), ErrorCategory::PartialThread);
    }

    #[test]
    fn test_categories_follow_taxonomy() {
        assert_eq!(
            SlotlineError::InvalidInput("no items".into()).category(),
            ErrorCategory::Input
        );
        assert_eq!(
            SlotlineError::from(CredentialError::RefreshFailed("400".into())).category(),
            ErrorCategory::Credential
        );
        assert_eq!(
            SlotlineError::from(PlatformError::Processing("timed out".into())).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            SlotlineError::from(StorageError::Download("reset".into())).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_storage_size_mismatch_formatting() {
        let error = StorageError::SizeMismatch {
            path: "u/1/a.png".to_string(),
            expected: 10,
            actual: 7,
        };
        assert_eq!(
            error.to_string(),
            "Size mismatch for u/1/a.png: expected 10 bytes, got 7"
        );
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();

        assert_eq!(format!("{}", original), format!("{}", cloned));
    }
}
