//! Error types for the download manager
//!
//! Transfer failures follow a fixed taxonomy (validation, network, auth, http,
//! hash, process, file system) so that every failure can be reported to clients
//! as a single `(kind, detail)` pair. Service-level errors (queue, store, config)
//! are kept separate and wrapped by [`AppError`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Low level cause of a network failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorCode {
    ConnectionRefused,
    HostNotFound,
    Timeout,
    Tls,
    RedirectLoop,
    RemoteClosed,
    Unknown,
}

impl NetworkErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection refused",
            Self::HostNotFound => "host not found",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::RedirectLoop => "redirect loop",
            Self::RemoteClosed => "remote host closed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// HTTP 401 from the origin server
    Server,
    /// HTTP 407 from a proxy
    Proxy,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Proxy => f.write_str("proxy"),
        }
    }
}

/// How a post-download command failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessFailure {
    FailedToStart,
    Crashed,
    NonZeroExit,
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailedToStart => f.write_str("failed to start"),
            Self::Crashed => f.write_str("crashed"),
            Self::NonZeroExit => f.write_str("non-zero exit"),
        }
    }
}

/// Client facing error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Network,
    Auth,
    Http,
    Hash,
    Process,
    FileSystem,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Http => "http",
            Self::Hash => "hash",
            Self::Process => "process",
            Self::FileSystem => "filesystem",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of a single transfer or a transfer group
///
/// Every variant converts the owning transfer to the ERROR state and is
/// reported exactly once. None of them is retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Bad URL, unknown hash algorithm or destination conflict
    #[error("Invalid transfer: {reason}")]
    Validation { reason: String },

    /// Connection, DNS, timeout, TLS or redirect failure
    #[error("Network error ({code}): {message}")]
    Network {
        code: NetworkErrorCode,
        message: String,
    },

    /// Credentials requested by the server or a proxy
    #[error("Authentication required by {kind}: {message}")]
    Auth { kind: AuthKind, message: String },

    /// Final response was not a success status
    #[error("HTTP error {status}: {reason}")]
    Http { status: u16, reason: String },

    /// Downloaded content does not match the expected digest
    #[error("Hash mismatch using {method}: expected {expected}, got {checksum}")]
    Hash {
        method: String,
        expected: String,
        checksum: String,
    },

    /// Post-download command did not complete successfully
    #[error("Post-download command {failure}: {message}")]
    Process {
        failure: ProcessFailure,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        message: String,
    },

    /// Local write, flush or rename failed
    #[error("File system error on {path}: {message}")]
    FileSystem { path: PathBuf, message: String },

    /// A child of a group failed; the group surfaces it once
    #[error("{url}: {source}")]
    Group {
        url: String,
        source: Box<TransferError>,
    },
}

impl TransferError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn network(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        Self::Network {
            code,
            message: message.into(),
        }
    }

    pub fn file_system(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            message: error.to_string(),
        }
    }

    /// Category reported as the `kind` of an error event
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Network { .. } => ErrorKind::Network,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Http { .. } => ErrorKind::Http,
            Self::Hash { .. } => ErrorKind::Hash,
            Self::Process { .. } => ErrorKind::Process,
            Self::FileSystem { .. } => ErrorKind::FileSystem,
            Self::Group { source, .. } => source.kind(),
        }
    }
}

/// Transfer queue and manager errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// No transfer is registered under the id
    #[error("Transfer not found: {id}")]
    TransferNotFound { id: String },

    /// A transfer with the same id is already queued
    #[error("Transfer already queued: {id}")]
    DuplicateTransfer { id: String },

    /// Only finished or failed transfers can be collected
    #[error("Transfer {id} cannot be collected in state {state}")]
    NotCollectable { id: String, state: String },

    /// The manager task is gone
    #[error("Download manager is not running")]
    ChannelClosed,
}

/// Metadata store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error reading or writing records
    #[error("Metadata store I/O error")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Metadata record is not valid JSON")]
    Json(#[from] serde_json::Error),

    /// Atomic persist of a record failed
    #[error("Failed to persist record {path}")]
    Persist { path: PathBuf },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// No platform configuration directory
    #[error("Could not determine user {kind} directory")]
    NoUserDirectory { kind: &'static str },
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Transfer error
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if a client retry has a chance of succeeding
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Transfer(e) => matches!(
                e.kind(),
                ErrorKind::Network | ErrorKind::Http | ErrorKind::FileSystem
            ),
            AppError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Transfer(e) => e.kind().as_str(),
            AppError::Queue(_) => "queue",
            AppError::Store(_) => "store",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Transfer result type alias
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Queue result type alias
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Store result type alias
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_error_reports_child_kind() {
        let child = TransferError::Http {
            status: 404,
            reason: "Not Found".to_string(),
        };
        let group = TransferError::Group {
            url: "http://example.com/b".to_string(),
            source: Box::new(child),
        };

        assert_eq!(group.kind(), ErrorKind::Http);
        assert_eq!(
            group.to_string(),
            "http://example.com/b: HTTP error 404: Not Found"
        );
    }

    #[test]
    fn test_hash_error_display() {
        let error = TransferError::Hash {
            method: "sha256".to_string(),
            expected: "deadbeef".to_string(),
            checksum: "cafe".to_string(),
        };
        assert_eq!(error.kind().as_str(), "hash");
        assert!(error.to_string().contains("deadbeef"));
    }

    #[test]
    fn test_app_error_category() {
        let app_error = AppError::from(TransferError::network(
            NetworkErrorCode::Timeout,
            "operation timed out",
        ));
        assert_eq!(app_error.category(), "network");
        assert!(app_error.is_recoverable());

        let validation = AppError::from(TransferError::validation("bad url"));
        assert!(!validation.is_recoverable());
        assert_eq!(
            AppError::from(QueueError::ChannelClosed).category(),
            "queue"
        );
    }
}
