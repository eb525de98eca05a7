//! Application constants for the download manager
//!
//! This module centralizes all constants used throughout the application,
//! organized by functional domain.

use std::time::Duration;

/// HTTP client configuration constants
pub mod http {
    use super::Duration;

    /// Default user agent for all HTTP requests
    pub const USER_AGENT: &str = concat!("download-manager/", env!("CARGO_PKG_VERSION"));

    /// Connection establishment timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// TCP keep-alive interval
    pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

    /// Connection pool idle timeout
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

    /// Maximum number of redirects to follow
    pub const MAX_REDIRECTS: usize = 10;

    /// Only content encoding the engine accepts; checksums cover raw bytes
    pub const IDENTITY_ENCODING: &str = "identity";
}

/// Metadata keys understood by the engine
pub mod metadata {
    /// Command run after a verified download, as a JSON array
    pub const COMMAND: &str = "post-download-command";

    /// Explicit destination for unconfined callers
    pub const LOCAL_PATH: &str = "local-path";

    /// Human readable title
    pub const TITLE: &str = "title";

    /// Whether the transfer should appear in a system indicator
    pub const INDICATOR_SHOWN: &str = "indicator-shown";

    /// Package name for click installs, dropped for confined callers
    pub const CLICK_PACKAGE: &str = "click-package";

    /// Placeholder replaced with the final file path in commands
    pub const FILE_PLACEHOLDER: &str = "$file";
}

/// File naming constants
pub mod files {
    /// Suffix of the partial data file while a transfer is in progress
    pub const TEMP_FILE_SUFFIX: &str = ".tmp";

    /// Extension of persisted metadata records
    pub const RECORD_EXTENSION: &str = "json";

    /// Application directory name under the platform data/config dirs
    pub const APP_DIR_NAME: &str = "download-manager";

    /// Config file name
    pub const CONFIG_FILE_NAME: &str = "config.toml";

    /// Read buffer size when hashing finished files
    pub const HASH_BUFFER_SIZE: usize = 64 * 1024;
}

/// RPC naming constants
pub mod rpc {
    /// Object path prefix for single downloads
    pub const DOWNLOAD_PATH_PREFIX: &str = "/com/canonical/applications/download";

    /// Object path prefix for download groups
    pub const GROUP_PATH_PREFIX: &str = "/com/canonical/applications/download/group";

    /// Caller id the command-line front end registers transfers under
    pub const CLI_CALLER: &str = "download-manager-cli";
}

/// Channel sizing constants
pub mod channels {
    /// Pending client commands before senders wait
    pub const COMMAND_BUFFER: usize = 256;

    /// Engine messages in flight before connection tasks wait
    pub const ENGINE_BUFFER: usize = 64;

    /// Buffered notifications per subscriber before it lags
    pub const NOTIFICATION_BUFFER: usize = 1024;
}

/// Logging constants
pub mod logging {
    /// Default log level
    pub const DEFAULT_LOG_LEVEL: &str = "warn";

    /// Crate target used for the log filter directive
    pub const CRATE_TARGET: &str = "download_manager";
}

// Re-export commonly used constants for convenience
pub use files::TEMP_FILE_SUFFIX;
pub use http::{MAX_REDIRECTS, USER_AGENT};
