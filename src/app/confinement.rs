//! Caller confinement lookup
//!
//! Sandboxed callers may only write below their own download directory and
//! never choose an absolute destination. The lookup is a blocking call into
//! the host security service, done once when a transfer is created.

use std::fmt;
use std::path::PathBuf;

use crate::app::transfer::TransferId;
use crate::constants::rpc;

/// Whether a request creates a single download or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Single,
    Group,
}

impl TransferKind {
    fn path_prefix(&self) -> &'static str {
        match self {
            Self::Single => rpc::DOWNLOAD_PATH_PREFIX,
            Self::Group => rpc::GROUP_PATH_PREFIX,
        }
    }
}

/// Result of a confinement lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDetails {
    pub app_id: String,
    pub is_confined: bool,
    /// Directory new files are written to unless an unconfined caller
    /// names its own destination
    pub local_root: PathBuf,
    /// Object path the transfer is exposed under
    pub rpc_path: String,
}

/// Host security service
pub trait ConfinementResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, caller: &str, id: &TransferId, kind: TransferKind) -> SecurityDetails;
}

/// Object path for a transfer id
pub fn rpc_path_for(id: &TransferId, kind: TransferKind) -> String {
    format!("{}/{}", kind.path_prefix(), id.simple())
}

/// Resolver with a fixed answer for every caller
///
/// Confined callers get a private directory named after their app id below
/// the root.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    confined: bool,
    root: PathBuf,
}

impl StaticResolver {
    pub fn unconfined(root: impl Into<PathBuf>) -> Self {
        Self {
            confined: false,
            root: root.into(),
        }
    }

    pub fn confined(root: impl Into<PathBuf>) -> Self {
        Self {
            confined: true,
            root: root.into(),
        }
    }
}

impl ConfinementResolver for StaticResolver {
    fn resolve(&self, caller: &str, id: &TransferId, kind: TransferKind) -> SecurityDetails {
        let local_root = if self.confined {
            self.root.join(caller)
        } else {
            self.root.clone()
        };
        SecurityDetails {
            app_id: caller.to_string(),
            is_confined: self.confined,
            local_root,
            rpc_path: rpc_path_for(id, kind),
        }
    }
}
