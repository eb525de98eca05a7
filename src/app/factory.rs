//! Construction and validation of new transfers
//!
//! Everything that can be checked without the network is checked here:
//! URLs, the hash algorithm, headers and the destination path. A request
//! that fails any check never becomes a transfer and the caller gets the
//! validation error synchronously.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::app::client::parse_download_url;
use crate::app::client::request::validate_headers;
use crate::app::confinement::{ConfinementResolver, SecurityDetails, TransferKind};
use crate::app::engine::Engine;
use crate::app::hash::HashAlgorithm;
use crate::app::transfer::naming::url_file_name;
use crate::app::transfer::{
    FileTransfer, FileTransferConfig, GroupItem, GroupTransfer, GroupTransferConfig, Headers,
    Metadata, PathLocks, TransferId,
};
use crate::constants::metadata;
use crate::errors::{TransferError, TransferResult};

/// A single download as requested by a client
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub hash: Option<String>,
    /// Algorithm name; md5 when absent
    pub algorithm: Option<String>,
    pub metadata: Metadata,
    pub headers: Headers,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>, algorithm: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self.algorithm = Some(algorithm.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A group of downloads as requested by a client
#[derive(Debug, Clone, Default)]
pub struct GroupRequest {
    pub items: Vec<GroupItem>,
    pub algorithm: Option<String>,
    pub allow_mobile_data: bool,
    pub metadata: Metadata,
    pub headers: Headers,
}

/// Settings applied to transfers that do not choose their own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDefaults {
    pub throttle: u64,
    pub allow_mobile_data: bool,
}

impl Default for TransferDefaults {
    fn default() -> Self {
        Self {
            throttle: 0,
            allow_mobile_data: true,
        }
    }
}

/// Builds transfers from client requests
#[derive(Debug, Clone)]
pub struct TransferFactory {
    engine: Engine,
    locks: PathLocks,
    resolver: Arc<dyn ConfinementResolver>,
    defaults: TransferDefaults,
    max_redirects: usize,
}

impl TransferFactory {
    pub fn new(
        engine: Engine,
        locks: PathLocks,
        resolver: Arc<dyn ConfinementResolver>,
        defaults: TransferDefaults,
        max_redirects: usize,
    ) -> Self {
        Self {
            engine,
            locks,
            resolver,
            defaults,
            max_redirects,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn defaults(&self) -> TransferDefaults {
        self.defaults
    }

    pub fn set_default_throttle(&mut self, bytes_per_sec: u64) {
        self.defaults.throttle = bytes_per_sec;
    }

    pub fn set_allow_mobile_data_default(&mut self, allowed: bool) {
        self.defaults.allow_mobile_data = allowed;
    }

    /// Validate a request and build an idle single-file transfer
    pub fn create_download(
        &self,
        caller: &str,
        request: DownloadRequest,
    ) -> TransferResult<FileTransfer> {
        let id = TransferId::new();
        let details = self.resolver.resolve(caller, &id, TransferKind::Single);

        let url = parse_download_url(&request.url)?;
        let algorithm = HashAlgorithm::parse_optional(request.algorithm.as_deref())?;
        validate_headers(&request.headers)?;

        let mut metadata = request.metadata;
        let explicit = if details.is_confined {
            strip_confined_keys(&mut metadata);
            None
        } else {
            metadata.local_path()
        };

        let (local_path, rename_on_disposition) = match explicit {
            Some(path) => {
                self.lock_exact(&path)?;
                (path, false)
            }
            None => {
                let name = url_file_name(&url).unwrap_or_else(|| id.to_string());
                (self.locks.lock(&details.local_root.join(name)), true)
            }
        };

        info!(
            "Created download {} for {} -> {}",
            id,
            caller,
            local_path.display()
        );
        let config = FileTransferConfig {
            id,
            owner: id,
            caller_app_id: details.app_id,
            rpc_path: details.rpc_path,
            url,
            local_path,
            confined: details.is_confined,
            rename_on_disposition,
            hash: non_empty(request.hash),
            algorithm,
            headers: request.headers,
            metadata,
            throttle: self.defaults.throttle,
            allow_mobile_data: self.defaults.allow_mobile_data,
            max_redirects: self.max_redirects,
        };
        Ok(FileTransfer::new(config, self.engine.clone(), self.locks.clone()))
    }

    /// Validate every item and build an idle group
    ///
    /// The first invalid item rejects the whole group; no destination stays
    /// reserved in that case.
    pub fn create_group(&self, caller: &str, request: GroupRequest) -> TransferResult<GroupTransfer> {
        let id = TransferId::new();
        let details = self.resolver.resolve(caller, &id, TransferKind::Group);

        let algorithm = HashAlgorithm::parse_optional(request.algorithm.as_deref())?;
        validate_headers(&request.headers)?;

        let mut group_metadata = request.metadata;
        if details.is_confined {
            strip_confined_keys(&mut group_metadata);
        }

        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let url = parse_download_url(&item.url)?;
            let child_id = TransferId::new();
            let path = child_destination(&details, item, &url, &child_id);
            if !seen.insert(path.clone()) {
                return Err(TransferError::validation(format!(
                    "Duplicate local file in group: '{}'",
                    path.display()
                )));
            }
            planned.push((child_id, url, path, non_empty(item.hash.clone())));
        }

        let mut reserved: Vec<PathBuf> = Vec::with_capacity(planned.len());
        let mut children = Vec::with_capacity(planned.len());
        for (index, (child_id, url, path, hash)) in planned.into_iter().enumerate() {
            let local_path = if details.is_confined {
                self.locks.lock(&path)
            } else {
                if let Err(e) = self.lock_exact(&path) {
                    for path in &reserved {
                        self.locks.unlock(path);
                    }
                    return Err(e);
                }
                path
            };
            reserved.push(local_path.clone());

            let mut metadata = group_metadata.clone();
            metadata.insert(
                metadata::LOCAL_PATH,
                local_path.to_string_lossy().into_owned(),
            );
            let config = FileTransferConfig {
                id: child_id,
                owner: id,
                caller_app_id: details.app_id.clone(),
                rpc_path: format!("{}/{}", details.rpc_path, index),
                url,
                local_path,
                confined: details.is_confined,
                rename_on_disposition: false,
                hash,
                algorithm,
                headers: request.headers.clone(),
                metadata,
                throttle: self.defaults.throttle,
                allow_mobile_data: request.allow_mobile_data,
                max_redirects: self.max_redirects,
            };
            children.push(FileTransfer::new(
                config,
                self.engine.clone(),
                self.locks.clone(),
            ));
        }

        info!(
            "Created group {} for {} with {} file(s)",
            id,
            caller,
            children.len()
        );
        let config = GroupTransferConfig {
            id,
            caller_app_id: details.app_id,
            rpc_path: details.rpc_path,
            algorithm,
            allow_mobile_data: request.allow_mobile_data,
            throttle: self.defaults.throttle,
            metadata: group_metadata,
        };
        Ok(GroupTransfer::new(config, children))
    }

    /// Reserve a destination chosen by the caller
    fn lock_exact(&self, path: &Path) -> TransferResult<()> {
        if path.exists() {
            return Err(TransferError::validation(format!(
                "File already exists at: '{}'",
                path.display()
            )));
        }
        if !self.locks.try_lock_exact(path) {
            return Err(TransferError::validation(format!(
                "Destination already used by another download: '{}'",
                path.display()
            )));
        }
        debug!("Reserved explicit destination {}", path.display());
        Ok(())
    }
}

fn strip_confined_keys(metadata: &mut Metadata) {
    metadata.remove(metadata::LOCAL_PATH);
    metadata.remove(metadata::CLICK_PACKAGE);
}

fn non_empty(hash: Option<String>) -> Option<String> {
    hash.map(|h| h.trim().to_string()).filter(|h| !h.is_empty())
}

/// Destination of one group item before reservation
fn child_destination(
    details: &SecurityDetails,
    item: &GroupItem,
    url: &Url,
    child_id: &TransferId,
) -> PathBuf {
    let requested = Path::new(&item.local_file);
    if !details.is_confined && !item.local_file.is_empty() {
        return if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            details.local_root.join(requested)
        };
    }
    // Confined callers only choose a file name
    let name = requested
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .or_else(|| url_file_name(url))
        .unwrap_or_else(|| child_id.to_string());
    details.local_root.join(name)
}
