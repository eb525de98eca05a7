//! Single-file transfer state machine
//!
//! A [`FileTransfer`] owns at most one open connection and one open data
//! file. Bytes are streamed into `<local path>.tmp`; once the body is
//! complete the digest is checked, the temp file is renamed into place and
//! the optional post-download command runs. Received byte counts always come
//! from the size of the data file on disk, never from network deltas, so a
//! resumed transfer reports the same numbers as an uninterrupted one.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use url::Url;

use super::naming::PathLocks;
use super::types::{Headers, Metadata, TransferId, TransferRecord, TransferState};
use super::{TransferControl, TransferEvent};
use crate::app::client::{
    content_disposition_filename, parse_download_url, RedirectTracker, TransferRequest,
};
use crate::app::engine::{ConnectionHandle, ConnectionId, Engine, EngineMessage, NetworkEvent};
use crate::app::hash::{checksums_match, HashAlgorithm};
use crate::app::process::{spawn_post_command, PostCommand, ProcessHandle, ProcessOutcome};
use crate::constants::files;
use crate::errors::{TransferError, TransferResult};

/// Everything needed to build a [`FileTransfer`]
#[derive(Debug, Clone)]
pub struct FileTransferConfig {
    pub id: TransferId,
    /// Top-level transfer that receives engine messages; the group id for
    /// group children, `id` otherwise
    pub owner: TransferId,
    pub caller_app_id: String,
    pub rpc_path: String,
    pub url: Url,
    /// Final destination, already reserved in the path locks
    pub local_path: PathBuf,
    pub confined: bool,
    /// Let a `Content-Disposition` filename replace the destination name
    pub rename_on_disposition: bool,
    pub hash: Option<String>,
    pub algorithm: HashAlgorithm,
    pub headers: Headers,
    pub metadata: Metadata,
    pub throttle: u64,
    pub allow_mobile_data: bool,
    pub max_redirects: usize,
}

/// Path of the partial data file for `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(files::TEMP_FILE_SUFFIX);
    PathBuf::from(name)
}

/// One file downloaded over HTTP
#[derive(Debug)]
pub struct FileTransfer {
    id: TransferId,
    owner: TransferId,
    caller_app_id: String,
    rpc_path: String,
    url: Url,
    /// Target of the last redirect, `url` when none was followed
    current_url: Url,
    local_path: PathBuf,
    temp_path: PathBuf,
    confined: bool,
    rename_on_disposition: bool,
    hash: Option<String>,
    algorithm: HashAlgorithm,
    headers: Headers,
    metadata: Metadata,
    state: TransferState,
    total_size: u64,
    received: u64,
    throttle: u64,
    allow_mobile_data: bool,
    last_error: Option<TransferError>,
    file: Option<File>,
    connection: Option<ConnectionHandle>,
    redirects: RedirectTracker,
    /// Offset sent in the Range header of the open connection
    range_start: Option<u64>,
    /// The queue closed the connection behind the client's back
    interrupted: bool,
    /// Running post-download command
    process: Option<ProcessHandle>,
    /// The temp file was renamed to `local_path`
    finalized: bool,
    content_disposition: Option<String>,
    created_at: DateTime<Utc>,
    engine: Engine,
    locks: PathLocks,
    events: Vec<TransferEvent>,
}

impl FileTransfer {
    /// Create an idle transfer
    pub fn new(config: FileTransferConfig, engine: Engine, locks: PathLocks) -> Self {
        let temp_path = temp_path_for(&config.local_path);
        Self {
            id: config.id,
            owner: config.owner,
            caller_app_id: config.caller_app_id,
            rpc_path: config.rpc_path,
            redirects: RedirectTracker::new(&config.url, config.max_redirects),
            current_url: config.url.clone(),
            url: config.url,
            local_path: config.local_path,
            temp_path,
            confined: config.confined,
            rename_on_disposition: config.rename_on_disposition,
            hash: config.hash,
            algorithm: config.algorithm,
            headers: config.headers,
            metadata: config.metadata,
            state: TransferState::Idle,
            total_size: 0,
            received: 0,
            throttle: config.throttle,
            allow_mobile_data: config.allow_mobile_data,
            last_error: None,
            file: None,
            connection: None,
            range_start: None,
            interrupted: false,
            process: None,
            finalized: false,
            content_disposition: None,
            created_at: Utc::now(),
            engine,
            locks,
            events: Vec::new(),
        }
    }

    /// Rebuild a transfer from its persisted record
    ///
    /// A partial data file left on disk counts as received bytes. A record
    /// saved in START continues from it when the queue admits it again; a
    /// client resume always does.
    pub async fn restore(
        record: TransferRecord,
        engine: Engine,
        locks: PathLocks,
        max_redirects: usize,
    ) -> TransferResult<Self> {
        let url = parse_download_url(&record.url)?;
        if !locks.try_lock_exact(&record.local_path) {
            warn!(
                "Destination {} of restored transfer {} is already reserved",
                record.local_path.display(),
                record.id
            );
        }

        let config = FileTransferConfig {
            id: record.id,
            owner: record.id,
            caller_app_id: record.caller_app_id,
            rpc_path: record.rpc_path,
            url,
            rename_on_disposition: record.is_confined || record.metadata.local_path().is_none(),
            local_path: record.local_path,
            confined: record.is_confined,
            hash: record.hash,
            algorithm: record.hash_algorithm,
            headers: record.headers,
            metadata: record.metadata,
            throttle: record.throttle,
            allow_mobile_data: record.allow_mobile_data,
            max_redirects,
        };
        let mut transfer = Self::new(config, engine, locks);
        transfer.state = record.state;
        transfer.total_size = record.total_size;
        transfer.created_at = record.created_at;

        let partial = fs::metadata(&transfer.temp_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        transfer.received = partial;
        transfer.interrupted = partial > 0 && record.state == TransferState::Start;
        transfer.finalized =
            record.state == TransferState::Uncollected && transfer.local_path.exists();

        info!(
            "Restored transfer {} in state {} with {} bytes on disk",
            transfer.id, transfer.state, partial
        );
        Ok(transfer)
    }

    pub fn owner(&self) -> TransferId {
        self.owner
    }

    pub fn rpc_path(&self) -> &str {
        &self.rpc_path
    }

    pub fn caller_app_id(&self) -> &str {
        &self.caller_app_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn is_confined(&self) -> bool {
        self.confined
    }

    pub fn last_error(&self) -> Option<&TransferError> {
        self.last_error.as_ref()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(ConnectionHandle::id)
    }

    pub fn is_awaiting_process(&self) -> bool {
        self.process.is_some()
    }

    /// Snapshot for the metadata store
    pub fn record(&self) -> TransferRecord {
        TransferRecord {
            id: self.id,
            caller_app_id: self.caller_app_id.clone(),
            rpc_path: self.rpc_path.clone(),
            url: self.url.to_string(),
            local_path: self.local_path.clone(),
            is_confined: self.confined,
            hash: self.hash.clone(),
            hash_algorithm: self.algorithm,
            state: self.state,
            total_size: self.total_size,
            throttle: self.throttle,
            allow_mobile_data: self.allow_mobile_data,
            metadata: self.metadata.clone(),
            headers: self.headers.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Drop the connection and file handle and free the destination name
    pub fn release(&mut self) {
        self.connection = None;
        self.file = None;
        self.process = None;
        self.locks.unlock(&self.local_path);
        debug!("Released transfer {}", self.id);
    }

    /// Delete the output of a finished transfer
    ///
    /// Used when a sibling in the same group fails after this one finished.
    pub async fn discard(&mut self) {
        self.connection = None;
        self.process = None;
        self.close_file().await;
        self.remove_files().await;
        self.finalized = false;
        self.locks.unlock(&self.local_path);
    }

    /// Put a failed or canceled group child back to IDLE
    ///
    /// Its destination name is reserved again unless it still holds it.
    pub fn reset(&mut self) {
        self.connection = None;
        self.process = None;
        self.file = None;
        if self.state != TransferState::Error && !self.locks.try_lock_exact(&self.local_path) {
            warn!(
                "Destination {} of transfer {} is reserved by another transfer",
                self.local_path.display(),
                self.id
            );
        }
        self.interrupted = false;
        self.finalized = false;
        self.range_start = None;
        self.received = 0;
        self.total_size = 0;
        self.last_error = None;
        self.state = TransferState::Idle;
        self.events.clear();
        debug!("Reset transfer {}", self.id);
    }

    fn emit(&mut self, event: TransferEvent) {
        self.events.push(event);
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!("Transfer {} state {} -> {}", self.id, self.state, state);
            self.state = state;
            self.emit(TransferEvent::StateChanged(state));
        }
    }

    fn open_connection(&mut self) {
        let mut request = TransferRequest::new(self.current_url.clone(), self.headers.clone());
        if let Some(offset) = self.range_start {
            request = request.with_range(offset);
        }
        self.connection = Some(self.engine.open(self.owner, request, self.throttle));
    }

    /// Truncate the data file and open a connection without Range
    async fn begin_fresh(&mut self) -> TransferResult<()> {
        let file = open_append(&self.temp_path).await?;
        file.set_len(0)
            .await
            .map_err(|e| TransferError::file_system(&self.temp_path, &e))?;
        self.file = Some(file);
        self.received = 0;
        self.range_start = None;
        self.interrupted = false;
        self.finalized = false;
        self.last_error = None;
        self.content_disposition = None;
        self.redirects.reset(&self.url);
        self.current_url = self.url.clone();

        info!("Starting transfer {} from {}", self.id, self.url);
        self.open_connection();
        Ok(())
    }

    /// Append to the bytes already on disk using a Range request
    async fn continue_from_disk(&mut self) -> TransferResult<()> {
        if self.file.is_none() {
            self.file = Some(open_append(&self.temp_path).await?);
        }
        let size = fs::metadata(&self.temp_path)
            .await
            .map_err(|e| TransferError::file_system(&self.temp_path, &e))?
            .len();
        self.received = size;
        self.range_start = Some(size);
        self.interrupted = false;
        self.last_error = None;
        self.redirects.reset(&self.url);
        self.current_url = self.url.clone();

        info!("Resuming transfer {} at byte {}", self.id, size);
        self.open_connection();
        Ok(())
    }

    async fn close_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush {}: {}", self.temp_path.display(), e);
            }
        }
    }

    async fn flush_file(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        }
    }

    async fn remove_files(&mut self) {
        remove_if_present(&self.temp_path).await;
        if self.finalized {
            remove_if_present(&self.local_path).await;
        }
    }

    async fn fail(&mut self, error: TransferError) {
        error!("Transfer {} failed: {}", self.id, error);
        self.connection = None;
        self.process = None;
        self.interrupted = false;
        self.close_file().await;
        self.remove_files().await;
        self.finalized = false;
        self.received = 0;
        self.last_error = Some(error.clone());
        self.set_state(TransferState::Error);
        self.emit(TransferEvent::Error(error));
    }

    fn finish(&mut self) {
        info!(
            "Transfer {} finished: {}",
            self.id,
            self.local_path.display()
        );
        self.set_state(TransferState::Uncollected);
        let path = self.local_path.clone();
        self.emit(TransferEvent::Finished(path));
    }

    async fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Headers {
                status,
                content_length,
                content_disposition,
                partial,
            } => {
                debug!(
                    "Transfer {} got HTTP {} (length {:?}, partial {})",
                    self.id, status, content_length, partial
                );
                if self.range_start.map_or(false, |offset| offset > 0) && !partial {
                    warn!(
                        "Server ignored the Range request for {}, starting over",
                        self.id
                    );
                    if let Some(file) = self.file.as_mut() {
                        if let Err(e) = file.set_len(0).await {
                            let error = TransferError::file_system(&self.temp_path, &e);
                            return self.fail(error).await;
                        }
                    }
                    self.range_start = None;
                    self.received = 0;
                }
                // Later responses describe only the remaining bytes
                if self.total_size == 0 {
                    if let Some(length) = content_length {
                        self.total_size = self.range_start.unwrap_or(0) + length;
                    }
                }
                if content_disposition.is_some() {
                    self.content_disposition = content_disposition;
                }
            }
            NetworkEvent::Data(chunk) => {
                if let Err(e) = self.write_chunk(chunk).await {
                    let error = TransferError::file_system(&self.temp_path, &e);
                    return self.fail(error).await;
                }
                let (received, total) = self.progress();
                self.emit(TransferEvent::Progress { received, total });
            }
            NetworkEvent::Redirect(target) => {
                self.connection = None;
                if let Err(e) = self.redirects.follow(&target) {
                    return self.fail(e).await;
                }
                info!(
                    "Transfer {} redirected to {} (hop {})",
                    self.id,
                    target,
                    self.redirects.hops()
                );
                self.current_url = target;
                self.open_connection();
            }
            NetworkEvent::Finished => self.complete().await,
            NetworkEvent::Failed(error) => self.fail(error).await,
        }
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "data file is not open"))?;
        file.write_all(&chunk).await?;
        file.flush().await?;
        self.received = file.metadata().await?.len();
        Ok(())
    }

    /// All bytes are on disk: verify, move into place, post-process
    async fn complete(&mut self) {
        self.connection = None;
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                let error = TransferError::file_system(&self.temp_path, &e);
                return self.fail(error).await;
            }
        }

        if self.rename_on_disposition {
            self.apply_content_disposition();
        }

        if let Some(expected) = self.hash.clone() {
            self.emit(TransferEvent::Processing(self.temp_path.clone()));
            match self.algorithm.digest_file(&self.temp_path).await {
                Ok(checksum) if checksums_match(&expected, &checksum) => {
                    debug!("Checksum of {} verified", self.id);
                }
                Ok(checksum) => {
                    let error = TransferError::Hash {
                        method: self.algorithm.as_str().to_string(),
                        expected,
                        checksum,
                    };
                    return self.fail(error).await;
                }
                Err(e) => {
                    let error = TransferError::file_system(&self.temp_path, &e);
                    return self.fail(error).await;
                }
            }
        }

        if let Err(e) = fs::rename(&self.temp_path, &self.local_path).await {
            let error = TransferError::file_system(&self.local_path, &e);
            return self.fail(error).await;
        }
        self.finalized = true;

        let Some(command) = PostCommand::from_metadata(&self.metadata) else {
            return self.finish();
        };
        self.emit(TransferEvent::Processing(self.local_path.clone()));
        let sender = self.engine.sender(self.owner);
        match spawn_post_command(&command, &self.local_path, self.id, sender) {
            Ok(process) => self.process = Some(process),
            Err(e) => self.fail(e).await,
        }
    }

    fn apply_content_disposition(&mut self) {
        let Some(name) = self
            .content_disposition
            .as_deref()
            .and_then(content_disposition_filename)
        else {
            return;
        };
        let candidate = self.local_path.with_file_name(name);
        if candidate == self.local_path {
            return;
        }
        self.locks.unlock(&self.local_path);
        self.local_path = self.locks.lock(&candidate);
        debug!(
            "Transfer {} renamed to {} by Content-Disposition",
            self.id,
            self.local_path.display()
        );
    }

    async fn handle_process_exit(&mut self, outcome: ProcessOutcome) {
        self.process = None;
        if !outcome.success() {
            return self.fail(outcome.into_error()).await;
        }
        // The command consumed the file
        remove_if_present(&self.local_path).await;
        self.finalized = false;
        self.finish();
    }
}

async fn open_append(path: &Path) -> TransferResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::file_system(parent, &e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| TransferError::file_system(path, &e))
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[async_trait]
impl TransferControl for FileTransfer {
    fn id(&self) -> TransferId {
        self.id
    }

    fn state(&self) -> TransferState {
        self.state
    }

    fn start(&mut self) {
        match self.state {
            TransferState::Idle | TransferState::Pause | TransferState::Error => {
                // A client start never continues old bytes
                self.interrupted = false;
                self.set_state(TransferState::Start)
            }
            TransferState::Start | TransferState::Resume => {
                if self.connection.is_some() || self.process.is_some() {
                    self.emit(TransferEvent::Started(true));
                }
            }
            TransferState::Cancel | TransferState::Uncollected => {
                self.emit(TransferEvent::Started(false))
            }
        }
    }

    fn pause(&mut self) {
        match self.state {
            TransferState::Idle | TransferState::Start | TransferState::Resume => {
                self.set_state(TransferState::Pause)
            }
            _ => self.emit(TransferEvent::Paused(false)),
        }
    }

    fn resume(&mut self) {
        match self.state {
            TransferState::Idle | TransferState::Pause | TransferState::Error => {
                self.set_state(TransferState::Resume)
            }
            // Still waiting for the connection slot
            TransferState::Start if self.connection.is_none() && self.process.is_none() => {
                self.set_state(TransferState::Resume)
            }
            _ => self.emit(TransferEvent::Resumed(false)),
        }
    }

    fn cancel(&mut self) {
        match self.state {
            TransferState::Cancel => {}
            TransferState::Uncollected => self.emit(TransferEvent::Canceled(false)),
            _ => self.set_state(TransferState::Cancel),
        }
    }

    async fn start_transfer(&mut self) {
        if self.connection.is_some() {
            self.emit(TransferEvent::Started(true));
            return;
        }
        if self.process.is_some() {
            debug!("Transfer {} body already complete, command running", self.id);
            return;
        }
        if self.interrupted {
            if let Err(e) = self.continue_from_disk().await {
                self.fail(e).await;
            }
            return;
        }
        match self.begin_fresh().await {
            Ok(()) => self.emit(TransferEvent::Started(true)),
            Err(e) => {
                self.emit(TransferEvent::Started(false));
                self.fail(e).await;
            }
        }
    }

    async fn pause_transfer(&mut self) {
        if self.connection.take().is_none() {
            self.emit(TransferEvent::Paused(false));
            return;
        }
        self.interrupted = false;
        match self.flush_file().await {
            Ok(()) => {
                info!("Paused transfer {} at byte {}", self.id, self.received);
                self.emit(TransferEvent::Paused(true));
            }
            Err(e) => {
                warn!("Failed to flush {} on pause: {}", self.id, e);
                self.emit(TransferEvent::Paused(false));
            }
        }
    }

    async fn resume_transfer(&mut self) {
        if self.connection.is_some() {
            self.emit(TransferEvent::Resumed(false));
            return;
        }
        if self.process.is_some() {
            debug!("Transfer {} body already complete, command running", self.id);
            return;
        }
        match self.continue_from_disk().await {
            Ok(()) => self.emit(TransferEvent::Resumed(true)),
            Err(e) => {
                self.emit(TransferEvent::Resumed(false));
                self.fail(e).await;
            }
        }
    }

    async fn cancel_transfer(&mut self) {
        self.connection = None;
        self.process = None;
        self.interrupted = false;
        self.close_file().await;
        self.remove_files().await;
        self.finalized = false;
        self.locks.unlock(&self.local_path);
        info!("Canceled transfer {}", self.id);
        self.emit(TransferEvent::Canceled(true));
    }

    async fn suspend_transfer(&mut self) {
        if self.connection.take().is_none() {
            return;
        }
        if let Err(e) = self.flush_file().await {
            warn!("Failed to flush {} on suspend: {}", self.id, e);
        }
        self.interrupted = true;
        info!("Suspended transfer {} at byte {}", self.id, self.received);
    }

    async fn handle_engine_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Network {
                connection, event, ..
            } => {
                if self.connection_id() != Some(connection) {
                    debug!(
                        "Transfer {} ignoring event from stale connection {}",
                        self.id, connection
                    );
                    return;
                }
                self.handle_network_event(event).await;
            }
            EngineMessage::ProcessExited {
                transfer, outcome, ..
            } => {
                if transfer != self.id || self.process.is_none() {
                    debug!("Transfer {} ignoring unexpected process exit", self.id);
                    return;
                }
                self.handle_process_exit(outcome).await;
            }
        }
    }

    fn progress(&self) -> (u64, u64) {
        let total = if self.total_size == 0 {
            self.received
        } else {
            self.total_size
        };
        (self.received, total)
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn throttle(&self) -> u64 {
        self.throttle
    }

    fn set_throttle(&mut self, bytes_per_sec: u64) {
        if let Some(connection) = &self.connection {
            connection.set_throttle(bytes_per_sec);
        }
        if self.throttle != bytes_per_sec {
            self.throttle = bytes_per_sec;
            self.emit(TransferEvent::ThrottleChanged(bytes_per_sec));
        }
    }

    fn is_mobile_download_allowed(&self) -> bool {
        self.allow_mobile_data
    }

    fn allow_mobile_download(&mut self, allowed: bool) {
        if self.allow_mobile_data != allowed {
            self.allow_mobile_data = allowed;
            self.emit(TransferEvent::MobileDataChanged(allowed));
        }
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    fn take_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }
}
