//! Transfers and their state machines
//!
//! A transfer is either a single file ([`FileTransfer`]) or a group of files
//! managed as one unit ([`GroupTransfer`]). Both implement
//! [`TransferControl`], which splits every operation in two halves:
//!
//! - client requests (`start`, `pause`, `resume`, `cancel`) only move the
//!   state and announce it; they never touch the network
//! - queue operations (`start_transfer`, `pause_transfer`, ...) do the I/O
//!   once the queue has decided the transfer may hold a connection
//!
//! Transfers never call back into their owner. Everything they have to say
//! is buffered as [`TransferEvent`]s and collected with `take_events`.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::app::engine::EngineMessage;
use crate::errors::TransferError;

pub mod file;
pub mod group;
pub mod naming;
pub mod types;

pub use file::{temp_path_for, FileTransfer, FileTransferConfig};
pub use group::{GroupItem, GroupTransfer, GroupTransferConfig};
pub use naming::PathLocks;
pub use types::{Headers, Metadata, TransferId, TransferRecord, TransferState};

/// Something a transfer reports to its observers
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged(TransferState),
    Started(bool),
    Paused(bool),
    Resumed(bool),
    Canceled(bool),
    /// Received and total bytes; total equals received while unknown
    Progress { received: u64, total: u64 },
    /// Verification or post-processing of the given file began
    Processing(PathBuf),
    Finished(PathBuf),
    GroupFinished(Vec<PathBuf>),
    Error(TransferError),
    ThrottleChanged(u64),
    MobileDataChanged(bool),
}

impl TransferEvent {
    /// Terminal notification after which no further progress follows
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Finished(_) | Self::GroupFinished(_) | Self::Error(_) | Self::Canceled(true)
        )
    }
}

/// Receiver of transfer notifications
///
/// Registered with the queue; called in order for every event once the
/// handler that produced it has finished.
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, id: &TransferId, event: &TransferEvent);
}

/// Shared interface of file and group transfers
#[async_trait]
pub trait TransferControl: Send {
    fn id(&self) -> TransferId;
    fn state(&self) -> TransferState;

    /// Request a start; the queue opens the connection when it admits it
    fn start(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn cancel(&mut self);

    /// Open a fresh connection, or confirm the one already open
    async fn start_transfer(&mut self);
    /// Abort the open connection and flush what was written
    async fn pause_transfer(&mut self);
    /// Continue from the bytes on disk with a Range request
    async fn resume_transfer(&mut self);
    /// Abort and delete everything written so far
    async fn cancel_transfer(&mut self);
    /// Close the connection without changing the client-visible state
    async fn suspend_transfer(&mut self);
    async fn handle_engine_message(&mut self, message: EngineMessage);

    /// `(received, total)` bytes
    fn progress(&self) -> (u64, u64);
    fn total_size(&self) -> u64;
    fn throttle(&self) -> u64;
    fn set_throttle(&mut self, bytes_per_sec: u64);
    fn is_mobile_download_allowed(&self) -> bool;
    fn allow_mobile_download(&mut self, allowed: bool);
    fn metadata(&self) -> &types::Metadata;
    fn has_connection(&self) -> bool;
    fn take_events(&mut self) -> Vec<TransferEvent>;
}

/// Either kind of transfer, as stored in the queue
#[derive(Debug)]
pub enum Transfer {
    File(FileTransfer),
    Group(GroupTransfer),
}

impl Transfer {
    pub fn rpc_path(&self) -> &str {
        match self {
            Self::File(t) => t.rpc_path(),
            Self::Group(t) => t.rpc_path(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Persistable record; groups are not persisted
    pub fn record(&self) -> Option<TransferRecord> {
        match self {
            Self::File(t) => Some(t.record()),
            Self::Group(_) => None,
        }
    }

    /// Release resources once the client acknowledged a terminal state
    pub fn release(&mut self) {
        match self {
            Self::File(t) => t.release(),
            Self::Group(t) => t.release(),
        }
    }

    fn inner(&self) -> &dyn TransferControl {
        match self {
            Self::File(t) => t,
            Self::Group(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn TransferControl {
        match self {
            Self::File(t) => t,
            Self::Group(t) => t,
        }
    }
}

impl From<FileTransfer> for Transfer {
    fn from(transfer: FileTransfer) -> Self {
        Self::File(transfer)
    }
}

impl From<GroupTransfer> for Transfer {
    fn from(transfer: GroupTransfer) -> Self {
        Self::Group(transfer)
    }
}

#[async_trait]
impl TransferControl for Transfer {
    fn id(&self) -> TransferId {
        self.inner().id()
    }

    fn state(&self) -> TransferState {
        self.inner().state()
    }

    fn start(&mut self) {
        self.inner_mut().start()
    }

    fn pause(&mut self) {
        self.inner_mut().pause()
    }

    fn resume(&mut self) {
        self.inner_mut().resume()
    }

    fn cancel(&mut self) {
        self.inner_mut().cancel()
    }

    async fn start_transfer(&mut self) {
        self.inner_mut().start_transfer().await
    }

    async fn pause_transfer(&mut self) {
        self.inner_mut().pause_transfer().await
    }

    async fn resume_transfer(&mut self) {
        self.inner_mut().resume_transfer().await
    }

    async fn cancel_transfer(&mut self) {
        self.inner_mut().cancel_transfer().await
    }

    async fn suspend_transfer(&mut self) {
        self.inner_mut().suspend_transfer().await
    }

    async fn handle_engine_message(&mut self, message: EngineMessage) {
        self.inner_mut().handle_engine_message(message).await
    }

    fn progress(&self) -> (u64, u64) {
        self.inner().progress()
    }

    fn total_size(&self) -> u64 {
        self.inner().total_size()
    }

    fn throttle(&self) -> u64 {
        self.inner().throttle()
    }

    fn set_throttle(&mut self, bytes_per_sec: u64) {
        self.inner_mut().set_throttle(bytes_per_sec)
    }

    fn is_mobile_download_allowed(&self) -> bool {
        self.inner().is_mobile_download_allowed()
    }

    fn allow_mobile_download(&mut self, allowed: bool) {
        self.inner_mut().allow_mobile_download(allowed)
    }

    fn metadata(&self) -> &Metadata {
        self.inner().metadata()
    }

    fn has_connection(&self) -> bool {
        self.inner().has_connection()
    }

    fn take_events(&mut self) -> Vec<TransferEvent> {
        self.inner_mut().take_events()
    }
}
