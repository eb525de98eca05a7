//! Transfer groups
//!
//! A group downloads its children one after another in creation order and
//! reports them to clients as a single transfer: progress is the sum of the
//! children, it finishes when every child finished and it fails as soon as
//! any child fails. On failure every sibling is canceled and files already
//! produced are deleted, so a group leaves either all of its files or none.

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::file::FileTransfer;
use super::types::{Metadata, TransferId, TransferState};
use super::{TransferControl, TransferEvent};
use crate::app::engine::EngineMessage;
use crate::app::hash::HashAlgorithm;
use crate::errors::TransferError;

/// One file requested as part of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupItem {
    pub url: String,
    /// Destination file name, or full path for unconfined callers
    pub local_file: String,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Group-wide settings shared by every child
#[derive(Debug, Clone)]
pub struct GroupTransferConfig {
    pub id: TransferId,
    pub caller_app_id: String,
    pub rpc_path: String,
    pub algorithm: HashAlgorithm,
    pub allow_mobile_data: bool,
    pub throttle: u64,
    pub metadata: Metadata,
}

/// Several files managed as one unit
#[derive(Debug)]
pub struct GroupTransfer {
    id: TransferId,
    caller_app_id: String,
    rpc_path: String,
    algorithm: HashAlgorithm,
    allow_mobile_data: bool,
    throttle: u64,
    metadata: Metadata,
    state: TransferState,
    children: Vec<FileTransfer>,
    /// Child currently allowed to hold the group's connection
    active: Option<usize>,
    /// Output of finished children, kept for rollback
    finished: Vec<PathBuf>,
    last_error: Option<TransferError>,
    events: Vec<TransferEvent>,
}

impl GroupTransfer {
    /// Build a group from children whose owner is `config.id`
    pub fn new(config: GroupTransferConfig, children: Vec<FileTransfer>) -> Self {
        Self {
            id: config.id,
            caller_app_id: config.caller_app_id,
            rpc_path: config.rpc_path,
            algorithm: config.algorithm,
            allow_mobile_data: config.allow_mobile_data,
            throttle: config.throttle,
            metadata: config.metadata,
            state: TransferState::Idle,
            children,
            active: None,
            finished: Vec::new(),
            last_error: None,
            events: Vec::new(),
        }
    }

    pub fn rpc_path(&self) -> &str {
        &self.rpc_path
    }

    pub fn caller_app_id(&self) -> &str {
        &self.caller_app_id
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn children(&self) -> &[FileTransfer] {
        &self.children
    }

    pub fn finished_paths(&self) -> &[PathBuf] {
        &self.finished
    }

    pub fn last_error(&self) -> Option<&TransferError> {
        self.last_error.as_ref()
    }

    pub fn release(&mut self) {
        for child in &mut self.children {
            child.release();
        }
        self.active = None;
    }

    fn emit(&mut self, event: TransferEvent) {
        self.events.push(event);
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!("Group {} state {} -> {}", self.id, self.state, state);
            self.state = state;
            self.emit(TransferEvent::StateChanged(state));
        }
    }

    fn next_unfinished(&self) -> Option<usize> {
        self.children
            .iter()
            .position(|child| child.state() != TransferState::Uncollected)
    }

    fn all_finished(&self) -> bool {
        self.children
            .iter()
            .all(|child| child.state() == TransferState::Uncollected)
    }

    /// Give the connection to child `index`
    async fn activate(&mut self, index: usize, resume: bool) {
        self.active = Some(index);
        let child = &mut self.children[index];
        if !child.state().is_active() {
            if resume {
                child.resume();
            } else {
                child.start();
            }
        }
        if resume {
            child.resume_transfer().await;
        } else {
            child.start_transfer().await;
        }
    }

    /// Translate child events into group events
    ///
    /// Starting the next child after one finished may itself produce events,
    /// so the children to drain form a worklist. Acknowledgements are only
    /// forwarded for the child the client request was aimed at.
    async fn drain_children(&mut self, index: usize, forward_acks: bool) {
        let mut pending = VecDeque::from([(index, forward_acks)]);
        while let Some((index, forward_acks)) = pending.pop_front() {
            let events = self.children[index].take_events();
            for event in events {
                match event {
                    TransferEvent::Started(_)
                    | TransferEvent::Paused(_)
                    | TransferEvent::Resumed(_) => {
                        if forward_acks {
                            self.emit(event);
                        }
                    }
                    TransferEvent::Progress { .. } => {
                        let (received, total) = self.progress();
                        self.emit(TransferEvent::Progress { received, total });
                    }
                    TransferEvent::Processing(path) => {
                        self.emit(TransferEvent::Processing(path));
                    }
                    TransferEvent::Finished(path) => {
                        debug!("Group {} child {} finished", self.id, index);
                        self.finished.push(path);
                        if self.all_finished() {
                            self.finish();
                            return;
                        }
                        if self.state.is_active() {
                            if let Some(next) = self.next_unfinished() {
                                let resume = self.state == TransferState::Resume;
                                self.activate(next, resume).await;
                                pending.push_back((next, false));
                            }
                        } else {
                            self.active = None;
                        }
                    }
                    TransferEvent::Error(error) => {
                        self.fail_child(index, error).await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    fn finish(&mut self) {
        info!(
            "Group {} finished with {} file(s)",
            self.id,
            self.finished.len()
        );
        self.active = None;
        self.set_state(TransferState::Uncollected);
        let paths = self.finished.clone();
        self.emit(TransferEvent::GroupFinished(paths));
    }

    /// Cancel every other child, delete finished output, report once
    async fn fail_child(&mut self, index: usize, cause: TransferError) {
        let url = self.children[index].url().to_string();
        for (i, child) in self.children.iter_mut().enumerate() {
            if i == index {
                continue;
            }
            if child.state() == TransferState::Uncollected {
                child.discard().await;
            } else {
                child.cancel();
                child.cancel_transfer().await;
            }
            child.take_events();
        }
        self.children[index].take_events();
        self.finished.clear();
        self.active = None;

        let error = TransferError::Group {
            url,
            source: Box::new(cause),
        };
        error!("Group {} failed: {}", self.id, error);
        self.last_error = Some(error.clone());
        self.set_state(TransferState::Error);
        self.emit(TransferEvent::Error(error));
    }

    async fn cancel_children(&mut self) {
        for child in &mut self.children {
            if child.state() == TransferState::Uncollected {
                child.discard().await;
            } else {
                child.cancel();
                child.cancel_transfer().await;
            }
            child.take_events();
        }
        self.finished.clear();
        self.active = None;
    }

    /// Rewind every child after a failure so the group can run again
    fn reset_children(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.finished.clear();
        self.active = None;
        self.last_error = None;
        info!("Group {} reset after failure", self.id);
    }

    fn active_child_mut(&mut self) -> Option<(usize, &mut FileTransfer)> {
        let index = self.active?;
        self.children.get_mut(index).map(|child| (index, child))
    }
}

#[async_trait]
impl TransferControl for GroupTransfer {
    fn id(&self) -> TransferId {
        self.id
    }

    fn state(&self) -> TransferState {
        self.state
    }

    fn start(&mut self) {
        match self.state {
            TransferState::Idle | TransferState::Pause => self.set_state(TransferState::Start),
            TransferState::Error => {
                self.reset_children();
                self.set_state(TransferState::Start)
            }
            TransferState::Start | TransferState::Resume if self.has_connection() => {
                self.emit(TransferEvent::Started(true))
            }
            TransferState::Start | TransferState::Resume => {}
            _ => self.emit(TransferEvent::Started(false)),
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
            TransferState::Idle | TransferState::Pause => self.set_state(TransferState::Resume),
            TransferState::Error => {
                self.reset_children();
                self.set_state(TransferState::Resume)
            }
            TransferState::Start if !self.has_connection() => {
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
        if self.children.is_empty() {
            self.emit(TransferEvent::Started(true));
            self.finish();
            return;
        }
        if self.has_connection() {
            self.emit(TransferEvent::Started(true));
            return;
        }
        let Some(index) = self.active.or_else(|| self.next_unfinished()) else {
            return;
        };
        info!("Starting group {} at child {}", self.id, index);
        self.activate(index, false).await;
        self.drain_children(index, true).await;
    }

    async fn pause_transfer(&mut self) {
        let Some((index, child)) = self.active_child_mut() else {
            self.emit(TransferEvent::Paused(false));
            return;
        };
        if !child.has_connection() {
            self.emit(TransferEvent::Paused(false));
            return;
        }
        child.pause();
        child.pause_transfer().await;
        self.drain_children(index, true).await;
    }

    async fn resume_transfer(&mut self) {
        if self.has_connection() {
            self.emit(TransferEvent::Resumed(false));
            return;
        }
        let Some(index) = self.active.or_else(|| self.next_unfinished()) else {
            self.emit(TransferEvent::Resumed(false));
            return;
        };
        info!("Resuming group {} at child {}", self.id, index);
        self.activate(index, true).await;
        self.drain_children(index, true).await;
    }

    async fn cancel_transfer(&mut self) {
        self.cancel_children().await;
        info!("Canceled group {}", self.id);
        self.emit(TransferEvent::Canceled(true));
    }

    async fn suspend_transfer(&mut self) {
        if let Some((index, child)) = self.active_child_mut() {
            child.suspend_transfer().await;
            self.drain_children(index, false).await;
        }
    }

    async fn handle_engine_message(&mut self, message: EngineMessage) {
        let index = match &message {
            EngineMessage::Network { connection, .. } => self
                .children
                .iter()
                .position(|child| child.connection_id() == Some(*connection)),
            EngineMessage::ProcessExited { transfer, .. } => self
                .children
                .iter()
                .position(|child| child.id() == *transfer),
        };
        let Some(index) = index else {
            debug!("Group {} has no child for engine message", self.id);
            return;
        };
        self.children[index].handle_engine_message(message).await;
        self.drain_children(index, false).await;
    }

    fn progress(&self) -> (u64, u64) {
        self.children
            .iter()
            .map(TransferControl::progress)
            .fold((0, 0), |(received, total), (r, t)| (received + r, total + t))
    }

    fn total_size(&self) -> u64 {
        self.children.iter().map(TransferControl::total_size).sum()
    }

    fn throttle(&self) -> u64 {
        self.throttle
    }

    fn set_throttle(&mut self, bytes_per_sec: u64) {
        for child in &mut self.children {
            child.set_throttle(bytes_per_sec);
            child.take_events();
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
        for child in &mut self.children {
            child.allow_mobile_download(allowed);
            child.take_events();
        }
        if self.allow_mobile_data != allowed {
            self.allow_mobile_data = allowed;
            self.emit(TransferEvent::MobileDataChanged(allowed));
        }
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn has_connection(&self) -> bool {
        self.children.iter().any(FileTransfer::has_connection)
    }

    fn take_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }
}
