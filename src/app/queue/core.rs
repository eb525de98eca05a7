//! Core transfer queue implementation
//!
//! The queue owns every top-level transfer and decides which one may hold
//! the single network connection. Client requests and engine messages are
//! applied to a transfer, then the events it buffered are pumped: observers
//! see each event in order and state changes feed back into scheduling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::state::QueueState;
use crate::app::engine::EngineMessage;
use crate::app::network::NetworkMode;
use crate::app::transfer::{
    Transfer, TransferControl, TransferEvent, TransferId, TransferObserver, TransferState,
};
use crate::errors::{QueueError, QueueResult};

/// Event emitted by a queued transfer
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: TransferId,
    pub event: TransferEvent,
}

/// Client operation on a queued transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequest {
    Start,
    Pause,
    Resume,
    Cancel,
    SetThrottle(u64),
    AllowMobileData(bool),
}

/// Admission control across all transfers
pub struct TransferQueue {
    state: QueueState,
    observers: Vec<Arc<dyn TransferObserver>>,
}

impl fmt::Debug for TransferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferQueue")
            .field("state", &self.state)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl TransferQueue {
    pub fn new(mode: NetworkMode) -> Self {
        Self {
            state: QueueState::new(mode),
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn TransferObserver>) {
        self.observers.push(observer);
    }

    /// Register a transfer
    ///
    /// Restored transfers may already want a connection, in which case the
    /// queue is rescanned right away.
    pub async fn add(&mut self, transfer: Transfer) -> QueueResult<Vec<Notification>> {
        let id = transfer.id();
        let active = transfer.state().is_active();
        self.state.insert(transfer)?;

        let mut worklist = VecDeque::from([id]);
        if active && self.state.current().is_none() {
            self.update(&mut worklist).await;
        }
        Ok(self.drain(worklist).await)
    }

    /// Apply a client request to a transfer
    pub async fn request(
        &mut self,
        id: &TransferId,
        request: ClientRequest,
    ) -> QueueResult<Vec<Notification>> {
        let transfer = self
            .state
            .get_mut(id)
            .ok_or_else(|| QueueError::TransferNotFound { id: id.to_string() })?;
        debug!("Client request {:?} for {}", request, id);
        match request {
            ClientRequest::Start => transfer.start(),
            ClientRequest::Pause => transfer.pause(),
            ClientRequest::Resume => transfer.resume(),
            ClientRequest::Cancel => transfer.cancel(),
            ClientRequest::SetThrottle(bytes_per_sec) => transfer.set_throttle(bytes_per_sec),
            ClientRequest::AllowMobileData(allowed) => transfer.allow_mobile_download(allowed),
        }
        Ok(self.drain(VecDeque::from([*id])).await)
    }

    /// Route a network event or process exit to its transfer
    pub async fn handle_engine_message(&mut self, message: EngineMessage) -> Vec<Notification> {
        let owner = message.owner();
        let Some(transfer) = self.state.get_mut(&owner) else {
            debug!("Dropping engine message for unknown transfer {}", owner);
            return Vec::new();
        };
        transfer.handle_engine_message(message).await;
        self.drain(VecDeque::from([owner])).await
    }

    /// React to a connectivity change
    ///
    /// A current transfer that lost eligibility is suspended; an empty slot
    /// is filled. A running transfer is never preempted.
    pub async fn set_network_mode(&mut self, mode: NetworkMode) -> Vec<Notification> {
        if self.state.mode() == mode {
            return Vec::new();
        }
        info!("Network mode {} -> {}", self.state.mode(), mode);
        self.state.set_mode(mode);

        let mut worklist = VecDeque::new();
        self.update(&mut worklist).await;
        self.drain(worklist).await
    }

    /// Client acknowledged a finished or failed transfer
    pub async fn collected(&mut self, id: &TransferId) -> QueueResult<Vec<Notification>> {
        let state = self
            .state
            .get(id)
            .ok_or_else(|| QueueError::TransferNotFound { id: id.to_string() })?
            .state();
        if !matches!(state, TransferState::Uncollected | TransferState::Error) {
            return Err(QueueError::NotCollectable {
                id: id.to_string(),
                state: state.to_string(),
            });
        }
        if let Some(mut transfer) = self.state.remove(id) {
            transfer.release();
        }
        info!("Transfer {} collected", id);

        let mut worklist = VecDeque::new();
        self.update(&mut worklist).await;
        Ok(self.drain(worklist).await)
    }

    /// Close the open connection, keeping every transfer resumable
    pub async fn shutdown(&mut self) {
        if let Some(current) = self.state.current() {
            if let Some(transfer) = self.state.get_mut(&current) {
                transfer.suspend_transfer().await;
                transfer.take_events();
            }
        }
        self.state.set_current(None);
    }

    pub fn get(&self, id: &TransferId) -> Option<&Transfer> {
        self.state.get(id)
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.state.contains(id)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Ids in scheduling order
    pub fn ids(&self) -> Vec<TransferId> {
        self.state.ids().to_vec()
    }

    /// Transfers in scheduling order
    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.state.iter()
    }

    pub fn current(&self) -> Option<TransferId> {
        self.state.current()
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.state.mode()
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections()
    }

    fn notify(&self, id: &TransferId, event: &TransferEvent) {
        for observer in &self.observers {
            observer.on_event(id, event);
        }
    }

    /// Dispatch buffered events until no transfer has anything left to say
    async fn drain(&mut self, mut worklist: VecDeque<TransferId>) -> Vec<Notification> {
        let mut dispatched = Vec::new();
        while let Some(id) = worklist.pop_front() {
            let events = match self.state.get_mut(&id) {
                Some(transfer) => transfer.take_events(),
                None => continue,
            };
            for event in events {
                self.notify(&id, &event);
                let reaction = match &event {
                    TransferEvent::StateChanged(state) => Some(*state),
                    _ => None,
                };
                let mobile_changed = matches!(event, TransferEvent::MobileDataChanged(_));
                dispatched.push(Notification { id, event });

                if let Some(state) = reaction {
                    self.on_state_changed(id, state, &mut worklist, &mut dispatched)
                        .await;
                } else if mobile_changed {
                    self.update(&mut worklist).await;
                }
            }
        }
        dispatched
    }

    async fn on_state_changed(
        &mut self,
        id: TransferId,
        state: TransferState,
        worklist: &mut VecDeque<TransferId>,
        dispatched: &mut Vec<Notification>,
    ) {
        match state {
            TransferState::Start | TransferState::Resume => {
                if self.state.current().is_none() {
                    self.update(worklist).await;
                }
            }
            TransferState::Pause => {
                if let Some(transfer) = self.state.get_mut(&id) {
                    transfer.pause_transfer().await;
                    worklist.push_back(id);
                }
                if self.state.current() == Some(id) {
                    self.state.set_current(None);
                    self.update(worklist).await;
                }
            }
            TransferState::Cancel => {
                let Some(transfer) = self.state.get_mut(&id) else {
                    return;
                };
                transfer.cancel_transfer().await;
                let events = transfer.take_events();
                if let Some(mut transfer) = self.state.remove(&id) {
                    transfer.release();
                }
                for event in events {
                    self.notify(&id, &event);
                    dispatched.push(Notification { id, event });
                }
                self.update(worklist).await;
            }
            TransferState::Error | TransferState::Uncollected => {
                if self.state.current() == Some(id) {
                    self.state.set_current(None);
                    self.update(worklist).await;
                }
            }
            TransferState::Idle => {}
        }
    }

    /// Rescan the queue
    ///
    /// Keeps an eligible current transfer, suspends an ineligible one and
    /// admits the first waiting eligible transfer when the slot is free.
    async fn update(&mut self, worklist: &mut VecDeque<TransferId>) {
        if let Some(current) = self.state.current() {
            let active = self
                .state
                .get(&current)
                .map_or(false, |t| t.state().is_active());
            if active && self.state.is_eligible(&current) {
                return;
            }
            if active {
                info!(
                    "Suspending transfer {}: not allowed on {} network",
                    current,
                    self.state.mode()
                );
                if let Some(transfer) = self.state.get_mut(&current) {
                    transfer.suspend_transfer().await;
                }
                worklist.push_back(current);
            }
            self.state.set_current(None);
        }

        let Some(next) = self.state.next_candidate() else {
            debug!("No transfer waiting for a connection");
            return;
        };
        self.state.set_current(Some(next));
        if let Some(transfer) = self.state.get_mut(&next) {
            info!("Admitting transfer {}", next);
            match transfer.state() {
                TransferState::Resume => transfer.resume_transfer().await,
                _ => transfer.start_transfer().await,
            }
        }
        worklist.push_back(next);
    }
}
