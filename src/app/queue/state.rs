//! Internal state of the transfer queue
//!
//! Holds the registered transfers, their scheduling order and the single
//! current slot. No I/O happens here; [`super::TransferQueue`] drives the
//! transfers and consults this state for every decision.

use std::collections::HashMap;

use tracing::debug;

use crate::app::network::NetworkMode;
use crate::app::transfer::{Transfer, TransferControl, TransferId};
use crate::errors::{QueueError, QueueResult};

/// Registered transfers and admission state
#[derive(Debug)]
pub struct QueueState {
    /// All transfers indexed by id
    transfers: HashMap<TransferId, Transfer>,
    /// Insertion order; earlier entries are scheduled first
    order: Vec<TransferId>,
    /// Transfer allowed to hold the connection
    current: Option<TransferId>,
    mode: NetworkMode,
}

impl QueueState {
    pub fn new(mode: NetworkMode) -> Self {
        Self {
            transfers: HashMap::new(),
            order: Vec::new(),
            current: None,
            mode,
        }
    }

    pub fn insert(&mut self, transfer: Transfer) -> QueueResult<()> {
        let id = transfer.id();
        if self.transfers.contains_key(&id) {
            return Err(QueueError::DuplicateTransfer { id: id.to_string() });
        }
        self.transfers.insert(id, transfer);
        self.order.push(id);
        debug!("Queued transfer {} ({} total)", id, self.order.len());
        Ok(())
    }

    pub fn remove(&mut self, id: &TransferId) -> Option<Transfer> {
        let transfer = self.transfers.remove(id)?;
        self.order.retain(|queued| queued != id);
        if self.current == Some(*id) {
            self.current = None;
        }
        debug!("Removed transfer {} from queue", id);
        Some(transfer)
    }

    pub fn get(&self, id: &TransferId) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    pub fn get_mut(&mut self, id: &TransferId) -> Option<&mut Transfer> {
        self.transfers.get_mut(id)
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.transfers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids in scheduling order
    pub fn ids(&self) -> &[TransferId] {
        &self.order
    }

    /// Transfers in scheduling order
    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.order.iter().filter_map(|id| self.transfers.get(id))
    }

    pub fn current(&self) -> Option<TransferId> {
        self.current
    }

    pub fn set_current(&mut self, current: Option<TransferId>) {
        if self.current != current {
            debug!("Current transfer {:?} -> {:?}", self.current, current);
            self.current = current;
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: NetworkMode) {
        self.mode = mode;
    }

    /// Whether the network allows `id` to hold a connection right now
    pub fn is_eligible(&self, id: &TransferId) -> bool {
        self.transfers
            .get(id)
            .map_or(false, |t| self.mode.can_transfer(t.is_mobile_download_allowed()))
    }

    /// First transfer waiting for a connection that may have one
    pub fn next_candidate(&self) -> Option<TransferId> {
        self.order.iter().copied().find(|id| {
            self.transfers
                .get(id)
                .map_or(false, |t| t.state().is_active())
                && self.is_eligible(id)
        })
    }

    /// Number of transfers holding an open connection
    pub fn open_connections(&self) -> usize {
        self.transfers.values().filter(|t| t.has_connection()).count()
    }
}
