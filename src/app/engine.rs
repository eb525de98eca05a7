//! Plumbing between transfers and the background tasks they start
//!
//! Transfers never block on the network or on child processes. They ask the
//! [`Engine`] to open a connection or hand it a process to watch, and the
//! resulting events come back as [`EngineMessage`]s on a single channel that
//! the manager loop drains. Every connection gets a fresh [`ConnectionId`];
//! transfers drop events from connections they no longer own.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::app::client::{HttpTransport, TransferRequest};
use crate::app::process::ProcessOutcome;
use crate::app::transfer::TransferId;
use crate::constants::channels;
use crate::errors::TransferError;

/// Identifier of one HTTP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a connection task reports
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Successful response headers arrived
    Headers {
        status: u16,
        /// Length of this response body, if announced
        content_length: Option<u64>,
        content_disposition: Option<String>,
        /// The server honoured the Range request (206)
        partial: bool,
    },
    /// Body bytes, in order
    Data(Bytes),
    /// The response points elsewhere; the task has ended
    Redirect(Url),
    /// Body fully received
    Finished,
    /// The exchange failed; the task has ended
    Failed(TransferError),
}

/// Message delivered to the manager loop
#[derive(Debug)]
pub enum EngineMessage {
    Network {
        /// Top-level transfer (the group for group children)
        owner: TransferId,
        connection: ConnectionId,
        event: NetworkEvent,
    },
    ProcessExited {
        owner: TransferId,
        /// Transfer whose command ran
        transfer: TransferId,
        outcome: ProcessOutcome,
    },
}

impl EngineMessage {
    pub fn owner(&self) -> TransferId {
        match self {
            Self::Network { owner, .. } | Self::ProcessExited { owner, .. } => *owner,
        }
    }
}

/// Sender half used by background tasks of one top-level transfer
#[derive(Debug, Clone)]
pub struct EngineSender {
    owner: TransferId,
    tx: mpsc::Sender<EngineMessage>,
}

impl EngineSender {
    pub fn owner(&self) -> TransferId {
        self.owner
    }

    /// Report a finished post-download command
    pub async fn process_exited(&self, transfer: TransferId, outcome: ProcessOutcome) {
        let message = EngineMessage::ProcessExited {
            owner: self.owner,
            transfer,
            outcome,
        };
        if self.tx.send(message).await.is_err() {
            debug!("Engine channel closed before process exit of {}", transfer);
        }
    }
}

/// Everything a connection task needs to report back
#[derive(Debug)]
pub struct ConnectionSink {
    owner: TransferId,
    connection: ConnectionId,
    tx: mpsc::Sender<EngineMessage>,
    throttle: watch::Receiver<u64>,
}

impl ConnectionSink {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Deliver an event; false once nobody listens any more
    pub async fn send(&self, event: NetworkEvent) -> bool {
        self.tx
            .send(EngineMessage::Network {
                owner: self.owner,
                connection: self.connection,
                event,
            })
            .await
            .is_ok()
    }

    /// Live throttle in bytes per second, 0 meaning unlimited
    pub fn throttle(&self) -> watch::Receiver<u64> {
        self.throttle.clone()
    }
}

/// Owning handle of an open connection
///
/// Dropping the handle aborts the connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    task: JoinHandle<()>,
    throttle: watch::Sender<u64>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Apply a new throttle to the running connection
    pub fn set_throttle(&self, bytes_per_sec: u64) {
        self.throttle.send_replace(bytes_per_sec);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connection factory and message channel shared by all transfers
#[derive(Clone)]
pub struct Engine {
    transport: Arc<dyn HttpTransport>,
    tx: mpsc::Sender<EngineMessage>,
    next_connection: Arc<AtomicU64>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("transport", &self.transport)
            .field("next_connection", &self.next_connection)
            .finish()
    }
}

impl Engine {
    /// Create the engine and the receiver the manager loop drains
    pub fn new(transport: Arc<dyn HttpTransport>) -> (Self, mpsc::Receiver<EngineMessage>) {
        let (tx, rx) = mpsc::channel(channels::ENGINE_BUFFER);
        let engine = Self {
            transport,
            tx,
            next_connection: Arc::new(AtomicU64::new(1)),
        };
        (engine, rx)
    }

    /// Start an HTTP exchange on behalf of `owner`
    pub fn open(&self, owner: TransferId, request: TransferRequest, throttle: u64) -> ConnectionHandle {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (throttle_tx, throttle_rx) = watch::channel(throttle);
        debug!(
            "Opening connection {} for {} to {} (range {:?})",
            id, owner, request.url, request.range_start
        );
        let sink = ConnectionSink {
            owner,
            connection: id,
            tx: self.tx.clone(),
            throttle: throttle_rx,
        };
        let task = self.transport.open(request, sink);
        ConnectionHandle {
            id,
            task,
            throttle: throttle_tx,
        }
    }

    pub fn sender(&self, owner: TransferId) -> EngineSender {
        EngineSender {
            owner,
            tx: self.tx.clone(),
        }
    }
}
