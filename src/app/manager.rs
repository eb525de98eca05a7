//! Download manager service
//!
//! A single task owns the queue and everything it touches. Client calls,
//! engine messages and connectivity changes are funnelled into one
//! `select!` loop so each handler runs to completion before the next.
//! [`ManagerHandle`] and [`TransferHandle`] are the cheap, cloneable
//! client side of that loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::client::HttpTransport;
use crate::app::confinement::ConfinementResolver;
use crate::app::engine::{Engine, EngineMessage};
use crate::app::factory::{DownloadRequest, GroupRequest, TransferDefaults, TransferFactory};
use crate::app::network::{ConnectivityProbe, NetworkMode};
use crate::app::queue::{ClientRequest, Notification, TransferQueue};
use crate::app::store::MetadataStore;
use crate::app::transfer::{
    FileTransfer, Metadata, PathLocks, Transfer, TransferControl, TransferEvent, TransferId,
    TransferObserver, TransferState,
};
use crate::constants::{channels, MAX_REDIRECTS};
use crate::errors::{QueueError, QueueResult, Result, TransferError};

/// Runtime settings of the manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory new downloads are written to
    pub download_root: PathBuf,
    /// Bytes per second for new transfers, 0 meaning unlimited
    pub default_throttle: u64,
    pub allow_mobile_data: bool,
    pub max_redirects: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("."),
            default_throttle: 0,
            allow_mobile_data: true,
            max_redirects: MAX_REDIRECTS,
        }
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub id: TransferId,
    pub rpc_path: String,
    pub caller_app_id: String,
    pub state: TransferState,
    pub received: u64,
    pub total: u64,
    pub throttle: u64,
    pub allow_mobile_data: bool,
    pub metadata: Metadata,
    /// Destination of a single download
    pub local_path: Option<PathBuf>,
    /// Files a group has finished so far
    pub files: Vec<PathBuf>,
    pub is_group: bool,
    pub last_error: Option<TransferError>,
}

impl TransferInfo {
    fn of(transfer: &Transfer) -> Self {
        let (received, total) = transfer.progress();
        let (caller_app_id, local_path, files, last_error) = match transfer {
            Transfer::File(t) => (
                t.caller_app_id().to_string(),
                Some(t.local_path().to_path_buf()),
                Vec::new(),
                t.last_error().cloned(),
            ),
            Transfer::Group(g) => (
                g.caller_app_id().to_string(),
                None,
                g.finished_paths().to_vec(),
                g.last_error().cloned(),
            ),
        };
        Self {
            id: transfer.id(),
            rpc_path: transfer.rpc_path().to_string(),
            caller_app_id,
            state: transfer.state(),
            received,
            total,
            throttle: transfer.throttle(),
            allow_mobile_data: transfer.is_mobile_download_allowed(),
            metadata: transfer.metadata().clone(),
            local_path,
            files,
            is_group: transfer.is_group(),
            last_error,
        }
    }
}

type Created = (TransferId, String);

#[derive(Debug)]
enum Command {
    CreateDownload {
        caller: String,
        request: DownloadRequest,
        reply: oneshot::Sender<Result<Created>>,
    },
    CreateGroup {
        caller: String,
        request: GroupRequest,
        reply: oneshot::Sender<Result<Created>>,
    },
    Request {
        id: TransferId,
        request: ClientRequest,
        reply: oneshot::Sender<QueueResult<()>>,
    },
    Collected {
        id: TransferId,
        reply: oneshot::Sender<QueueResult<()>>,
    },
    Info {
        id: TransferId,
        reply: oneshot::Sender<QueueResult<TransferInfo>>,
    },
    List {
        filter: Option<(String, String)>,
        reply: oneshot::Sender<Vec<Created>>,
    },
    SetDefaultThrottle {
        bytes_per_sec: u64,
        reply: oneshot::Sender<()>,
    },
    SetAllowMobileDataDefault {
        allowed: bool,
        reply: oneshot::Sender<()>,
    },
    Defaults {
        reply: oneshot::Sender<TransferDefaults>,
    },
    Restore {
        reply: oneshot::Sender<Result<Vec<Created>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

async fn call<T>(
    tx: &mpsc::Sender<Command>,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> QueueResult<T> {
    let (reply, rx) = oneshot::channel();
    tx.send(command(reply))
        .await
        .map_err(|_| QueueError::ChannelClosed)?;
    rx.await.map_err(|_| QueueError::ChannelClosed)
}

/// Forwards queue events to broadcast subscribers
struct BroadcastObserver {
    tx: broadcast::Sender<Notification>,
}

impl TransferObserver for BroadcastObserver {
    fn on_event(&self, id: &TransferId, event: &TransferEvent) {
        // No subscribers is fine
        let _ = self.tx.send(Notification {
            id: *id,
            event: event.clone(),
        });
    }
}

/// What a batch of notifications means for the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    Save,
    Remove,
}

/// The service task
pub struct DownloadManager {
    queue: TransferQueue,
    factory: TransferFactory,
    store: Arc<dyn MetadataStore>,
    commands: mpsc::Receiver<Command>,
    engine_rx: mpsc::Receiver<EngineMessage>,
    connectivity: watch::Receiver<NetworkMode>,
}

impl DownloadManager {
    /// Start the service on the current runtime
    pub fn spawn(
        config: ManagerConfig,
        transport: Arc<dyn HttpTransport>,
        resolver: Arc<dyn ConfinementResolver>,
        store: Arc<dyn MetadataStore>,
        probe: &dyn ConnectivityProbe,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (engine, engine_rx) = Engine::new(transport);
        let defaults = TransferDefaults {
            throttle: config.default_throttle,
            allow_mobile_data: config.allow_mobile_data,
        };
        let factory = TransferFactory::new(
            engine,
            PathLocks::new(),
            resolver,
            defaults,
            config.max_redirects,
        );

        let mut connectivity = probe.subscribe();
        let mode = *connectivity.borrow_and_update();
        let (notifications, _) = broadcast::channel(channels::NOTIFICATION_BUFFER);
        let mut queue = TransferQueue::new(mode);
        queue.add_observer(Arc::new(BroadcastObserver {
            tx: notifications.clone(),
        }));

        let (tx, commands) = mpsc::channel(channels::COMMAND_BUFFER);
        let manager = Self {
            queue,
            factory,
            store,
            commands,
            engine_rx,
            connectivity,
        };
        info!(
            "Starting download manager in {} ({} network)",
            config.download_root.display(),
            mode
        );
        let task = tokio::spawn(manager.run());
        (ManagerHandle { tx, notifications }, task)
    }

    async fn run(mut self) {
        let mut connectivity_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = self.engine_rx.recv() => {
                    let notifications = self.queue.handle_engine_message(message).await;
                    self.persist(&notifications).await;
                }
                changed = self.connectivity.changed(), if connectivity_open => match changed {
                    Ok(()) => {
                        let mode = *self.connectivity.borrow_and_update();
                        let notifications = self.queue.set_network_mode(mode).await;
                        self.persist(&notifications).await;
                    }
                    Err(_) => {
                        debug!("Connectivity probe went away, keeping {}", self.queue.network_mode());
                        connectivity_open = false;
                    }
                },
            }
        }
        info!("Download manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateDownload {
                caller,
                request,
                reply,
            } => {
                let result = match self.factory.create_download(&caller, request) {
                    Ok(transfer) => {
                        let record = transfer.record();
                        if let Err(e) = self.store.save(&record).await {
                            warn!("Failed to persist transfer {}: {}", record.id, e);
                        }
                        self.enqueue(transfer.into()).await
                    }
                    Err(e) => {
                        warn!("Rejected download from {}: {}", caller, e);
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Command::CreateGroup {
                caller,
                request,
                reply,
            } => {
                let result = match self.factory.create_group(&caller, request) {
                    Ok(group) => self.enqueue(group.into()).await,
                    Err(e) => {
                        warn!("Rejected download group from {}: {}", caller, e);
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Command::Request { id, request, reply } => {
                let result = match self.queue.request(&id, request).await {
                    Ok(notifications) => {
                        self.persist(&notifications).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Collected { id, reply } => {
                let result = match self.queue.collected(&id).await {
                    Ok(notifications) => {
                        self.remove_record(&id).await;
                        self.persist(&notifications).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Info { id, reply } => {
                let info = self
                    .queue
                    .get(&id)
                    .map(TransferInfo::of)
                    .ok_or_else(|| QueueError::TransferNotFound { id: id.to_string() });
                let _ = reply.send(info);
            }
            Command::List { filter, reply } => {
                let handles = self
                    .queue
                    .iter()
                    .filter(|t| match &filter {
                        Some((key, value)) => t.metadata().matches(key, value),
                        None => true,
                    })
                    .map(|t| (t.id(), t.rpc_path().to_string()))
                    .collect();
                let _ = reply.send(handles);
            }
            Command::SetDefaultThrottle {
                bytes_per_sec,
                reply,
            } => {
                info!("Default throttle set to {} bytes/s", bytes_per_sec);
                self.factory.set_default_throttle(bytes_per_sec);
                for id in self.queue.ids() {
                    let request = ClientRequest::SetThrottle(bytes_per_sec);
                    if let Ok(notifications) = self.queue.request(&id, request).await {
                        self.persist(&notifications).await;
                    }
                }
                let _ = reply.send(());
            }
            Command::SetAllowMobileDataDefault { allowed, reply } => {
                self.factory.set_allow_mobile_data_default(allowed);
                let _ = reply.send(());
            }
            Command::Defaults { reply } => {
                let _ = reply.send(self.factory.defaults());
            }
            Command::Restore { reply } => {
                let result = self.restore().await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                // Handled by the loop; answer anyway
                let _ = reply.send(());
            }
        }
    }

    async fn enqueue(&mut self, transfer: Transfer) -> Result<Created> {
        let created = (transfer.id(), transfer.rpc_path().to_string());
        let notifications = self.queue.add(transfer).await?;
        self.persist(&notifications).await;
        Ok(created)
    }

    /// Bring back every stored transfer
    async fn restore(&mut self) -> Result<Vec<Created>> {
        let records = self.store.load_all().await?;
        let mut restored = Vec::new();
        for record in records {
            let id = record.id;
            if self.queue.contains(&id) {
                debug!("Transfer {} is already queued", id);
                continue;
            }
            if matches!(record.state, TransferState::Cancel | TransferState::Error) {
                debug!("Discarding record of {} in state {}", id, record.state);
                self.remove_record(&id).await;
                continue;
            }
            let transfer = FileTransfer::restore(
                record,
                self.factory.engine().clone(),
                self.factory.locks().clone(),
                self.factory.max_redirects(),
            )
            .await;
            match transfer {
                Ok(transfer) => match self.enqueue(transfer.into()).await {
                    Ok(created) => restored.push(created),
                    Err(e) => warn!("Could not queue restored transfer {}: {}", id, e),
                },
                Err(e) => {
                    warn!("Dropping unrestorable record {}: {}", id, e);
                    self.remove_record(&id).await;
                }
            }
        }
        info!("Restored {} transfer(s)", restored.len());
        Ok(restored)
    }

    async fn shutdown(&mut self) {
        info!("Shutting down with {} transfer(s) queued", self.queue.len());
        self.queue.shutdown().await;
    }

    /// Mirror a batch of notifications into the metadata store
    async fn persist(&self, notifications: &[Notification]) {
        let mut pending: HashMap<TransferId, Persist> = HashMap::new();
        for notification in notifications {
            let action = match &notification.event {
                TransferEvent::StateChanged(TransferState::Cancel | TransferState::Error) => {
                    Persist::Remove
                }
                TransferEvent::StateChanged(_)
                | TransferEvent::ThrottleChanged(_)
                | TransferEvent::MobileDataChanged(_) => Persist::Save,
                _ => continue,
            };
            pending.insert(notification.id, action);
        }

        for (id, action) in pending {
            match action {
                Persist::Remove => self.remove_record(&id).await,
                Persist::Save => {
                    let Some(record) = self.queue.get(&id).and_then(Transfer::record) else {
                        continue;
                    };
                    if let Err(e) = self.store.save(&record).await {
                        warn!("Failed to persist transfer {}: {}", id, e);
                    }
                }
            }
        }
    }

    async fn remove_record(&self, id: &TransferId) {
        if let Err(e) = self.store.remove(id).await {
            warn!("Failed to remove record of {}: {}", id, e);
        }
    }
}

/// Client side of the manager
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl ManagerHandle {
    fn handle(&self, (id, rpc_path): Created) -> TransferHandle {
        TransferHandle {
            id,
            rpc_path,
            tx: self.tx.clone(),
        }
    }

    /// Validate and queue a single download in the IDLE state
    pub async fn create_download(
        &self,
        caller: &str,
        request: DownloadRequest,
    ) -> Result<TransferHandle> {
        let caller = caller.to_string();
        let created = call(&self.tx, |reply| Command::CreateDownload {
            caller,
            request,
            reply,
        })
        .await??;
        Ok(self.handle(created))
    }

    /// Validate and queue a group of downloads in the IDLE state
    pub async fn create_download_group(
        &self,
        caller: &str,
        request: GroupRequest,
    ) -> Result<TransferHandle> {
        let caller = caller.to_string();
        let created = call(&self.tx, |reply| Command::CreateGroup {
            caller,
            request,
            reply,
        })
        .await??;
        Ok(self.handle(created))
    }

    pub async fn get_all_downloads(&self) -> QueueResult<Vec<TransferHandle>> {
        let all = call(&self.tx, |reply| Command::List {
            filter: None,
            reply,
        })
        .await?;
        Ok(all.into_iter().map(|c| self.handle(c)).collect())
    }

    /// Transfers whose metadata holds `value` under `key`
    pub async fn get_all_downloads_with_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> QueueResult<Vec<TransferHandle>> {
        let filter = Some((key.to_string(), value.to_string()));
        let matching = call(&self.tx, |reply| Command::List { filter, reply }).await?;
        Ok(matching.into_iter().map(|c| self.handle(c)).collect())
    }

    /// Throttle for new transfers; also applied to the existing ones
    pub async fn set_default_throttle(&self, bytes_per_sec: u64) -> QueueResult<()> {
        call(&self.tx, |reply| Command::SetDefaultThrottle {
            bytes_per_sec,
            reply,
        })
        .await
    }

    pub async fn default_throttle(&self) -> QueueResult<u64> {
        let defaults = call(&self.tx, |reply| Command::Defaults { reply }).await?;
        Ok(defaults.throttle)
    }

    pub async fn allow_mobile_data_default(&self) -> QueueResult<bool> {
        let defaults = call(&self.tx, |reply| Command::Defaults { reply }).await?;
        Ok(defaults.allow_mobile_data)
    }

    pub async fn set_allow_mobile_data_default(&self, allowed: bool) -> QueueResult<()> {
        call(&self.tx, |reply| Command::SetAllowMobileDataDefault { allowed, reply }).await
    }

    /// Rehydrate persisted transfers; active ones are rescheduled
    pub async fn restore(&self) -> Result<Vec<TransferHandle>> {
        let restored = call(&self.tx, |reply| Command::Restore { reply }).await??;
        Ok(restored.into_iter().map(|c| self.handle(c)).collect())
    }

    /// Every event of every transfer from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Close the open connection and stop the service
    pub async fn shutdown(&self) -> QueueResult<()> {
        call(&self.tx, |reply| Command::Shutdown { reply }).await
    }
}

/// Client side of one transfer or group
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: TransferId,
    rpc_path: String,
    tx: mpsc::Sender<Command>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn rpc_path(&self) -> &str {
        &self.rpc_path
    }

    async fn request(&self, request: ClientRequest) -> QueueResult<()> {
        let id = self.id;
        call(&self.tx, |reply| Command::Request { id, request, reply }).await?
    }

    pub async fn start(&self) -> QueueResult<()> {
        self.request(ClientRequest::Start).await
    }

    pub async fn pause(&self) -> QueueResult<()> {
        self.request(ClientRequest::Pause).await
    }

    pub async fn resume(&self) -> QueueResult<()> {
        self.request(ClientRequest::Resume).await
    }

    pub async fn cancel(&self) -> QueueResult<()> {
        self.request(ClientRequest::Cancel).await
    }

    pub async fn allow_mobile_download(&self, allowed: bool) -> QueueResult<()> {
        self.request(ClientRequest::AllowMobileData(allowed)).await
    }

    pub async fn set_throttle(&self, bytes_per_sec: u64) -> QueueResult<()> {
        self.request(ClientRequest::SetThrottle(bytes_per_sec)).await
    }

    /// Acknowledge a finished or failed transfer and free its record
    pub async fn collected(&self) -> QueueResult<()> {
        let id = self.id;
        call(&self.tx, |reply| Command::Collected { id, reply }).await?
    }

    pub async fn info(&self) -> QueueResult<TransferInfo> {
        let id = self.id;
        call(&self.tx, |reply| Command::Info { id, reply }).await?
    }

    pub async fn is_mobile_download_allowed(&self) -> QueueResult<bool> {
        Ok(self.info().await?.allow_mobile_data)
    }

    pub async fn throttle(&self) -> QueueResult<u64> {
        Ok(self.info().await?.throttle)
    }

    /// `(received, total)` bytes
    pub async fn progress(&self) -> QueueResult<(u64, u64)> {
        let info = self.info().await?;
        Ok((info.received, info.total))
    }

    pub async fn total_size(&self) -> QueueResult<u64> {
        Ok(self.info().await?.total)
    }

    pub async fn metadata(&self) -> QueueResult<Metadata> {
        Ok(self.info().await?.metadata)
    }

    pub async fn state(&self) -> QueueResult<TransferState> {
        Ok(self.info().await?.state)
    }
}
