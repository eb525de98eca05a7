//! Core of the download manager
//!
//! This module contains the transfer engine and the service around it:
//! the HTTP transport, per-transfer state machines, checksum verification,
//! post-download commands, the admission queue and restart persistence.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use download_manager::app::{
//!     ClientConfig, DownloadManager, DownloadRequest, ManagerConfig, ManualProbe, MemoryStore,
//!     NetworkMode, ReqwestTransport, StaticResolver,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = ReqwestTransport::from_config(&ClientConfig::default())?;
//! let probe = ManualProbe::new(NetworkMode::Ethernet);
//! let (manager, _task) = DownloadManager::spawn(
//!     ManagerConfig::default(),
//!     Arc::new(transport),
//!     Arc::new(StaticResolver::unconfined("/tmp/downloads")),
//!     Arc::new(MemoryStore::new()),
//!     &probe,
//! );
//!
//! let download = manager
//!     .create_download("example", DownloadRequest::new("https://example.com/file.iso"))
//!     .await?;
//! download.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod confinement;
pub mod engine;
pub mod factory;
pub mod hash;
pub mod manager;
pub mod network;
pub mod process;
pub mod queue;
pub mod store;
pub mod transfer;

// Re-export main public API
pub use client::{ClientConfig, HttpTransport, ReqwestTransport};
pub use confinement::{ConfinementResolver, SecurityDetails, StaticResolver, TransferKind};
pub use factory::{DownloadRequest, GroupRequest, TransferDefaults, TransferFactory};
pub use hash::HashAlgorithm;
pub use manager::{DownloadManager, ManagerConfig, ManagerHandle, TransferHandle, TransferInfo};
pub use network::{ConnectivityProbe, ManualProbe, NetworkMode};
pub use queue::{ClientRequest, Notification, TransferQueue};
pub use store::{JsonFileStore, MemoryStore, MetadataStore};
pub use transfer::{
    GroupItem, Metadata, Transfer, TransferControl, TransferEvent, TransferId, TransferRecord,
    TransferState,
};
