//! Transfer queue with single-connection admission control
//!
//! Any number of transfers may be registered, but at most one of them, the
//! *current* transfer, holds a network connection at any time. Transfers
//! that asked to start wait in insertion order until the slot frees up and
//! the network allows them to run.
//!
//! # Features
//!
//! - **Single connection**: the earliest waiting transfer is admitted when
//!   the current one pauses, fails, finishes or is canceled
//! - **Mobile data policy**: transfers that do not allow metered networks
//!   are skipped, never removed, while the host is on a mobile connection
//! - **No preemption**: a better network never interrupts a running transfer
//! - **Observers**: every transfer event is delivered in order
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use download_manager::app::queue::{ClientRequest, TransferQueue};
//! use download_manager::app::network::NetworkMode;
//! use download_manager::app::transfer::{Transfer, TransferControl};
//!
//! # async fn example(transfer: Transfer) -> Result<(), Box<dyn std::error::Error>> {
//! let mut queue = TransferQueue::new(NetworkMode::Wlan);
//! let id = transfer.id();
//! queue.add(transfer).await?;
//!
//! for notification in queue.request(&id, ClientRequest::Start).await? {
//!     println!("{}: {:?}", notification.id, notification.event);
//! }
//! assert_eq!(queue.current(), Some(id));
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod state;

pub use core::{ClientRequest, Notification, TransferQueue};
pub use state::QueueState;
