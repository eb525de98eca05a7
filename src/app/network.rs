//! Connectivity state and mobile-data eligibility
//!
//! The queue asks one question of the network: may this transfer use the
//! connection we have right now? Mode changes arrive through a `watch`
//! channel published by a [`ConnectivityProbe`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Kind of network the host is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Unknown,
    Offline,
    Ethernet,
    Wlan,
    Bluetooth,
    Mobile2G,
    Mobile3G,
    Mobile4G,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Ethernet => "ethernet",
            Self::Wlan => "wlan",
            Self::Bluetooth => "bluetooth",
            Self::Mobile2G => "mobile2g",
            Self::Mobile3G => "mobile3g",
            Self::Mobile4G => "mobile4g",
        }
    }

    pub fn is_online(&self) -> bool {
        *self != Self::Offline
    }

    /// Metered connection, or one we cannot prove is unmetered
    pub fn is_mobile(&self) -> bool {
        matches!(
            self,
            Self::Unknown | Self::Mobile2G | Self::Mobile3G | Self::Mobile4G
        )
    }

    /// Whether a transfer with the given policy may hold a connection
    pub fn can_transfer(&self, allow_mobile_data: bool) -> bool {
        match self {
            Self::Offline => false,
            mode if mode.is_mobile() => allow_mobile_data,
            _ => true,
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of connectivity changes
pub trait ConnectivityProbe: Send + Sync + fmt::Debug {
    fn current(&self) -> NetworkMode;
    fn subscribe(&self) -> watch::Receiver<NetworkMode>;
}

/// Probe whose mode is set by its owner
///
/// Used when the host offers no connectivity service, and in tests.
#[derive(Debug, Clone)]
pub struct ManualProbe {
    tx: Arc<watch::Sender<NetworkMode>>,
}

impl ManualProbe {
    pub fn new(mode: NetworkMode) -> Self {
        let (tx, _rx) = watch::channel(mode);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_mode(&self, mode: NetworkMode) {
        let previous = self.tx.send_replace(mode);
        if previous != mode {
            info!("Network mode changed from {} to {}", previous, mode);
        }
    }
}

impl Default for ManualProbe {
    fn default() -> Self {
        Self::new(NetworkMode::Unknown)
    }
}

impl ConnectivityProbe for ManualProbe {
    fn current(&self) -> NetworkMode {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkMode> {
        self.tx.subscribe()
    }
}
