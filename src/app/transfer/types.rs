//! Shared transfer data types

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::app::hash::HashAlgorithm;
use crate::constants::metadata;

/// Client supplied request headers; order is irrelevant
pub type Headers = BTreeMap<String, String>;

/// Unique transfer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Compact form used in RPC object paths
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a transfer
///
/// `Uncollected` is the successful terminal state; the record stays alive
/// until the client acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    #[default]
    Idle,
    Start,
    Pause,
    Resume,
    Cancel,
    Uncollected,
    Error,
}

impl TransferState {
    /// Start or resume requested; the queue may give it a connection
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Start | Self::Resume)
    }

    /// No further network activity will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancel | Self::Uncollected | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Uncollected => "uncollected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key/value bag passed through to clients and commands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Explicit destination requested by an unconfined caller
    pub fn local_path(&self) -> Option<PathBuf> {
        self.get(metadata::LOCAL_PATH)
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    pub fn title(&self) -> Option<&str> {
        self.get(metadata::TITLE).and_then(Value::as_str)
    }

    pub fn indicator_shown(&self) -> bool {
        self.get(metadata::INDICATOR_SHOWN)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn click_package(&self) -> Option<&str> {
        self.get(metadata::CLICK_PACKAGE).and_then(Value::as_str)
    }

    /// True when `key` holds `value`, comparing strings by content
    pub fn matches(&self, key: &str, value: &str) -> bool {
        match self.get(key) {
            Some(Value::String(s)) => s == value,
            Some(other) => other.to_string() == value,
            None => false,
        }
    }
}

impl From<BTreeMap<String, Value>> for Metadata {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// Persisted description of a single transfer used for restart recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub caller_app_id: String,
    pub rpc_path: String,
    pub url: String,
    pub local_path: PathBuf,
    #[serde(default)]
    pub is_confined: bool,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    pub state: TransferState,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub throttle: u64,
    #[serde(default)]
    pub allow_mobile_data: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub headers: Headers,
    /// Orders restored transfers the way they were queued
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_helpers() {
        assert!(TransferState::Start.is_active());
        assert!(TransferState::Resume.is_active());
        assert!(!TransferState::Pause.is_active());
        assert!(TransferState::Uncollected.is_terminal());
        assert!(TransferState::Error.is_terminal());
        assert!(!TransferState::Idle.is_terminal());
        assert_eq!(TransferState::default(), TransferState::Idle);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&TransferState::Uncollected).unwrap();
        assert_eq!(json, "\"uncollected\"");
    }

    #[test]
    fn test_metadata_accessors() {
        let mut metadata = Metadata::new();
        metadata.insert("local-path", "/tmp/file.bin");
        metadata.insert("title", "My file");
        metadata.insert("indicator-shown", true);

        assert_eq!(metadata.local_path(), Some(PathBuf::from("/tmp/file.bin")));
        assert_eq!(metadata.title(), Some("My file"));
        assert!(metadata.indicator_shown());
        assert!(metadata.click_package().is_none());
        assert!(metadata.matches("title", "My file"));
        assert!(metadata.matches("indicator-shown", "true"));
        assert!(!metadata.matches("missing", "x"));
    }

    #[test]
    fn test_empty_local_path_is_ignored() {
        let mut metadata = Metadata::new();
        metadata.insert("local-path", "");
        assert!(metadata.local_path().is_none());
    }

    #[test]
    fn test_transfer_id_round_trip() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.simple().len(), 32);
    }
}
