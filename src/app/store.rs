//! Persistence of transfer records for restart recovery
//!
//! The manager writes a [`TransferRecord`] whenever a transfer changes in a
//! way that matters after a restart, and deletes it once the transfer is
//! canceled, failed or collected.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::app::transfer::{TransferId, TransferRecord};
use crate::constants::files;
use crate::errors::{StoreError, StoreResult};

/// Storage for persisted transfer records
#[async_trait]
pub trait MetadataStore: Send + Sync + fmt::Debug {
    async fn save(&self, record: &TransferRecord) -> StoreResult<()>;
    /// Removing a record that does not exist is not an error
    async fn remove(&self, id: &TransferId) -> StoreResult<()>;
    /// Every stored record, oldest first
    async fn load_all(&self) -> StoreResult<Vec<TransferRecord>>;
}

/// One pretty-printed JSON file per transfer inside a directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    directory: PathBuf,
}

impl JsonFileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, id: &TransferId) -> PathBuf {
        self.directory
            .join(format!("{}.{}", id.simple(), files::RECORD_EXTENSION))
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn save(&self, record: &TransferRecord) -> StoreResult<()> {
        fs::create_dir_all(&self.directory).await?;
        let content = serde_json::to_vec_pretty(record)?;
        let directory = self.directory.clone();
        let path = self.record_path(&record.id);

        // Write to a temp file in the same directory, then rename over the record
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&directory)?;
            temp.write_all(&content)?;
            temp.as_file().sync_all()?;
            temp.persist(&path)
                .map_err(|_| StoreError::Persist { path: path.clone() })?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        debug!("Saved record for transfer {}", record.id);
        Ok(())
    }

    async fn remove(&self, id: &TransferId) -> StoreResult<()> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => {
                debug!("Removed record for transfer {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> StoreResult<Vec<TransferRecord>> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(files::RECORD_EXTENSION) {
                continue;
            }
            let content = fs::read(&path).await?;
            match serde_json::from_slice::<TransferRecord>(&content) {
                Ok(record) => records.push(record),
                // One corrupt record must not block recovery of the others
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

/// In-process store for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<TransferId, TransferRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &TransferId) -> Option<TransferRecord> {
        self.guard().get(id).cloned()
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.guard().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<TransferId, TransferRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn save(&self, record: &TransferRecord) -> StoreResult<()> {
        self.guard().insert(record.id, record.clone());
        Ok(())
    }

    async fn remove(&self, id: &TransferId) -> StoreResult<()> {
        self.guard().remove(id);
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<TransferRecord>> {
        let mut records: Vec<_> = self.guard().values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}
