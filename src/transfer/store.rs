//! Key/value backends for transfer state
//!
//! - [`FileKvStore`]: embedded durable store, survives restarts of both this
//!   service and the switch
//! - [`SwitchVarStore`]: the switch's global variable facility, lives as long
//!   as the switch process
//! - [`MemoryKvStore`]: process-local, for tests and throwaway setups

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::switch::{SwitchClient, SwitchError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Switch store error: {0}")]
    Switch(#[from] SwitchError),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ============================================================
// File store
// ============================================================

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    format_version: u32,
    checksum: String,
    entries: BTreeMap<String, String>,
}

/// Whole-document JSON store
///
/// Every write rewrites the document to `<path>.tmp` and renames it over
/// `<path>`, so a crash leaves either the old or the new document.
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKvStore {
    /// Open the store, loading and verifying an existing document
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => Self::decode(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), keys = entries.len(), "Opened transfer store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn decode(raw: &[u8]) -> Result<BTreeMap<String, String>, StoreError> {
        let snapshot: StoreSnapshot =
            serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if snapshot.format_version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported format version {}",
                snapshot.format_version
            )));
        }
        let calculated = checksum(&snapshot.entries)?;
        if calculated != snapshot.checksum {
            return Err(StoreError::Corrupt(format!(
                "checksum mismatch: expected {}, got {}",
                snapshot.checksum, calculated
            )));
        }
        Ok(snapshot.entries)
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let snapshot = StoreSnapshot {
            format_version: FORMAT_VERSION,
            checksum: checksum(entries)?,
            entries: entries.clone(),
        };
        let bytes =
            serde_json::to_vec(&snapshot).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), keys = entries.len(), "Store flushed");
        Ok(())
    }
}

fn checksum(entries: &BTreeMap<String, String>) -> Result<String, StoreError> {
    use crc::{CRC_64_ECMA_182, Crc};

    const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
    let bytes = serde_json::to_vec(entries).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(format!("{:016x}", CRC64.checksum(&bytes)))
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }
}

// ============================================================
// Switch global variables
// ============================================================

pub struct SwitchVarStore {
    switch: Arc<dyn SwitchClient>,
}

impl SwitchVarStore {
    pub fn new(switch: Arc<dyn SwitchClient>) -> Self {
        Self { switch }
    }
}

#[async_trait]
impl KvStore for SwitchVarStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.switch.get_global_var(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(self.switch.set_global_var(key, value).await?)
    }

    /// The switch has no delete; an empty value reads back as absent
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.switch.set_global_var(key, "").await?)
    }
}

// ============================================================
// Memory
// ============================================================

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
