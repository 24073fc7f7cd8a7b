//! Transfer State Persistor
//!
//! Layout in the key/value store:
//! - `TRANSFER_{id}` → JSON object of the transfer
//! - `TRANSFER_INDEX` → JSON array of live transfer ids
//!
//! Read-modify-writes are only performed under the global state lock, so
//! the store needs no transactions of its own.

use std::sync::Arc;

use tracing::warn;

use super::error::TransferError;
use super::store::{KvStore, StoreError};
use super::types::{Transfer, TransferId};

const INDEX_KEY: &str = "TRANSFER_INDEX";

fn transfer_key(id: &str) -> String {
    format!("TRANSFER_{}", id)
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::Storage(e.to_string())
    }
}

#[derive(Clone)]
pub struct StatePersistor {
    store: Arc<dyn KvStore>,
}

impl StatePersistor {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &TransferId) -> Result<Transfer, TransferError> {
        let raw = self
            .store
            .get(&transfer_key(&id.to_string()))
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(id.to_string()))?;
        Ok(Transfer::from_json(&raw)?)
    }

    /// Resolve the transfer owning `channel_id` in any of its three roles
    pub async fn get_by_channel(&self, channel_id: &str) -> Result<Transfer, TransferError> {
        self.list()
            .await?
            .into_iter()
            .find(|t| t.involves(channel_id))
            .ok_or_else(|| TransferError::TransferNotFound(format!("channel {}", channel_id)))
    }

    pub async fn upsert(&self, transfer: &Transfer) -> Result<(), TransferError> {
        let id = transfer.id.to_string();
        self.store
            .set(&transfer_key(&id), &transfer.to_json()?)
            .await?;

        let mut index = self.index().await?;
        if !index.contains(&id) {
            index.push(id);
            self.write_index(&index).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &TransferId) -> Result<(), TransferError> {
        let id = id.to_string();
        self.store.delete(&transfer_key(&id)).await?;

        let mut index = self.index().await?;
        let before = index.len();
        index.retain(|entry| entry != &id);
        if index.len() != before {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Transfer>, TransferError> {
        let mut transfers = Vec::new();
        for id in self.index().await? {
            match self.store.get(&transfer_key(&id)).await? {
                Some(raw) => transfers.push(Transfer::from_json(&raw)?),
                None => warn!(transfer_id = %id, "Indexed transfer missing from store"),
            }
        }
        Ok(transfers)
    }

    async fn index(&self) -> Result<Vec<String>, TransferError> {
        match self.store.get(INDEX_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, index: &[String]) -> Result<(), TransferError> {
        self.store
            .set(INDEX_KEY, &serde_json::to_string(index)?)
            .await?;
        Ok(())
    }
}
