//! Message Bus
//!
//! Topic-routed publish/subscribe seam. The transport itself lives outside
//! this crate: [`BusPublisher`] is what the engine publishes through, and
//! [`BusEvent`] is what it consumes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Bus publish failed: {0}")]
    Publish(String),
}

/// Outbound bus message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMessage {
    /// Event name, e.g. `transfer_answered`
    pub name: String,
    pub routing_key: String,
    /// Routing/ACL headers
    pub headers: BTreeMap<String, serde_json::Value>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;
}

/// In-process bus backed by a broadcast channel
///
/// Publishing with no subscriber attached is not an error.
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl BusPublisher for LocalBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        debug!(name = %message.name, routing_key = %message.routing_key, "Publishing bus event");
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Payload of the inbound `transfer_created` event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateTransferPayload {
    pub transferred_call: String,
    pub initiator_call: String,
    pub context: String,
    pub exten: String,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<u32>,
}

/// Inbound bus events consumed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    TransferCreated(CreateTransferPayload),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transfer_created() {
        let raw = r#"{
            "name": "transfer_created",
            "data": {
                "transferred_call": "a",
                "initiator_call": "b",
                "context": "default",
                "exten": "1002",
                "flow": "blind"
            }
        }"#;
        let BusEvent::TransferCreated(payload) = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.transferred_call, "a");
        assert_eq!(payload.flow.as_deref(), Some("blind"));
        assert!(payload.variables.is_empty());
        assert_eq!(payload.timeout, None);
    }

    #[tokio::test]
    async fn test_local_bus_delivers_to_subscriber() {
        let bus = LocalBus::new(8);
        let mut rx = bus.subscribe();
        let msg = BusMessage {
            name: "transfer_created".into(),
            routing_key: "calls.transfer.created".into(),
            headers: BTreeMap::new(),
            payload: serde_json::json!({"id": "x"}),
        };
        bus.publish(msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_local_bus_without_subscriber() {
        let bus = LocalBus::new(8);
        let msg = BusMessage {
            name: "transfer_ended".into(),
            routing_key: "calls.transfer.ended".into(),
            headers: BTreeMap::new(),
            payload: serde_json::Value::Null,
        };
        assert!(bus.publish(msg).await.is_ok());
    }
}
