//! Transfer Notifier
//!
//! One bus event per lifecycle milestone, scoped to the initiator's user and
//! tenant for downstream routing and ACLs.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use super::types::Transfer;
use crate::bus::{BusMessage, BusPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Created,
    Updated,
    Answered,
    Completed,
    Cancelled,
    Abandoned,
    Ended,
}

impl Milestone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::Created => "created",
            Milestone::Updated => "updated",
            Milestone::Answered => "answered",
            Milestone::Completed => "completed",
            Milestone::Cancelled => "cancelled",
            Milestone::Abandoned => "abandoned",
            Milestone::Ended => "ended",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn BusPublisher>,
}

impl Notifier {
    pub fn new(bus: Arc<dyn BusPublisher>) -> Self {
        Self { bus }
    }

    pub fn message(milestone: Milestone, transfer: &Transfer) -> BusMessage {
        let mut headers = BTreeMap::new();
        headers.insert(
            "tenant_uuid".to_string(),
            serde_json::Value::String(transfer.initiator_tenant_uuid.clone()),
        );
        headers.insert(
            format!("user_uuid:{}", transfer.initiator_uuid),
            serde_json::Value::Bool(true),
        );

        BusMessage {
            name: format!("transfer_{}", milestone.as_str()),
            routing_key: format!("calls.transfer.{}", milestone.as_str()),
            headers,
            payload: serde_json::to_value(transfer).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Publish failures are logged; they never abort a transition
    pub async fn publish(&self, milestone: Milestone, transfer: &Transfer) {
        if let Err(e) = self.bus.publish(Self::message(milestone, transfer)).await {
            warn!(
                transfer_id = %transfer.id,
                milestone = milestone.as_str(),
                error = %e,
                "Failed to publish transfer event"
            );
        }
    }

    pub async fn created(&self, transfer: &Transfer) {
        self.publish(Milestone::Created, transfer).await
    }

    pub async fn updated(&self, transfer: &Transfer) {
        self.publish(Milestone::Updated, transfer).await
    }

    pub async fn answered(&self, transfer: &Transfer) {
        self.publish(Milestone::Answered, transfer).await
    }

    pub async fn completed(&self, transfer: &Transfer) {
        self.publish(Milestone::Completed, transfer).await
    }

    pub async fn cancelled(&self, transfer: &Transfer) {
        self.publish(Milestone::Cancelled, transfer).await
    }

    pub async fn abandoned(&self, transfer: &Transfer) {
        self.publish(Milestone::Abandoned, transfer).await
    }

    pub async fn ended(&self, transfer: &Transfer) {
        self.publish(Milestone::Ended, transfer).await
    }
}
