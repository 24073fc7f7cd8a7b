//! Transfers Service
//!
//! Entry points shared by the HTTP API, the bus consumer and tests. Creation
//! validates everything it can before any transfer exists, then takes the
//! initiator's transfer lock and binds the new transfer to `ready` or
//! `non_stasis` depending on where its legs currently live.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::error::TransferError;
use super::factory::StateFactory;
use super::state::{TransferEvent, TransferStatus};
use super::types::{Destination, Transfer, TransferFlow, TransferId};
use crate::bus::CreateTransferPayload;
use crate::switch::{SwitchClient, SwitchError};

pub const USER_UUID_VAR: &str = "WAZO_USERUUID";
pub const TENANT_UUID_VAR: &str = "WAZO_TENANT_UUID";

fn default_flow() -> TransferFlow {
    TransferFlow::Attended
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateTransferRequest {
    pub transferred_call: String,
    pub initiator_call: String,
    pub context: String,
    pub exten: String,
    #[serde(default = "default_flow")]
    pub flow: TransferFlow,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<u32>,
}

/// Creation on behalf of a user: the transferred leg is resolved
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserTransferRequest {
    pub initiator_call: String,
    pub context: String,
    pub exten: String,
    #[serde(default = "default_flow")]
    pub flow: TransferFlow,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<u32>,
}

impl CreateTransferRequest {
    fn destination(&self) -> Destination {
        Destination {
            context: self.context.clone(),
            exten: self.exten.clone(),
            variables: self.variables.clone(),
            timeout: self.timeout,
        }
    }
}

impl TryFrom<CreateTransferPayload> for CreateTransferRequest {
    type Error = TransferError;

    fn try_from(payload: CreateTransferPayload) -> Result<Self, Self::Error> {
        let flow = match payload.flow.as_deref() {
            Some(flow) => flow.parse()?,
            None => TransferFlow::Attended,
        };
        Ok(Self {
            transferred_call: payload.transferred_call,
            initiator_call: payload.initiator_call,
            context: payload.context,
            exten: payload.exten,
            flow,
            variables: payload.variables,
            timeout: payload.timeout,
        })
    }
}

pub struct TransfersService {
    factory: Arc<StateFactory>,
    switch: Arc<dyn SwitchClient>,
}

impl TransfersService {
    pub fn new(factory: Arc<StateFactory>) -> Self {
        let switch = factory.switch().clone();
        Self { factory, switch }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    pub async fn create(&self, req: CreateTransferRequest) -> Result<Transfer, TransferError> {
        if req.transferred_call == req.initiator_call {
            return Err(TransferError::Creation(
                "transferred and initiator calls are the same".to_string(),
            ));
        }
        self.require_channel(&req.transferred_call).await?;
        self.require_channel(&req.initiator_call).await?;
        if !self.switch.extension_exists(&req.context, &req.exten).await? {
            return Err(TransferError::Creation(format!(
                "extension {}@{} not found",
                req.exten, req.context
            )));
        }
        let (user_uuid, tenant_uuid) = self.identity(&req.initiator_call).await?;

        let lock = self.factory.transfer_lock();
        if !lock.acquire(&req.initiator_call) {
            return Err(TransferError::AlreadyStarted(req.initiator_call));
        }

        match self.start(&req, user_uuid, tenant_uuid).await {
            Ok(transfer) => {
                info!(
                    transfer_id = %transfer.id,
                    transferred_call = %transfer.transferred_call,
                    initiator_call = %transfer.initiator_call,
                    flow = %transfer.flow,
                    status = %transfer.status,
                    "Transfer created"
                );
                Ok(transfer)
            }
            Err(e) => {
                warn!(initiator_call = %req.initiator_call, error = %e, "Transfer creation failed");
                lock.release(&req.initiator_call);
                Err(e)
            }
        }
    }

    pub async fn create_from_user(
        &self,
        req: UserTransferRequest,
        user_uuid: &str,
    ) -> Result<Transfer, TransferError> {
        self.require_channel(&req.initiator_call).await?;
        let (owner, _) = self.identity(&req.initiator_call).await?;
        if owner != user_uuid {
            return Err(TransferError::PermissionDenied(user_uuid.to_string()));
        }
        let transferred_call = self.bridged_peer(&req.initiator_call).await?;

        self.create(CreateTransferRequest {
            transferred_call,
            initiator_call: req.initiator_call,
            context: req.context,
            exten: req.exten,
            flow: req.flow,
            variables: req.variables,
            timeout: req.timeout,
        })
        .await
    }

    pub async fn create_from_bus(
        &self,
        payload: CreateTransferPayload,
    ) -> Result<Transfer, TransferError> {
        self.create(payload.try_into()?).await
    }

    async fn start(
        &self,
        req: &CreateTransferRequest,
        user_uuid: String,
        tenant_uuid: String,
    ) -> Result<Transfer, TransferError> {
        let status = if self.controlled(&req.transferred_call).await?
            && self.controlled(&req.initiator_call).await?
        {
            TransferStatus::Ready
        } else {
            TransferStatus::NonStasis
        };

        let transfer = Transfer::new(
            req.transferred_call.clone(),
            req.initiator_call.clone(),
            user_uuid,
            tenant_uuid,
            req.flow,
        );
        let mut scope = self.factory.make_from_class(status, transfer).await?;
        scope.apply(TransferEvent::Start(req.destination())).await?;
        scope.finish().await
    }

    // ========================================================================
    // Queries and commands
    // ========================================================================

    pub async fn get(&self, id: &str) -> Result<Transfer, TransferError> {
        self.factory.get(&parse_id(id)?).await
    }

    pub async fn get_from_user(&self, id: &str, user_uuid: &str) -> Result<Transfer, TransferError> {
        let transfer = self.get(id).await?;
        check_owner(&transfer, user_uuid)?;
        Ok(transfer)
    }

    pub async fn complete(&self, id: &str) -> Result<Transfer, TransferError> {
        self.factory
            .transition(&parse_id(id)?, TransferEvent::Complete)
            .await
            .map_err(|e| request_error(e, TransferError::Completion))
    }

    pub async fn complete_from_user(
        &self,
        id: &str,
        user_uuid: &str,
    ) -> Result<Transfer, TransferError> {
        self.get_from_user(id, user_uuid).await?;
        self.complete(id).await
    }

    pub async fn cancel(&self, id: &str) -> Result<Transfer, TransferError> {
        self.factory
            .transition(&parse_id(id)?, TransferEvent::Cancel)
            .await
            .map_err(|e| request_error(e, TransferError::Cancellation))
    }

    pub async fn cancel_from_user(&self, id: &str, user_uuid: &str) -> Result<Transfer, TransferError> {
        self.get_from_user(id, user_uuid).await?;
        self.cancel(id).await
    }

    // ========================================================================
    // Validation helpers
    // ========================================================================

    async fn require_channel(&self, channel_id: &str) -> Result<(), TransferError> {
        match self.switch.get_channel(channel_id).await {
            Ok(_) => Ok(()),
            Err(SwitchError::NotFound(_)) => Err(TransferError::Creation(format!(
                "channel {} not found",
                channel_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn controlled(&self, channel_id: &str) -> Result<bool, TransferError> {
        let channel = self.switch.get_channel(channel_id).await.map_err(|e| {
            TransferError::Creation(format!("channel {} unavailable: {}", channel_id, e))
        })?;
        Ok(channel.is_controlled_by(self.switch.application()))
    }

    /// User and tenant owning `channel_id`
    async fn identity(&self, channel_id: &str) -> Result<(String, String), TransferError> {
        let user = self.switch.get_channel_var(channel_id, USER_UUID_VAR).await?;
        let tenant = self
            .switch
            .get_channel_var(channel_id, TENANT_UUID_VAR)
            .await?;
        if user.is_empty() || tenant.is_empty() {
            return Err(TransferError::Creation(format!(
                "channel {} has no user identity",
                channel_id
            )));
        }
        Ok((user, tenant))
    }

    /// The single other channel bridged with `initiator_call`
    async fn bridged_peer(&self, initiator_call: &str) -> Result<String, TransferError> {
        let peers: BTreeSet<String> = self
            .switch
            .list_bridges()
            .await?
            .into_iter()
            .filter(|b| b.channels.iter().any(|c| c == initiator_call))
            .flat_map(|b| b.channels)
            .filter(|c| c != initiator_call)
            .collect();

        let mut peers = peers.into_iter();
        match (peers.next(), peers.next()) {
            (Some(peer), None) => Ok(peer),
            (None, _) => Err(TransferError::Creation(format!(
                "no call bridged with {}",
                initiator_call
            ))),
            (Some(_), Some(_)) => Err(TransferError::TooManyCandidates(format!(
                "{} is bridged with several calls",
                initiator_call
            ))),
        }
    }
}

fn parse_id(id: &str) -> Result<TransferId, TransferError> {
    id.parse()
        .map_err(|_| TransferError::TransferNotFound(id.to_string()))
}

fn check_owner(transfer: &Transfer, user_uuid: &str) -> Result<(), TransferError> {
    if transfer.initiator_uuid == user_uuid {
        Ok(())
    } else {
        Err(TransferError::PermissionDenied(user_uuid.to_string()))
    }
}

/// Present a rejected user request as the request's own error kind
fn request_error(e: TransferError, kind: fn(String) -> TransferError) -> TransferError {
    match e {
        TransferError::InvalidStateTransition { state, .. } => {
            kind(format!("not possible while {}", state))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::capture::CaptureBus;
    use crate::config::TransferConfig;
    use crate::switch::mock::FakeSwitch;
    use crate::transfer::lock::TransferLock;
    use crate::transfer::notifier::Notifier;
    use crate::transfer::persistor::StatePersistor;
    use crate::transfer::store::MemoryKvStore;

    fn service(switch: Arc<FakeSwitch>) -> (TransfersService, Arc<TransferLock>) {
        let lock = Arc::new(TransferLock::new());
        let factory = StateFactory::new(
            switch,
            StatePersistor::new(Arc::new(MemoryKvStore::new())),
            Notifier::new(Arc::new(CaptureBus::new())),
            lock.clone(),
            TransferConfig::default(),
        );
        (TransfersService::new(Arc::new(factory)), lock)
    }

    fn switch() -> Arc<FakeSwitch> {
        let switch = Arc::new(FakeSwitch::new("callcontrol"));
        switch.add_live_channel("chan-a", true);
        switch.add_user_channel("chan-b", true, "user-1", "tenant-1");
        switch.add_bridge("direct", &["chan-a", "chan-b"]);
        switch.add_extension("default", "1002");
        switch
    }

    fn request() -> CreateTransferRequest {
        CreateTransferRequest {
            transferred_call: "chan-a".into(),
            initiator_call: "chan-b".into(),
            context: "default".into(),
            exten: "1002".into(),
            flow: TransferFlow::Attended,
            variables: BTreeMap::new(),
            timeout: None,
        }
    }

    fn user_request() -> UserTransferRequest {
        UserTransferRequest {
            initiator_call: "chan-b".into(),
            context: "default".into(),
            exten: "1002".into(),
            flow: TransferFlow::Attended,
            variables: BTreeMap::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_create_missing_leg() {
        let sw = switch();
        let (svc, lock) = service(sw);
        let mut req = request();
        req.transferred_call = "chan-zz".into();
        let err = svc.create(req).await.unwrap_err();
        assert_eq!(err.code(), "CREATION_ERROR");
        assert!(!lock.is_held("chan-b"));
    }

    #[tokio::test]
    async fn test_create_unroutable_extension() {
        let (svc, _) = service(switch());
        let mut req = request();
        req.exten = "9999".into();
        assert!(matches!(
            svc.create(req).await,
            Err(TransferError::Creation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_without_identity() {
        let sw = switch();
        sw.add_live_channel("chan-x", true);
        let (svc, _) = service(sw);
        let mut req = request();
        req.initiator_call = "chan-x".into();
        assert!(matches!(
            svc.create(req).await,
            Err(TransferError::Creation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_already_started() {
        let (svc, lock) = service(switch());
        lock.acquire("chan-b");
        let err = svc.create(request()).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_STARTED");
        assert!(lock.is_held("chan-b"));
    }

    #[tokio::test]
    async fn test_create_failure_releases_lock() {
        let sw = switch();
        sw.set_fail_originate(true);
        let (svc, lock) = service(sw.clone());
        let err = svc.create(request()).await.unwrap_err();
        assert_eq!(err.code(), "CREATION_ERROR");
        assert!(!lock.is_held("chan-b"));
        // Pair bridged back together, nothing left ringing
        let bridges = sw.commands();
        assert!(bridges.iter().any(|c| c.starts_with("originate:")));
        assert!(!sw.is_ringing("chan-b"));
        assert!(!sw.has_moh("chan-a"));
    }

    #[tokio::test]
    async fn test_create_from_user_resolves_peer() {
        let (svc, _) = service(switch());
        let transfer = svc
            .create_from_user(user_request(), "user-1")
            .await
            .unwrap();
        assert_eq!(transfer.transferred_call, "chan-a");
        assert_eq!(transfer.initiator_uuid, "user-1");
        assert_eq!(transfer.status, TransferStatus::Ringback);
    }

    #[tokio::test]
    async fn test_create_from_user_permission() {
        let (svc, _) = service(switch());
        let err = svc
            .create_from_user(user_request(), "user-2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_create_from_user_candidates() {
        let sw = switch();
        sw.add_live_channel("chan-d", true);
        sw.add_bridge("conf", &["chan-b", "chan-d"]);
        let (svc, _) = service(sw.clone());
        let err = svc
            .create_from_user(user_request(), "user-1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOO_MANY_CANDIDATES");

        let lonely = switch();
        lonely.add_user_channel("chan-e", true, "user-1", "tenant-1");
        let (svc, _) = service(lonely);
        let mut req = user_request();
        req.initiator_call = "chan-e".into();
        let err = svc.create_from_user(req, "user-1").await.unwrap_err();
        assert_eq!(err.code(), "CREATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let (svc, _) = service(switch());
        assert!(svc.get("not-a-ulid").await.unwrap_err().is_not_found());
        let id = TransferId::new().to_string();
        assert_eq!(
            svc.complete(&id).await.unwrap_err().code(),
            "TRANSFER_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_user_commands_check_owner() {
        let (svc, _) = service(switch());
        let transfer = svc.create(request()).await.unwrap();
        let id = transfer.id.to_string();

        for result in [
            svc.get_from_user(&id, "user-2").await,
            svc.complete_from_user(&id, "user-2").await,
            svc.cancel_from_user(&id, "user-2").await,
        ] {
            assert_eq!(result.unwrap_err().code(), "PERMISSION_DENIED");
        }
        assert_eq!(
            svc.get_from_user(&id, "user-1").await.unwrap().status,
            TransferStatus::Ringback
        );
    }

    #[tokio::test]
    async fn test_request_in_wrong_state() {
        let sw = switch();
        let (svc, _) = service(sw.clone());
        let mut req = request();
        req.flow = TransferFlow::Blind;
        let transfer = svc.create(req).await.unwrap();
        assert_eq!(transfer.status, TransferStatus::BlindTransferred);

        let err = svc.cancel(&transfer.id.to_string()).await.unwrap_err();
        assert_eq!(err.code(), "CANCELLATION_ERROR");
    }

    #[test]
    fn test_bus_payload_flow() {
        let payload = CreateTransferPayload {
            transferred_call: "a".into(),
            initiator_call: "b".into(),
            context: "default".into(),
            exten: "1002".into(),
            flow: Some("blind".into()),
            variables: BTreeMap::new(),
            timeout: Some(20),
        };
        let req = CreateTransferRequest::try_from(payload.clone()).unwrap();
        assert_eq!(req.flow, TransferFlow::Blind);
        assert_eq!(req.destination().timeout, Some(20));

        let bad = CreateTransferPayload {
            flow: Some("sideways".into()),
            ..payload
        };
        assert!(CreateTransferRequest::try_from(bad).is_err());
    }
}
