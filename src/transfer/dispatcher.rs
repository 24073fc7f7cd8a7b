//! Event Dispatcher
//!
//! Turns switch and bus events into transfer transitions:
//!
//! ```text
//! SwitchEvent ─▶ LegEvent ─▶ (Role, LegEvent) ─▶ TransferEvent ─▶ StateFactory
//! BusEvent ──────────────────────────────────────────────────────▶ TransfersService
//! ```
//!
//! Switch events are advisory: rejected transitions and events for channels
//! no transfer owns are logged and dropped. On every (re)connection to the
//! switch the persisted transfers are reconciled against the live channels.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::factory::StateFactory;
use super::machine::{CREATE_TRANSFER, RECIPIENT_CALLED, TRANSFER_APP_ARG};
use super::service::TransfersService;
use super::state::{TransferEvent, TransferStatus};
use super::types::{Role, Transfer};
use crate::bus::BusEvent;
use crate::switch::events::SwitchEvent;
use crate::switch::{Channel, ChannelState};

/// What happened to one channel, before its role is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegEvent {
    /// Entered the application through a redirect
    Joined,
    /// Originated recipient entered the application
    Answered,
    Hangup,
    MohStop,
    CallerIdChanged,
}

impl LegEvent {
    /// Transition a role reacts to, if any
    fn for_role(self, role: Role) -> Option<TransferEvent> {
        match (role, self) {
            (Role::Transferred, LegEvent::Joined) => Some(TransferEvent::TransferredJoinedStasis),
            (Role::Initiator, LegEvent::Joined) => Some(TransferEvent::InitiatorJoinedStasis),
            (Role::Recipient, LegEvent::Joined) => None,

            (Role::Recipient, LegEvent::Answered) => Some(TransferEvent::RecipientAnswer),
            (Role::Transferred | Role::Initiator, LegEvent::Answered) => None,

            (Role::Transferred, LegEvent::Hangup) => Some(TransferEvent::TransferredHangup),
            (Role::Initiator, LegEvent::Hangup) => Some(TransferEvent::InitiatorHangup),
            (Role::Recipient, LegEvent::Hangup) => Some(TransferEvent::RecipientHangup),

            (Role::Transferred, LegEvent::MohStop) => Some(TransferEvent::TransferredMohStop),
            (Role::Initiator | Role::Recipient, LegEvent::MohStop) => None,

            // Not a transition; handled before role routing
            (_, LegEvent::CallerIdChanged) => None,
        }
    }
}

/// Classify the application arguments of a `StasisStart`
fn stasis_start_kind(args: &[String]) -> Option<LegEvent> {
    match args {
        [app, kind, ..] if app == TRANSFER_APP_ARG && kind == RECIPIENT_CALLED => {
            Some(LegEvent::Answered)
        }
        [app, kind, ..] if app == TRANSFER_APP_ARG && kind == CREATE_TRANSFER => {
            Some(LegEvent::Joined)
        }
        _ => None,
    }
}

pub struct EventDispatcher {
    factory: Arc<StateFactory>,
    service: Arc<TransfersService>,
}

impl EventDispatcher {
    pub fn new(factory: Arc<StateFactory>, service: Arc<TransfersService>) -> Self {
        Self { factory, service }
    }

    /// Consume switch events in arrival order until the sender is dropped
    pub fn spawn_switch(self: Arc<Self>, mut rx: mpsc::Receiver<SwitchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle_switch_event(event).await;
            }
            info!("Switch event channel closed, dispatcher stopping");
        })
    }

    pub fn spawn_bus(self: Arc<Self>, mut rx: mpsc::Receiver<BusEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle_bus_event(event).await;
            }
            info!("Bus event channel closed, dispatcher stopping");
        })
    }

    pub async fn handle_switch_event(&self, event: SwitchEvent) {
        match event {
            SwitchEvent::Connected => self.reconcile().await,
            SwitchEvent::StasisStart { channel, args } => match stasis_start_kind(&args) {
                Some(leg_event) => self.route(&channel.id, leg_event).await,
                None => debug!(channel_id = %channel.id, ?args, "Stasis start not for transfers"),
            },
            SwitchEvent::StasisEnd { channel } | SwitchEvent::ChannelDestroyed { channel } => {
                self.route(&channel.id, LegEvent::Hangup).await
            }
            SwitchEvent::ChannelMohStop { channel } => {
                self.route(&channel.id, LegEvent::MohStop).await
            }
            SwitchEvent::ChannelMohStart { channel } => {
                debug!(channel_id = %channel.id, "Hold music started");
            }
            SwitchEvent::ChannelCallerId { channel } => {
                self.route(&channel.id, LegEvent::CallerIdChanged).await
            }
            SwitchEvent::Other => {}
        }
    }

    pub async fn handle_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::TransferCreated(payload) => {
                let initiator_call = payload.initiator_call.clone();
                match self.service.create_from_bus(payload).await {
                    Ok(transfer) => {
                        info!(transfer_id = %transfer.id, "Transfer created from bus")
                    }
                    Err(e) => warn!(
                        initiator_call = %initiator_call,
                        code = e.code(),
                        error = %e,
                        "Bus transfer request failed"
                    ),
                }
            }
        }
    }

    async fn route(&self, channel_id: &str, leg_event: LegEvent) {
        match self.try_route(channel_id, leg_event).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(channel_id, ?leg_event, "No transfer for channel")
            }
            Err(e @ TransferError::InvalidStateTransition { .. }) => {
                info!(channel_id, ?leg_event, error = %e, "Event ignored")
            }
            Err(e) => error!(channel_id, ?leg_event, error = %e, "Event handling failed"),
        }
    }

    async fn try_route(&self, channel_id: &str, leg_event: LegEvent) -> Result<(), TransferError> {
        let mut scope = self.factory.make_by_channel(channel_id).await?;
        let role = scope.transfer().role(channel_id)?;

        if leg_event == LegEvent::CallerIdChanged {
            self.factory.notifier().updated(scope.transfer()).await;
            return Ok(());
        }
        let Some(event) = leg_event.for_role(role) else {
            debug!(channel_id, %role, ?leg_event, "Event not relevant for role");
            return Ok(());
        };

        scope.apply(event).await?;
        let transfer = scope.finish().await?;
        if transfer.status == TransferStatus::Starting {
            self.start(&transfer).await?;
        }
        Ok(())
    }

    /// Dial the recipient of a transfer parked in `starting`
    async fn start(&self, transfer: &Transfer) -> Result<(), TransferError> {
        let destination = transfer.destination.clone().unwrap_or_default();
        self.factory
            .transition(&transfer.id, TransferEvent::Start(destination))
            .await?;
        Ok(())
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Catch up on whatever happened while the event stream was down
    pub async fn reconcile(&self) {
        if let Err(e) = self.factory.restore_locks().await {
            error!(error = %e, "Transfer locks not restored");
        }

        let live: HashMap<String, Channel> = match self.factory.switch().list_channels().await {
            Ok(channels) => channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
            Err(e) => {
                error!(error = %e, "Reconciliation skipped: live channels unavailable");
                return;
            }
        };

        let Some(transfers) = self.list_for_reconcile().await else {
            return;
        };
        info!(transfers = transfers.len(), live_channels = live.len(), "Reconciling transfers");

        // Missed hangups
        for transfer in &transfers {
            for (role, chan) in transfer.legs() {
                if !live.contains_key(chan) {
                    info!(transfer_id = %transfer.id, channel_id = chan, %role, "Replaying missed hangup");
                    self.route(chan, LegEvent::Hangup).await;
                }
            }
        }

        let Some(transfers) = self.list_for_reconcile().await else {
            return;
        };

        // Missed answers
        for transfer in &transfers {
            if transfer.status != TransferStatus::Ringback {
                continue;
            }
            let Some(recipient) = transfer.recipient_call.as_deref() else {
                continue;
            };
            if live.get(recipient).map(|c| c.state) == Some(ChannelState::Up) {
                info!(transfer_id = %transfer.id, "Replaying missed recipient answer");
                self.route(recipient, LegEvent::Answered).await;
            }
        }

        // Interrupted starts
        for transfer in transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Starting)
        {
            info!(transfer_id = %transfer.id, "Resuming interrupted start");
            if let Err(e) = self.start(transfer).await {
                error!(transfer_id = %transfer.id, error = %e, "Failed to resume transfer");
            }
        }
    }

    async fn list_for_reconcile(&self) -> Option<Vec<Transfer>> {
        match self.factory.list().await {
            Ok(transfers) => Some(transfers),
            Err(e) => {
                error!(error = %e, "Reconciliation skipped: transfers unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stasis_start_kind() {
        assert_eq!(
            stasis_start_kind(&args(&["transfer", "transfer_recipient_called", "01H"])),
            Some(LegEvent::Answered)
        );
        assert_eq!(
            stasis_start_kind(&args(&["transfer", "create_transfer", "01H"])),
            Some(LegEvent::Joined)
        );
        assert_eq!(stasis_start_kind(&args(&["dialer"])), None);
        assert_eq!(stasis_start_kind(&[]), None);
    }

    #[test]
    fn test_role_routing() {
        assert_eq!(
            LegEvent::Hangup.for_role(Role::Recipient),
            Some(TransferEvent::RecipientHangup)
        );
        assert_eq!(
            LegEvent::Joined.for_role(Role::Initiator),
            Some(TransferEvent::InitiatorJoinedStasis)
        );
        assert_eq!(LegEvent::Joined.for_role(Role::Recipient), None);
        assert_eq!(LegEvent::MohStop.for_role(Role::Initiator), None);
        assert_eq!(LegEvent::Answered.for_role(Role::Transferred), None);
    }
}
