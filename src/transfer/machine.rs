//! Transfer State Machine
//!
//! ```text
//!  ready ─start─────────────────────────────────────────┐
//!                                                        ▼
//!  non_stasis ─start─▶ moving_to_stasis_* ─joins─▶ starting ─start─▶ ringback ─answer─▶ answered
//!                                                        │              │                 │
//!                                                        │     initiator_hangup/complete  │ complete/cancel/hangups
//!                                                        │              ▼                 ▼
//!                                                        └─(blind)─▶ blind_transferred ─▶ ended
//! ```
//!
//! [`dispatch`] is the full state × event table. Every state lists every
//! event explicitly; there is no wildcard arm, so adding an event or a state
//! does not compile until each pair has a behaviour, even if that behaviour
//! is a rejection.
//!
//! Switch commands that race against a hangup are absorbed (the leg is
//! "already gone") and the transition keeps heading to a safe state. Requests
//! that can no longer be satisfied surface as completion/cancellation errors.

use std::collections::HashMap;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::notifier::Notifier;
use super::state::{TransferEvent, TransferStatus};
use super::types::{Destination, Role, Transfer, TransferFlow};
use crate::config::TransferConfig;
use crate::switch::{OriginateRequest, SwitchClient, SwitchError, Tolerated, tolerate_gone};

pub const ROLE_VAR: &str = "TRANSFER_ROLE";
pub const ID_VAR: &str = "TRANSFER_ID";

/// Application arguments of the originated recipient leg
pub const RECIPIENT_CALLED: &str = "transfer_recipient_called";
/// Application arguments of legs redirected under control
pub const CREATE_TRANSFER: &str = "create_transfer";
pub const TRANSFER_APP_ARG: &str = "transfer";

/// Everything a transition may touch
///
/// Borrowing the state-lock guard makes holding the lock a precondition of
/// constructing a `Transition` at all.
pub struct Transition<'a> {
    pub transfer: &'a mut Transfer,
    pub switch: &'a dyn SwitchClient,
    pub notifier: &'a Notifier,
    pub config: &'a TransferConfig,
    pub(crate) _state_lock: &'a OwnedMutexGuard<()>,
}

fn tolerate(op: &str, result: Result<(), SwitchError>) -> Result<Tolerated, TransferError> {
    Ok(tolerate_gone(op, result)?)
}

fn reject(state: TransferStatus, event: &TransferEvent) -> Result<TransferStatus, TransferError> {
    Err(TransferError::InvalidStateTransition {
        state,
        event: event.name(),
    })
}

/// Run `event` against the transfer's current state, returning the next state
pub async fn dispatch(
    cx: &mut Transition<'_>,
    event: TransferEvent,
) -> Result<TransferStatus, TransferError> {
    use TransferEvent as E;
    use TransferStatus as S;

    let state = cx.transfer.status;
    match state {
        S::New => match event {
            ev @ (E::Start(_)
            | E::Complete
            | E::Cancel
            | E::InitiatorHangup
            | E::RecipientHangup
            | E::TransferredHangup
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::Ready => match event {
            E::Start(dest) => cx.ready_start(dest).await,
            ev @ (E::Complete
            | E::Cancel
            | E::InitiatorHangup
            | E::RecipientHangup
            | E::TransferredHangup
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::NonStasis => match event {
            E::Start(dest) => cx.non_stasis_start(dest).await,
            ev @ (E::Complete
            | E::Cancel
            | E::InitiatorHangup
            | E::RecipientHangup
            | E::TransferredHangup
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::MovingToStasisZeroReady => match event {
            E::InitiatorJoinedStasis => cx.barrier(false, true).await,
            E::TransferredJoinedStasis => cx.barrier(true, false).await,
            E::InitiatorHangup | E::Complete => cx.moving_downgrade(false).await,
            E::TransferredHangup => cx.abandon(Role::Transferred).await,
            ev @ (E::Start(_)
            | E::Cancel
            | E::RecipientHangup
            | E::RecipientAnswer
            | E::TransferredMohStop) => reject(state, &ev),
        },

        S::MovingToStasisInitiatorReady => match event {
            E::TransferredJoinedStasis => cx.barrier(true, true).await,
            E::InitiatorHangup | E::Complete => cx.moving_downgrade(false).await,
            E::TransferredHangup => cx.abandon(Role::Transferred).await,
            ev @ (E::Start(_)
            | E::Cancel
            | E::RecipientHangup
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis) => reject(state, &ev),
        },

        S::MovingToStasisTransferredReady => match event {
            E::InitiatorJoinedStasis => cx.barrier(true, true).await,
            E::InitiatorHangup | E::Complete => cx.moving_downgrade(true).await,
            E::TransferredHangup => cx.abandon(Role::Transferred).await,
            ev @ (E::Start(_)
            | E::Cancel
            | E::RecipientHangup
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::Starting => match event {
            E::Start(dest) => cx.starting_start(dest).await,
            E::InitiatorHangup | E::Complete => cx.starting_downgrade().await,
            E::TransferredHangup => cx.abandon(Role::Transferred).await,
            E::Cancel => cx.cancel(false).await,
            ev @ (E::RecipientHangup
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::Ringback => match event {
            E::TransferredHangup => cx.abandon(Role::Transferred).await,
            E::InitiatorHangup => cx.ringback_initiator_hangup().await,
            E::RecipientHangup => cx.cancel(false).await,
            E::Cancel => cx.cancel(true).await,
            E::Complete => cx.ringback_complete().await,
            E::RecipientAnswer => cx.ringback_recipient_answer().await,
            E::TransferredMohStop => cx.ringback_moh_stop().await,
            ev @ (E::Start(_) | E::InitiatorJoinedStasis | E::TransferredJoinedStasis) => {
                reject(state, &ev)
            }
        },

        S::BlindTransferred => match event {
            E::RecipientAnswer => cx.blind_recipient_answer().await,
            E::RecipientHangup => cx.abandon(Role::Recipient).await,
            E::TransferredHangup => cx.abandon(Role::Transferred).await,
            // We hung the initiator up ourselves; its hangup arrives late
            E::InitiatorHangup => Ok(state),
            ev @ (E::Start(_)
            | E::Complete
            | E::Cancel
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::Answered => match event {
            E::Complete => cx.answered_complete(true).await,
            E::InitiatorHangup => cx.answered_complete(false).await,
            E::Cancel => cx.cancel(true).await,
            E::RecipientHangup => cx.cancel(false).await,
            E::TransferredHangup => cx.answered_transferred_hangup().await,
            ev @ (E::Start(_)
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },

        S::Ended => match event {
            E::InitiatorHangup | E::RecipientHangup | E::TransferredHangup => Ok(state),
            ev @ (E::Start(_)
            | E::Complete
            | E::Cancel
            | E::RecipientAnswer
            | E::TransferredMohStop
            | E::InitiatorJoinedStasis
            | E::TransferredJoinedStasis) => reject(state, &ev),
        },
    }
}

impl Transition<'_> {
    fn transfer_id(&self) -> String {
        self.transfer.id.to_string()
    }

    async fn leg_alive(&self, role: Role) -> Result<bool, TransferError> {
        let Some(chan) = self.transfer.leg(role) else {
            return Ok(false);
        };
        match self.switch.get_channel(chan).await {
            Ok(_) => Ok(true),
            Err(SwitchError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn hangup_leg(&self, role: Role) -> Result<Tolerated, TransferError> {
        match self.transfer.leg(role) {
            Some(chan) => tolerate("hangup", self.switch.hangup(chan).await),
            None => Ok(Tolerated::Gone),
        }
    }

    async fn add_to_bridge(&self, role: Role) -> Result<Tolerated, TransferError> {
        match self.transfer.leg(role) {
            Some(chan) => tolerate(
                "add_channel",
                self.switch
                    .add_channel(&self.transfer.transfer_bridge_id, chan)
                    .await,
            ),
            None => Ok(Tolerated::Gone),
        }
    }

    async fn hold_transferred(&self) -> Result<(), TransferError> {
        let chan = self.transfer.transferred_call.as_str();
        tolerate("mute", self.switch.mute(chan).await)?;
        match self.switch.start_moh(chan, &self.config.moh_class).await {
            Ok(()) => {}
            Err(SwitchError::NotFound(what)) => debug!(entity = %what, "Hold music target gone"),
            Err(e) => {
                warn!(
                    transfer_id = %self.transfer.id,
                    error = %e,
                    "Hold music unavailable, holding in silence"
                );
                tolerate("hold", self.switch.hold(chan).await)?;
            }
        }
        Ok(())
    }

    async fn unhold_transferred(&self) -> Result<Tolerated, TransferError> {
        let chan = self.transfer.transferred_call.as_str();
        tolerate("stop_moh", self.switch.stop_moh(chan).await)?;
        tolerate("unhold", self.switch.unhold(chan).await)?;
        tolerate("unmute", self.switch.unmute(chan).await)
    }

    /// Remove any bridge joining the two original legs directly
    async fn clear_direct_bridge(&self) -> Result<(), TransferError> {
        let transferred = self.transfer.transferred_call.as_str();
        let initiator = self.transfer.initiator_call.as_str();

        for bridge in self.switch.list_bridges().await? {
            if bridge.id == self.transfer.transfer_bridge_id {
                continue;
            }
            let holds_transferred = bridge.channels.iter().any(|c| c == transferred);
            let holds_initiator = bridge.channels.iter().any(|c| c == initiator);
            if !(holds_transferred && holds_initiator) {
                continue;
            }

            debug!(transfer_id = %self.transfer.id, bridge_id = %bridge.id, "Clearing direct bridge");
            if bridge.channels.len() == 2 {
                tolerate("destroy_bridge", self.switch.destroy_bridge(&bridge.id).await)?;
            } else {
                tolerate(
                    "remove_channel",
                    self.switch.remove_channel(&bridge.id, transferred).await,
                )?;
                tolerate(
                    "remove_channel",
                    self.switch.remove_channel(&bridge.id, initiator).await,
                )?;
            }
        }
        Ok(())
    }

    /// Clear stray bridges, mark roles, park the transferred leg on hold in
    /// the transfer bridge and give the initiator ringback
    async fn prepare_legs(&mut self) -> Result<(), TransferError> {
        let id = self.transfer_id();
        self.clear_direct_bridge().await?;
        self.switch
            .create_bridge(&self.transfer.transfer_bridge_id)
            .await?;

        let transferred = self.transfer.transferred_call.as_str();
        self.switch
            .set_channel_var(transferred, ROLE_VAR, Role::Transferred.as_str())
            .await?;
        self.switch.set_channel_var(transferred, ID_VAR, &id).await?;
        self.switch
            .add_channel(&self.transfer.transfer_bridge_id, transferred)
            .await?;
        self.hold_transferred().await?;

        // The initiator may hang up at any point from here on
        let initiator = self.transfer.initiator_call.as_str();
        let marked = tolerate(
            "set_var",
            self.switch
                .set_channel_var(initiator, ROLE_VAR, Role::Initiator.as_str())
                .await,
        )?;
        if self.transfer.flow == TransferFlow::Blind {
            return Ok(());
        }

        tolerate("set_var", self.switch.set_channel_var(initiator, ID_VAR, &id).await)?;
        let rang = tolerate("ring", self.switch.ring(initiator).await)?;
        if marked.is_gone() || rang.is_gone() {
            info!(transfer_id = %self.transfer.id, "Initiator gone before dialing, continuing blind");
            self.transfer.flow = TransferFlow::Blind;
            if self.transfer.status != TransferStatus::Ready {
                self.notifier.updated(self.transfer).await;
            }
        }
        Ok(())
    }

    /// Originate the recipient leg into the application
    async fn originate_recipient(&mut self, dest: &Destination) -> Result<(), SwitchError> {
        let id = self.transfer_id();
        let mut variables: HashMap<String, String> = dest
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        variables.insert(ROLE_VAR.to_string(), Role::Recipient.as_str().to_string());
        variables.insert(ID_VAR.to_string(), id.clone());

        let channel = self
            .switch
            .originate(OriginateRequest {
                endpoint: dest.endpoint(),
                app: self.switch.application().to_string(),
                app_args: vec![
                    TRANSFER_APP_ARG.to_string(),
                    RECIPIENT_CALLED.to_string(),
                    id,
                ],
                variables,
                timeout: dest.timeout.or(self.config.default_timeout_secs),
            })
            .await?;

        info!(
            transfer_id = %self.transfer.id,
            recipient_call = %channel.id,
            endpoint = %dest.endpoint(),
            "Recipient dialed"
        );
        self.transfer.recipient_call = Some(channel.id);
        self.transfer.destination = None;
        Ok(())
    }

    /// Transferred hears ringing, initiator is dropped
    async fn blind_hand_off(&mut self) -> Result<TransferStatus, TransferError> {
        self.transfer.flow = TransferFlow::Blind;
        self.unhold_transferred().await?;
        tolerate(
            "ring",
            self.switch.ring(&self.transfer.transferred_call).await,
        )?;
        tolerate(
            "stop_ring",
            self.switch.stop_ring(&self.transfer.initiator_call).await,
        )?;
        self.hangup_leg(Role::Initiator).await?;
        Ok(TransferStatus::BlindTransferred)
    }

    /// After the recipient is dialed: ring back, or hand off right away
    async fn after_dial(&mut self) -> Result<TransferStatus, TransferError> {
        match self.transfer.flow {
            TransferFlow::Attended => Ok(TransferStatus::Ringback),
            TransferFlow::Blind => {
                let next = self.blind_hand_off().await?;
                self.notifier.completed(self.transfer).await;
                Ok(next)
            }
        }
    }

    // === ready / non_stasis ===

    async fn ready_start(&mut self, dest: Destination) -> Result<TransferStatus, TransferError> {
        if let Err(e) = self.prepare_legs().await {
            self.restore_after_failed_start().await;
            return Err(TransferError::Creation(format!(
                "calls could not be prepared: {}",
                e
            )));
        }
        if let Err(e) = self.originate_recipient(&dest).await {
            self.restore_after_failed_start().await;
            return Err(TransferError::Creation(format!(
                "recipient could not be dialed: {}",
                e
            )));
        }
        self.notifier.created(self.transfer).await;
        self.after_dial().await
    }

    async fn non_stasis_start(&mut self, dest: Destination) -> Result<TransferStatus, TransferError> {
        let app_args = vec![
            TRANSFER_APP_ARG.to_string(),
            CREATE_TRANSFER.to_string(),
            self.transfer_id(),
        ];
        self.transfer.destination = Some(dest);

        for (role, chan) in [
            (Role::Transferred, self.transfer.transferred_call.as_str()),
            (Role::Initiator, self.transfer.initiator_call.as_str()),
        ] {
            self.switch
                .redirect_to_app(chan, &app_args)
                .await
                .map_err(|e| {
                    TransferError::Creation(format!("{} call could not be moved: {}", role, e))
                })?;
        }

        self.notifier.created(self.transfer).await;
        Ok(TransferStatus::MovingToStasisZeroReady)
    }

    // === moving_to_stasis ===

    /// Join barrier: transferred joined AND (initiator joined OR blind)
    async fn barrier(
        &mut self,
        transferred_joined: bool,
        initiator_joined: bool,
    ) -> Result<TransferStatus, TransferError> {
        let blind = self.transfer.flow == TransferFlow::Blind;
        match (transferred_joined, initiator_joined) {
            (true, joined) if joined || blind => {
                self.prepare_legs().await?;
                Ok(TransferStatus::Starting)
            }
            (true, _) => Ok(TransferStatus::MovingToStasisTransferredReady),
            (false, true) => Ok(TransferStatus::MovingToStasisInitiatorReady),
            (false, false) => Ok(TransferStatus::MovingToStasisZeroReady),
        }
    }

    /// Initiator left or asked to complete before both legs joined
    async fn moving_downgrade(
        &mut self,
        transferred_joined: bool,
    ) -> Result<TransferStatus, TransferError> {
        let state = self.transfer.status;
        if self.transfer.flow != TransferFlow::Blind {
            self.transfer.flow = TransferFlow::Blind;
            self.notifier.updated(self.transfer).await;
        }
        if transferred_joined {
            self.barrier(true, false).await
        } else {
            Ok(state)
        }
    }

    // === starting ===

    async fn starting_start(&mut self, dest: Destination) -> Result<TransferStatus, TransferError> {
        let dest = self.transfer.destination.clone().unwrap_or(dest);
        if let Err(e) = self.originate_recipient(&dest).await {
            warn!(transfer_id = %self.transfer.id, error = %e, "Recipient could not be dialed");
            self.restore_pair().await?;
            self.notifier.cancelled(self.transfer).await;
            return Ok(TransferStatus::Ended);
        }
        self.after_dial().await
    }

    async fn starting_downgrade(&mut self) -> Result<TransferStatus, TransferError> {
        if self.transfer.flow != TransferFlow::Blind {
            self.transfer.flow = TransferFlow::Blind;
            self.notifier.updated(self.transfer).await;
        }
        Ok(TransferStatus::Starting)
    }

    // === ringback ===

    async fn ringback_initiator_hangup(&mut self) -> Result<TransferStatus, TransferError> {
        self.transfer.flow = TransferFlow::Blind;
        self.unhold_transferred().await?;
        tolerate(
            "ring",
            self.switch.ring(&self.transfer.transferred_call).await,
        )?;
        self.notifier.updated(self.transfer).await;
        Ok(TransferStatus::BlindTransferred)
    }

    async fn ringback_complete(&mut self) -> Result<TransferStatus, TransferError> {
        if !self.leg_alive(Role::Transferred).await? {
            return Err(TransferError::Completion(
                "transferred call hung up".to_string(),
            ));
        }
        if !self.leg_alive(Role::Recipient).await? {
            return Err(TransferError::Completion(
                "recipient call hung up".to_string(),
            ));
        }
        let next = self.blind_hand_off().await?;
        self.notifier.completed(self.transfer).await;
        Ok(next)
    }

    async fn ringback_recipient_answer(&mut self) -> Result<TransferStatus, TransferError> {
        tolerate(
            "stop_ring",
            self.switch.stop_ring(&self.transfer.initiator_call).await,
        )?;
        self.add_to_bridge(Role::Initiator).await?;
        self.add_to_bridge(Role::Recipient).await?;
        self.notifier.answered(self.transfer).await;
        Ok(TransferStatus::Answered)
    }

    /// Hold music stopped under us: fall back to silence
    async fn ringback_moh_stop(&mut self) -> Result<TransferStatus, TransferError> {
        tolerate("hold", self.switch.hold(&self.transfer.transferred_call).await)?;
        Ok(TransferStatus::Ringback)
    }

    // === blind_transferred ===

    async fn blind_recipient_answer(&mut self) -> Result<TransferStatus, TransferError> {
        tolerate(
            "stop_ring",
            self.switch.stop_ring(&self.transfer.transferred_call).await,
        )?;
        self.add_to_bridge(Role::Transferred).await?;
        self.add_to_bridge(Role::Recipient).await?;
        self.notifier.answered(self.transfer).await;
        Ok(TransferStatus::Ended)
    }

    // === answered ===

    async fn answered_complete(&mut self, requested: bool) -> Result<TransferStatus, TransferError> {
        if requested
            && !self.leg_alive(Role::Transferred).await?
            && !self.leg_alive(Role::Recipient).await?
        {
            return Err(TransferError::Completion(
                "transferred and recipient calls both hung up".to_string(),
            ));
        }
        self.hangup_leg(Role::Initiator).await?;
        self.unhold_transferred().await?;
        self.notifier.completed(self.transfer).await;
        Ok(TransferStatus::Ended)
    }

    /// Initiator and recipient keep talking on their own
    async fn answered_transferred_hangup(&mut self) -> Result<TransferStatus, TransferError> {
        self.notifier.abandoned(self.transfer).await;
        Ok(TransferStatus::Ended)
    }

    // === shared endings ===

    /// Hang up the recipient and bridge the original pair back together
    async fn restore_pair(&mut self) -> Result<(), TransferError> {
        self.hangup_leg(Role::Recipient).await?;
        let bridge = self.transfer.transfer_bridge_id.clone();
        match self.switch.get_bridge(&bridge).await {
            Ok(_) => {}
            Err(SwitchError::NotFound(_)) => {
                self.switch.create_bridge(&bridge).await?;
            }
            Err(e) => return Err(e.into()),
        }
        tolerate(
            "stop_ring",
            self.switch.stop_ring(&self.transfer.initiator_call).await,
        )?;
        self.add_to_bridge(Role::Transferred).await?;
        self.add_to_bridge(Role::Initiator).await?;
        self.unhold_transferred().await?;
        Ok(())
    }

    /// Best effort: the start is reported as failed whatever happens here
    async fn restore_after_failed_start(&mut self) {
        if let Err(e) = self.restore_pair().await {
            warn!(transfer_id = %self.transfer.id, error = %e, "Original calls not restored");
        }
    }

    /// `requested` cancellations fail when the pair cannot be restored
    async fn cancel(&mut self, requested: bool) -> Result<TransferStatus, TransferError> {
        if requested
            && !self.leg_alive(Role::Transferred).await?
            && !self.leg_alive(Role::Initiator).await?
        {
            return Err(TransferError::Cancellation(
                "transferred and initiator calls both hung up".to_string(),
            ));
        }
        self.restore_pair().await?;
        self.notifier.cancelled(self.transfer).await;
        Ok(TransferStatus::Ended)
    }

    /// A leg hung up and the transfer cannot go on: drop everything else
    async fn abandon(&mut self, gone: Role) -> Result<TransferStatus, TransferError> {
        for role in [Role::Transferred, Role::Initiator, Role::Recipient] {
            if role == gone {
                continue;
            }
            if role == Role::Initiator {
                tolerate(
                    "stop_ring",
                    self.switch.stop_ring(&self.transfer.initiator_call).await,
                )?;
            }
            self.hangup_leg(role).await?;
        }
        tolerate(
            "destroy_bridge",
            self.switch
                .destroy_bridge(&self.transfer.transfer_bridge_id)
                .await,
        )?;
        self.notifier.abandoned(self.transfer).await;
        Ok(TransferStatus::Ended)
    }
}
