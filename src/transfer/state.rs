//! Transfer FSM State Definitions
//!
//! Status names are the persisted form (snake_case strings).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::Destination;

/// Transfer FSM States
///
/// Terminal state: ENDED. `New` is the in-memory status of a transfer that
/// has not been bound to a state yet and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Built in memory, no state bound yet
    New,

    /// Both original legs are already under application control
    Ready,

    /// Original legs are still routed by the switch itself
    NonStasis,

    /// Waiting for both legs to join the application
    MovingToStasisZeroReady,
    MovingToStasisInitiatorReady,
    MovingToStasisTransferredReady,

    /// Legs prepared, destination stored, recipient not dialed yet
    Starting,

    /// Recipient ringing, transferred on hold
    Ringback,

    /// Initiator gone, transferred waits for the recipient
    BlindTransferred,

    /// Recipient answered, initiator consulting
    Answered,

    /// Terminal
    Ended,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 11] = [
        TransferStatus::New,
        TransferStatus::Ready,
        TransferStatus::NonStasis,
        TransferStatus::MovingToStasisZeroReady,
        TransferStatus::MovingToStasisInitiatorReady,
        TransferStatus::MovingToStasisTransferredReady,
        TransferStatus::Starting,
        TransferStatus::Ringback,
        TransferStatus::BlindTransferred,
        TransferStatus::Answered,
        TransferStatus::Ended,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::New => "new",
            TransferStatus::Ready => "ready",
            TransferStatus::NonStasis => "non_stasis",
            TransferStatus::MovingToStasisZeroReady => "moving_to_stasis_zero_ready",
            TransferStatus::MovingToStasisInitiatorReady => "moving_to_stasis_initiator_ready",
            TransferStatus::MovingToStasisTransferredReady => "moving_to_stasis_transferred_ready",
            TransferStatus::Starting => "starting",
            TransferStatus::Ringback => "ringback",
            TransferStatus::BlindTransferred => "blind_transferred",
            TransferStatus::Answered => "answered",
            TransferStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or(())
    }
}

/// Operations a state may accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Start(Destination),
    Complete,
    Cancel,
    InitiatorHangup,
    RecipientHangup,
    TransferredHangup,
    RecipientAnswer,
    TransferredMohStop,
    InitiatorJoinedStasis,
    TransferredJoinedStasis,
}

impl TransferEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::Start(_) => "start",
            TransferEvent::Complete => "complete",
            TransferEvent::Cancel => "cancel",
            TransferEvent::InitiatorHangup => "initiator_hangup",
            TransferEvent::RecipientHangup => "recipient_hangup",
            TransferEvent::TransferredHangup => "transferred_hangup",
            TransferEvent::RecipientAnswer => "recipient_answer",
            TransferEvent::TransferredMohStop => "transferred_moh_stop",
            TransferEvent::InitiatorJoinedStasis => "initiator_joined_stasis",
            TransferEvent::TransferredJoinedStasis => "transferred_joined_stasis",
        }
    }
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
