//! Transfer Error Types

use std::time::Duration;

use thiserror::Error;

use super::state::TransferStatus;
use crate::switch::SwitchError;

/// Transfer error types
///
/// `code()` is the machine-readable kind surfaced to API clients.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Request Errors ===
    #[error("Transfer creation error: {0}")]
    Creation(String),

    #[error("Transfer completion error: {0}")]
    Completion(String),

    #[error("Transfer cancellation error: {0}")]
    Cancellation(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Channel {channel_id} is not part of transfer {transfer_id}")]
    ChannelNotFound {
        transfer_id: String,
        channel_id: String,
    },

    #[error("User {0} is not the initiator of this transfer")]
    PermissionDenied(String),

    #[error("Too many candidates: {0}")]
    TooManyCandidates(String),

    #[error("A transfer is already started for call {0}")]
    AlreadyStarted(String),

    #[error("Event {event} is invalid in state {state}")]
    InvalidStateTransition {
        state: TransferStatus,
        event: &'static str,
    },

    // === System Errors ===
    #[error("Switch error: {0}")]
    Switch(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State lock not acquired within {0:?}")]
    LockTimeout(Duration),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Creation(_) => "CREATION_ERROR",
            TransferError::Completion(_) => "COMPLETION_ERROR",
            TransferError::Cancellation(_) => "CANCELLATION_ERROR",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::ChannelNotFound { .. } => "NOT_FOUND",
            TransferError::PermissionDenied(_) => "PERMISSION_DENIED",
            TransferError::TooManyCandidates(_) => "TOO_MANY_CANDIDATES",
            TransferError::AlreadyStarted(_) => "ALREADY_STARTED",
            TransferError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            TransferError::Switch(_) => "SWITCH_ERROR",
            TransferError::Storage(_) => "STORAGE_ERROR",
            TransferError::LockTimeout(_) => "LOCK_TIMEOUT",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Creation(_)
            | TransferError::TooManyCandidates(_)
            | TransferError::AlreadyStarted(_) => 400,
            TransferError::PermissionDenied(_) => 403,
            TransferError::TransferNotFound(_) | TransferError::ChannelNotFound { .. } => 404,
            TransferError::Completion(_)
            | TransferError::Cancellation(_)
            | TransferError::InvalidStateTransition { .. } => 409,
            TransferError::Switch(_) => 503,
            TransferError::Storage(_) | TransferError::LockTimeout(_) => 500,
        }
    }

    /// The request was refused before anything changed
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidStateTransition { .. }
                | TransferError::Completion(_)
                | TransferError::Cancellation(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TransferError::TransferNotFound(_) | TransferError::ChannelNotFound { .. }
        )
    }
}

impl From<SwitchError> for TransferError {
    fn from(e: SwitchError) -> Self {
        TransferError::Switch(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TransferError::AlreadyStarted("b".into()).code(),
            "ALREADY_STARTED"
        );
        assert_eq!(
            TransferError::InvalidStateTransition {
                state: TransferStatus::Ended,
                event: "complete"
            }
            .code(),
            "INVALID_STATE_TRANSITION"
        );
        assert_eq!(TransferError::PermissionDenied("u".into()).code(), "PERMISSION_DENIED");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(TransferError::Creation("x".into()).http_status(), 400);
        assert_eq!(TransferError::PermissionDenied("u".into()).http_status(), 403);
        assert_eq!(TransferError::TransferNotFound("x".into()).http_status(), 404);
        assert_eq!(TransferError::Completion("x".into()).http_status(), 409);
        assert_eq!(
            TransferError::LockTimeout(Duration::from_secs(10)).http_status(),
            500
        );
    }

    #[test]
    fn test_display() {
        let err = TransferError::InvalidStateTransition {
            state: TransferStatus::Ringback,
            event: "initiator_joined_stasis",
        };
        assert_eq!(
            err.to_string(),
            "Event initiator_joined_stasis is invalid in state ringback"
        );
    }

    #[test]
    fn test_from_switch_error() {
        let err: TransferError = SwitchError::Request("busy".into()).into();
        assert_eq!(err.code(), "SWITCH_ERROR");
    }
}
