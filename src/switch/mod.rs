//! Switch Control Protocol
//!
//! Command surface of the telephony switch the transfer engine drives.
//! The engine only depends on [`SwitchClient`]; [`ari::AriClient`] talks to a
//! real switch over REST and [`events::SwitchEventStream`] delivers its
//! asynchronous event feed.
//!
//! Commands are fire-and-forget from the state machine's point of view.
//! The only outcome that gets special handling is [`SwitchError::NotFound`]:
//! a leg that hung up while a command was in flight.

pub mod ari;
pub mod events;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use events::{SwitchEvent, SwitchEventStream};

/// Switch command errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchError {
    /// The channel or bridge does not exist (anymore)
    #[error("Switch entity not found: {0}")]
    NotFound(String),

    #[error("Switch rejected request: {0}")]
    Request(String),

    #[error("Switch protocol error: {0}")]
    Protocol(String),
}

impl SwitchError {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, SwitchError::NotFound(_))
    }
}

impl From<reqwest::Error> for SwitchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(reqwest::StatusCode::NOT_FOUND) => SwitchError::NotFound(e.to_string()),
            Some(_) => SwitchError::Request(e.to_string()),
            None => SwitchError::Protocol(e.to_string()),
        }
    }
}

/// Channel state as reported by the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Down,
    Rsrved,
    OffHook,
    Dialing,
    Ring,
    Ringing,
    Up,
    Busy,
    #[serde(other)]
    Unknown,
}

/// Caller identity attached to a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// Snapshot of a live channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub state: ChannelState,
    #[serde(default)]
    pub caller: CallerId,
    /// Controlling application, `None` while the switch routes the channel itself
    #[serde(default, rename = "dialplan_app")]
    pub application: Option<String>,
}

impl Channel {
    /// Whether the channel is under the control of `app`
    pub fn is_controlled_by(&self, app: &str) -> bool {
        self.application.as_deref() == Some(app)
    }
}

/// Snapshot of a bridge (mixing point)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub id: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Parameters of an outgoing call placed into the controlling application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginateRequest {
    pub endpoint: String,
    pub app: String,
    pub app_args: Vec<String>,
    pub variables: HashMap<String, String>,
    /// Ring timeout in seconds, `None` for the switch default
    pub timeout: Option<u32>,
}

/// Switch command interface
///
/// Every call is a synchronous round trip from the caller's point of view.
#[async_trait]
pub trait SwitchClient: Send + Sync {
    /// Name of the controlling application channels are moved into
    fn application(&self) -> &str;

    // === Channels ===
    async fn get_channel(&self, channel_id: &str) -> Result<Channel, SwitchError>;
    async fn list_channels(&self) -> Result<Vec<Channel>, SwitchError>;
    async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<String, SwitchError>;
    async fn set_channel_var(
        &self,
        channel_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), SwitchError>;
    async fn originate(&self, request: OriginateRequest) -> Result<Channel, SwitchError>;
    async fn hangup(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn ring(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn stop_ring(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn hold(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn unhold(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn start_moh(&self, channel_id: &str, moh_class: &str) -> Result<(), SwitchError>;
    async fn stop_moh(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn mute(&self, channel_id: &str) -> Result<(), SwitchError>;
    async fn unmute(&self, channel_id: &str) -> Result<(), SwitchError>;
    /// Move a channel routed by the switch into the controlling application
    async fn redirect_to_app(&self, channel_id: &str, app_args: &[String])
    -> Result<(), SwitchError>;

    // === Bridges ===
    async fn create_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError>;
    async fn get_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError>;
    async fn list_bridges(&self) -> Result<Vec<Bridge>, SwitchError>;
    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), SwitchError>;
    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), SwitchError>;
    async fn remove_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), SwitchError>;

    // === Dialplan ===
    async fn extension_exists(&self, context: &str, exten: &str) -> Result<bool, SwitchError>;

    // === Global variables ===
    async fn get_global_var(&self, name: &str) -> Result<Option<String>, SwitchError>;
    async fn set_global_var(&self, name: &str, value: &str) -> Result<(), SwitchError>;
}

/// Outcome of a command that may race against a hangup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerated {
    Done,
    Gone,
}

impl Tolerated {
    #[inline]
    pub fn is_gone(&self) -> bool {
        matches!(self, Tolerated::Gone)
    }
}

/// Absorb `NotFound`: the entity hung up while the command was in flight.
pub fn tolerate_gone(op: &str, result: Result<(), SwitchError>) -> Result<Tolerated, SwitchError> {
    match result {
        Ok(()) => Ok(Tolerated::Done),
        Err(SwitchError::NotFound(what)) => {
            debug!(op, entity = %what, "Switch entity already gone");
            Ok(Tolerated::Gone)
        }
        Err(e) => Err(e),
    }
}
