//! Transfer Core Types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::TransferError;
use super::state::TransferStatus;

/// Transfer identifier - ULID rendered as a 26-char string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    /// Generate a new unique TransferId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl TryFrom<String> for TransferId {
    type Error = ulid::DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransferId> for String {
    fn from(id: TransferId) -> Self {
        id.to_string()
    }
}

/// Whether the initiator consults the recipient before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFlow {
    Attended,
    Blind,
}

impl TransferFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferFlow::Attended => "attended",
            TransferFlow::Blind => "blind",
        }
    }
}

impl FromStr for TransferFlow {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attended" => Ok(TransferFlow::Attended),
            "blind" => Ok(TransferFlow::Blind),
            other => Err(TransferError::Creation(format!("invalid flow: {}", other))),
        }
    }
}

impl fmt::Display for TransferFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a channel within a transfer; derived, never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Transferred,
    Initiator,
    Recipient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Transferred => "transferred",
            Role::Initiator => "initiator",
            Role::Recipient => "recipient",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the recipient is dialed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub context: String,
    pub exten: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Ring timeout in seconds
    #[serde(default)]
    pub timeout: Option<u32>,
}

impl Destination {
    pub fn new(context: impl Into<String>, exten: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            exten: exten.into(),
            variables: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Switch endpoint that routes the call through the dialplan
    pub fn endpoint(&self) -> String {
        format!("Local/{}@{}", self.exten, self.context)
    }
}

/// One in-progress transfer
///
/// Mutated only inside a state transition while the global state lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub initiator_uuid: String,
    pub initiator_tenant_uuid: String,
    pub transferred_call: String,
    pub initiator_call: String,
    pub recipient_call: Option<String>,
    pub transfer_bridge_id: String,
    pub status: TransferStatus,
    pub flow: TransferFlow,
    /// Pending destination, kept until the recipient has been dialed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
}

impl Transfer {
    pub fn new(
        transferred_call: impl Into<String>,
        initiator_call: impl Into<String>,
        initiator_uuid: impl Into<String>,
        initiator_tenant_uuid: impl Into<String>,
        flow: TransferFlow,
    ) -> Self {
        let id = TransferId::new();
        Self {
            id,
            initiator_uuid: initiator_uuid.into(),
            initiator_tenant_uuid: initiator_tenant_uuid.into(),
            transferred_call: transferred_call.into(),
            initiator_call: initiator_call.into(),
            recipient_call: None,
            transfer_bridge_id: id.to_string(),
            status: TransferStatus::New,
            flow,
            destination: None,
        }
    }

    /// Resolve the role of `channel_id`; unknown ids are an error
    pub fn role(&self, channel_id: &str) -> Result<Role, TransferError> {
        if self.transferred_call == channel_id {
            Ok(Role::Transferred)
        } else if self.initiator_call == channel_id {
            Ok(Role::Initiator)
        } else if self.recipient_call.as_deref() == Some(channel_id) {
            Ok(Role::Recipient)
        } else {
            Err(TransferError::ChannelNotFound {
                transfer_id: self.id.to_string(),
                channel_id: channel_id.to_string(),
            })
        }
    }

    /// Channel id holding `role`, if any
    pub fn leg(&self, role: Role) -> Option<&str> {
        match role {
            Role::Transferred => Some(&self.transferred_call),
            Role::Initiator => Some(&self.initiator_call),
            Role::Recipient => self.recipient_call.as_deref(),
        }
    }

    /// All non-null legs with their roles
    pub fn legs(&self) -> Vec<(Role, &str)> {
        [Role::Transferred, Role::Initiator, Role::Recipient]
            .into_iter()
            .filter_map(|role| self.leg(role).map(|chan| (role, chan)))
            .collect()
    }

    pub fn involves(&self, channel_id: &str) -> bool {
        self.role(channel_id).is_ok()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> Transfer {
        let mut t = Transfer::new("chan-a", "chan-b", "user-1", "tenant-1", TransferFlow::Attended);
        t.recipient_call = Some("chan-c".to_string());
        t
    }

    #[test]
    fn test_role_bijection() {
        let t = transfer();
        assert_eq!(t.role("chan-a").unwrap(), Role::Transferred);
        assert_eq!(t.role("chan-b").unwrap(), Role::Initiator);
        assert_eq!(t.role("chan-c").unwrap(), Role::Recipient);
        for (role, chan) in t.legs() {
            assert_eq!(t.role(chan).unwrap(), role);
            assert_eq!(t.leg(role), Some(chan));
        }
    }

    #[test]
    fn test_role_unknown_channel() {
        let mut t = transfer();
        assert!(matches!(
            t.role("chan-z"),
            Err(TransferError::ChannelNotFound { .. })
        ));
        t.recipient_call = None;
        assert!(t.role("chan-c").is_err());
        assert_eq!(t.legs().len(), 2);
    }

    #[test]
    fn test_bridge_defaults_to_id() {
        let t = transfer();
        assert_eq!(t.transfer_bridge_id, t.id.to_string());
        assert_eq!(t.status, TransferStatus::New);
    }

    #[test]
    fn test_json_roundtrip_all_states() {
        for status in TransferStatus::ALL {
            let mut t = transfer();
            t.status = status;
            t.flow = TransferFlow::Blind;
            t.destination = Some(Destination {
                context: "default".into(),
                exten: "1002".into(),
                variables: BTreeMap::from([("K".to_string(), "V".to_string())]),
                timeout: Some(30),
            });
            let raw = t.to_json().unwrap();
            assert_eq!(Transfer::from_json(&raw).unwrap(), t);
        }
    }

    #[test]
    fn test_json_layout() {
        let t = transfer();
        let value: serde_json::Value = serde_json::from_str(&t.to_json().unwrap()).unwrap();
        for field in [
            "id",
            "initiator_uuid",
            "initiator_tenant_uuid",
            "transferred_call",
            "initiator_call",
            "recipient_call",
            "transfer_bridge_id",
            "status",
            "flow",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(value["status"], "new");
        assert_eq!(value["flow"], "attended");
        assert!(value.get("destination").is_none());
    }

    #[test]
    fn test_destination_endpoint() {
        assert_eq!(Destination::new("default", "1002").endpoint(), "Local/1002@default");
    }
}
