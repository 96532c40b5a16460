//! Commands sent to the radio driver and what comes back

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::device::{EndpointRef, IeeeAddr};
use crate::group::GroupId;
use crate::state::Payload;

/// Correlates a radio command with its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a read or write is addressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioTarget {
    Endpoint(EndpointRef),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RadioCommand {
    /// Write converted attribute values (`state`, `brightness`, ...)
    Write { target: RadioTarget, payload: Payload },
    /// Read attributes; the response carries the values
    Read { target: RadioTarget, attributes: Vec<String> },
    /// Liveness check for always-listening devices
    Ping { device: IeeeAddr },
    AddToGroup { endpoint: EndpointRef, group: GroupId },
    RemoveFromGroup { endpoint: EndpointRef, group: GroupId },
    RemoveFromAllGroups { endpoint: EndpointRef },
    /// Remove every member from the group on the radio side
    RemoveGroup { group: GroupId },
    SetReporting { endpoint: EndpointRef, enabled: bool },
    OtaCheck { device: IeeeAddr },
    OtaUpdate { device: IeeeAddr },
    OtaAbort { device: IeeeAddr },
    /// Topology scan (link quality and routes)
    NetworkMap,
}

impl RadioCommand {
    /// Commands whose repeated execution leaves the network in the same state
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            RadioCommand::AddToGroup { .. }
                | RadioCommand::RemoveFromGroup { .. }
                | RadioCommand::RemoveFromAllGroups { .. }
                | RadioCommand::RemoveGroup { .. }
                | RadioCommand::SetReporting { .. }
                | RadioCommand::Read { .. }
        )
    }

    /// Device the command is addressed to, if a single one
    pub fn device(&self) -> Option<&IeeeAddr> {
        match self {
            RadioCommand::Write { target: RadioTarget::Endpoint(ep), .. }
            | RadioCommand::Read { target: RadioTarget::Endpoint(ep), .. } => Some(&ep.device),
            RadioCommand::Ping { device }
            | RadioCommand::OtaCheck { device }
            | RadioCommand::OtaUpdate { device }
            | RadioCommand::OtaAbort { device } => Some(device),
            RadioCommand::AddToGroup { endpoint, .. }
            | RadioCommand::RemoveFromGroup { endpoint, .. }
            | RadioCommand::RemoveFromAllGroups { endpoint }
            | RadioCommand::SetReporting { endpoint, .. } => Some(&endpoint.device),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum RadioResponse {
    Ack,
    Read { values: Payload },
    OtaCheck {
        update_available: bool,
        #[serde(default)]
        latest_version: Option<u32>,
    },
    OtaUpdated {
        #[serde(default)]
        version: Option<u32>,
    },
    NetworkMap { map: Value },
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RadioError {
    #[error("no response from {0}")]
    Timeout(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
    #[error("radio driver unavailable")]
    Unavailable,
}

impl RadioError {
    /// Failures worth retrying for idempotent commands
    pub fn is_transient(&self) -> bool {
        matches!(self, RadioError::Timeout(_) | RadioError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_commands() {
        let endpoint = EndpointRef::new(IeeeAddr::from_u64(1), 1);
        assert!(RadioCommand::AddToGroup { endpoint: endpoint.clone(), group: GroupId(1) }.is_idempotent());
        assert!(!RadioCommand::OtaUpdate { device: IeeeAddr::from_u64(1) }.is_idempotent());
        assert!(!RadioCommand::Write {
            target: RadioTarget::Group(GroupId(1)),
            payload: Payload::new()
        }
        .is_idempotent());
        assert_eq!(
            RadioCommand::SetReporting { endpoint, enabled: true }.device(),
            Some(&IeeeAddr::from_u64(1))
        );
    }

    #[test]
    fn test_command_wire_format() {
        let command: RadioCommand = serde_json::from_value(serde_json::json!({
            "command": "ping",
            "device": "0x0000000000000001"
        }))
        .unwrap();
        assert_eq!(command, RadioCommand::Ping { device: IeeeAddr::from_u64(1) });
        assert!(RadioError::Timeout("x".into()).is_transient());
        assert!(!RadioError::Rejected("x".into()).is_transient());
    }
}
