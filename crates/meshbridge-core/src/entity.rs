//! Entity references shared by the state store, bus events and registry

use serde::{Deserialize, Serialize};

use crate::device::IeeeAddr;
use crate::group::GroupId;

/// Stable identity of a device or group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum EntityId {
    Device(IeeeAddr),
    Group(GroupId),
}

impl EntityId {
    pub fn as_device(&self) -> Option<&IeeeAddr> {
        match self {
            EntityId::Device(ieee) => Some(ieee),
            EntityId::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<GroupId> {
        match self {
            EntityId::Group(id) => Some(*id),
            EntityId::Device(_) => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, EntityId::Group(_))
    }

    /// `device` or `group`, as used in bridge payloads
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityId::Device(_) => "device",
            EntityId::Group(_) => "group",
        }
    }
}

impl From<IeeeAddr> for EntityId {
    fn from(ieee: IeeeAddr) -> Self {
        EntityId::Device(ieee)
    }
}

impl From<GroupId> for EntityId {
    fn from(id: GroupId) -> Self {
        EntityId::Group(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Device(ieee) => write!(f, "device {}", ieee),
            EntityId::Group(id) => write!(f, "group {}", id),
        }
    }
}
