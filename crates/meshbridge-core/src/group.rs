//! Groups of device endpoints addressed together by the radio

use serde::{Deserialize, Serialize};

use crate::device::{EndpointRef, IeeeAddr};
use crate::settings::GroupOptions;

/// Numeric radio-side group id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u16);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the group `state` is derived from its members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffState {
    /// Group is off only when every member is off
    #[default]
    AllMembersOff,
    /// Group follows whichever member reported last
    LastMemberState,
}

/// Binary `state` attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnOff {
    On,
    Off,
}

impl OnOff {
    pub fn parse(value: &serde_json::Value) -> Option<Self> {
        match value.as_str()?.to_ascii_uppercase().as_str() {
            "ON" => Some(OnOff::On),
            "OFF" => Some(OnOff::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnOff::On => "ON",
            OnOff::Off => "OFF",
        }
    }
}

/// Membership entry of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub endpoint: EndpointRef,
    /// Attribute reporting is configured on this member
    #[serde(default)]
    pub reporting: bool,
}

/// A group known to the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    id: GroupId,
    friendly_name: String,
    options: GroupOptions,
    members: Vec<GroupMember>,
}

impl Group {
    pub fn new(id: GroupId, options: GroupOptions) -> Self {
        let friendly_name = options
            .friendly_name
            .clone()
            .unwrap_or_else(|| format!("group_{}", id));
        Self {
            id,
            friendly_name,
            options,
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn has_member(&self, endpoint: &EndpointRef) -> bool {
        self.members.iter().any(|m| &m.endpoint == endpoint)
    }

    pub fn contains_device(&self, device: &IeeeAddr) -> bool {
        self.members.iter().any(|m| &m.endpoint.device == device)
    }

    pub(crate) fn set_friendly_name(&mut self, name: String) {
        self.options.friendly_name = Some(name.clone());
        self.friendly_name = name;
    }

    pub(crate) fn set_options(&mut self, options: GroupOptions) {
        self.options = options;
    }

    /// Returns false if the endpoint was already a member
    pub(crate) fn add_member(&mut self, endpoint: EndpointRef) -> bool {
        if self.has_member(&endpoint) {
            return false;
        }
        self.members.push(GroupMember {
            endpoint,
            reporting: false,
        });
        true
    }

    pub(crate) fn remove_member(&mut self, endpoint: &EndpointRef) -> Option<GroupMember> {
        let index = self.members.iter().position(|m| &m.endpoint == endpoint)?;
        Some(self.members.remove(index))
    }

    pub(crate) fn set_member_reporting(&mut self, endpoint: &EndpointRef, reporting: bool) -> bool {
        match self.members.iter_mut().find(|m| &m.endpoint == endpoint) {
            Some(member) => {
                member.reporting = reporting;
                true
            }
            None => false,
        }
    }
}

/// What the aggregation needs to know about one member
#[derive(Debug, Clone, Copy)]
pub struct MemberState<T: Ord + Copy> {
    pub state: Option<OnOff>,
    /// When the member last reported its state; any ordered timestamp works
    pub last_report: Option<T>,
}

/// Derive the group `state` from its members
///
/// Returns `None` when no member has reported a state yet.
pub fn aggregate_state<T: Ord + Copy>(off_state: OffState, members: &[MemberState<T>]) -> Option<OnOff> {
    let known = members.iter().filter(|m| m.state.is_some());
    match off_state {
        OffState::AllMembersOff => {
            let mut any_known = false;
            for member in known {
                any_known = true;
                if member.state == Some(OnOff::On) {
                    return Some(OnOff::On);
                }
            }
            any_known.then_some(OnOff::Off)
        }
        OffState::LastMemberState => known.max_by_key(|m| m.last_report).and_then(|m| m.state),
    }
}
