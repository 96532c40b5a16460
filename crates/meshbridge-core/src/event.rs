//! Events carried by the bus

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{Availability, EndpointRef, IeeeAddr, InterviewStatus, LastSeenReason};
use crate::entity::EntityId;
use crate::firmware::OtaState;
use crate::group::GroupId;
use crate::radio::{RadioCommand, RadioError, RadioResponse, RequestId};
use crate::state::Payload;

/// Which policy path produced a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateChangeReason {
    PublishDebounce,
    GroupOptimistic,
    LastSeenChanged,
    PublishCached,
    PublishThrottle,
}

/// One externally observable state transition of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityId,
    /// Snapshot before the change
    pub from: Payload,
    /// Snapshot after the change
    pub to: Payload,
    /// Keys that changed (including keys excluded from the cache)
    pub update: Payload,
    pub reason: Option<StateChangeReason>,
}

/// Kind of message received from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    AttributeReport,
    ReadResponse,
    Command,
}

/// A converted message from a device endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    pub device: IeeeAddr,
    #[serde(default = "default_endpoint")]
    pub endpoint: u8,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub linkquality: Option<u8>,
    /// Set when the message was sent to a group address
    #[serde(default)]
    pub group: Option<GroupId>,
    #[serde(default)]
    pub data: Payload,
}

fn default_endpoint() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembersAction {
    Add,
    Remove,
    RemoveAll,
}

impl MembersAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembersAction::Add => "add",
            MembersAction::Remove => "remove",
            MembersAction::RemoveAll => "remove_all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMembersChanged {
    pub group: GroupId,
    pub action: MembersAction,
    pub endpoint: EndpointRef,
    pub skip_disable_reporting: bool,
}

/// Broker publish flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    pub retain: bool,
    pub qos: u8,
    /// Message expiry interval in seconds
    #[serde(default)]
    pub message_expiry: Option<u32>,
}

/// Completion of a radio command issued through the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct RadioCompletion {
    pub id: RequestId,
    pub command: RadioCommand,
    pub result: Result<RadioResponse, RadioError>,
}

/// Keys of the timers owned by extensions; setting a key replaces its deadline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    AvailabilityDeadline(IeeeAddr),
    AvailabilityPoll(IeeeAddr),
    OtaCheck(IeeeAddr),
    PersistState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceJoined { device: IeeeAddr },
    DeviceInterview { device: IeeeAddr, status: InterviewStatus },
    DeviceAnnounce { device: IeeeAddr },
    DeviceNetworkAddressChanged { device: IeeeAddr },
    DeviceLeave { ieee_addr: IeeeAddr, name: String },
    DeviceMessage(DeviceMessage),
    LastSeenChanged { device: IeeeAddr, reason: LastSeenReason },
    ExposesChanged { device: IeeeAddr },
    EntityRenamed { entity: EntityId, from: String, to: String },
    EntityRemoved { entity: EntityId, name: String },
    EntityOptionsChanged { entity: EntityId, from: Value, to: Value },
    GroupMembersChanged(GroupMembersChanged),
    StateChange(ChangeEvent),
    AvailabilityChanged { device: IeeeAddr, from: Availability, to: Availability },
    OtaStateChanged {
        device: IeeeAddr,
        from: OtaState,
        to: OtaState,
        error: Option<String>,
    },
    /// Checkpoint reported by the radio driver during an image transfer
    OtaProgress { device: IeeeAddr, percent: f32 },
    /// Inbound broker message
    MqttMessage { topic: String, payload: String },
    MqttMessagePublished { topic: String, payload: String, options: PublishOptions },
    PublishFailed { topic: String, error: String },
    /// Entity state went out to the broker
    EntityStatePublished {
        entity: EntityId,
        message: Payload,
        reason: Option<StateChangeReason>,
    },
    /// Answer to a `bridge/request/<topic>` message
    BridgeResponse { topic: String, payload: Value },
    /// Notice for `bridge/event` (joins, interviews, leaves)
    BridgeNotice { kind: String, data: Value },
    RadioCompleted(RadioCompletion),
    TimerExpired(TimerKey),
    HandlerFailed { subscriber: String, kind: EventKind, error: String },
}

/// Discriminant of [`Event`], used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceJoined,
    DeviceInterview,
    DeviceAnnounce,
    DeviceNetworkAddressChanged,
    DeviceLeave,
    DeviceMessage,
    LastSeenChanged,
    ExposesChanged,
    EntityRenamed,
    EntityRemoved,
    EntityOptionsChanged,
    GroupMembersChanged,
    StateChange,
    AvailabilityChanged,
    OtaStateChanged,
    OtaProgress,
    MqttMessage,
    MqttMessagePublished,
    PublishFailed,
    EntityStatePublished,
    BridgeResponse,
    BridgeNotice,
    RadioCompleted,
    TimerExpired,
    HandlerFailed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeviceJoined { .. } => EventKind::DeviceJoined,
            Event::DeviceInterview { .. } => EventKind::DeviceInterview,
            Event::DeviceAnnounce { .. } => EventKind::DeviceAnnounce,
            Event::DeviceNetworkAddressChanged { .. } => EventKind::DeviceNetworkAddressChanged,
            Event::DeviceLeave { .. } => EventKind::DeviceLeave,
            Event::DeviceMessage(_) => EventKind::DeviceMessage,
            Event::LastSeenChanged { .. } => EventKind::LastSeenChanged,
            Event::ExposesChanged { .. } => EventKind::ExposesChanged,
            Event::EntityRenamed { .. } => EventKind::EntityRenamed,
            Event::EntityRemoved { .. } => EventKind::EntityRemoved,
            Event::EntityOptionsChanged { .. } => EventKind::EntityOptionsChanged,
            Event::GroupMembersChanged(_) => EventKind::GroupMembersChanged,
            Event::StateChange(_) => EventKind::StateChange,
            Event::AvailabilityChanged { .. } => EventKind::AvailabilityChanged,
            Event::OtaStateChanged { .. } => EventKind::OtaStateChanged,
            Event::OtaProgress { .. } => EventKind::OtaProgress,
            Event::MqttMessage { .. } => EventKind::MqttMessage,
            Event::MqttMessagePublished { .. } => EventKind::MqttMessagePublished,
            Event::PublishFailed { .. } => EventKind::PublishFailed,
            Event::EntityStatePublished { .. } => EventKind::EntityStatePublished,
            Event::BridgeResponse { .. } => EventKind::BridgeResponse,
            Event::BridgeNotice { .. } => EventKind::BridgeNotice,
            Event::RadioCompleted(_) => EventKind::RadioCompleted,
            Event::TimerExpired(_) => EventKind::TimerExpired,
            Event::HandlerFailed { .. } => EventKind::HandlerFailed,
        }
    }
}
