//! Meshbridge Core - Entity model, event bus, and state store
//!
//! This crate provides the synchronous heart of the bridge:
//! - Device and group types, held in a registry keyed by stable id
//! - The event bus that carries every change between components
//! - The state store and its publish policy (optimistic, debounce, throttle)
//! - Settings types and validation
//!
//! Nothing here does IO or owns a clock; callers pass `Instant`s in.

pub mod bus;
pub mod device;
pub mod entity;
pub mod event;
pub mod firmware;
pub mod group;
pub mod radio;
pub mod registry;
pub mod settings;
pub mod state;

pub use bus::{Delivery, EventBus, SubscriberId, SubscriptionToken};
pub use device::{
    Availability, Device, DeviceDefinition, DeviceDescriptor, DeviceType, EndpointRef, Expose, IeeeAddr,
    InterviewStatus, LastSeen, LastSeenReason, PowerSource,
};
pub use entity::EntityId;
pub use event::{
    ChangeEvent, DeviceMessage, Event, EventKind, GroupMembersChanged, MembersAction, MessageKind, PublishOptions,
    RadioCompletion, StateChangeReason, TimerKey,
};
pub use firmware::OtaState;
pub use group::{Group, GroupId, GroupMember, OffState, OnOff};
pub use radio::{RadioCommand, RadioError, RadioResponse, RadioTarget, RequestId};
pub use registry::{Registry, RegistryError};
pub use settings::{DeviceOptions, GroupOptions, Settings, SettingsError};
pub use state::{Payload, StateError, StatePolicy, StateStore};
