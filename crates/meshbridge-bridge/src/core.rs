//! Shared context handed to every extension
//!
//! `Core` owns the bus, the registry, the state store, the timers and the
//! settings. Extensions never do IO themselves: radio commands and publishes
//! are queued here and the bridge runtime executes them once the current
//! dispatch has drained.

use chrono::{DateTime, Utc};
use meshbridge_core::{
    ChangeEvent, Device, DeviceDescriptor, EntityId, Event, EventBus, Group, GroupId, GroupOptions, IeeeAddr,
    PublishOptions, RadioCommand, Registry, RequestId, Settings, StatePolicy, StateStore,
};
use std::time::Instant;
use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::timers::Timers;

/// A publish waiting to be handed to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: String,
    pub options: PublishOptions,
}

pub struct Core {
    pub bus: EventBus,
    pub registry: Registry,
    pub store: StateStore,
    pub timers: Timers,
    pub settings: Settings,
    now: Instant,
    origin: (Instant, DateTime<Utc>),
    next_request: u64,
    radio_out: Vec<(RequestId, RadioCommand)>,
    publish_out: Vec<OutboundPublish>,
}

impl Core {
    /// `now` and `utc` name the same moment; wall-clock time is derived
    /// from the monotonic clock after that
    pub fn new(settings: Settings, now: Instant, utc: DateTime<Utc>) -> Self {
        Self {
            bus: EventBus::new(),
            registry: Registry::new(),
            store: StateStore::new(),
            timers: Timers::new(),
            settings,
            now,
            origin: (now, utc),
            next_request: 1,
            radio_out: Vec::new(),
            publish_out: Vec::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn utc_now(&self) -> DateTime<Utc> {
        let (origin, utc) = self.origin;
        let elapsed = chrono::Duration::from_std(self.now.saturating_duration_since(origin))
            .unwrap_or_else(|_| chrono::Duration::zero());
        utc + elapsed
    }

    /// Move the clock forward; time never goes backwards
    pub fn advance(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn emit(&mut self, event: Event) {
        self.bus.emit(event);
    }

    pub fn emit_all(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.bus.emit(event);
        }
    }

    pub fn emit_changes(&mut self, changes: Vec<ChangeEvent>) {
        for change in changes {
            self.bus.emit(Event::StateChange(change));
        }
    }

    /// Queue a radio command; its completion arrives as `Event::RadioCompleted`
    pub fn send_radio(&mut self, command: RadioCommand) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        trace!(request = %id, ?command, "Queued radio command");
        self.radio_out.push((id, command));
        id
    }

    pub fn publish(&mut self, topic: String, payload: String, options: PublishOptions) {
        self.publish_out.push(OutboundPublish { topic, payload, options });
    }

    /// Full topic for a path below the base topic
    pub fn topic(&self, path: &str) -> String {
        format!("{}/{}", self.settings.mqtt.base_topic, path)
    }

    pub fn take_radio_commands(&mut self) -> Vec<(RequestId, RadioCommand)> {
        std::mem::take(&mut self.radio_out)
    }

    pub fn take_publishes(&mut self) -> Vec<OutboundPublish> {
        std::mem::take(&mut self.publish_out)
    }

    /// Register a device seen on the radio and give it a state record;
    /// returns true if the device is new
    pub fn register_device(&mut self, descriptor: DeviceDescriptor) -> Result<bool> {
        let ieee = descriptor.ieee_addr.clone();
        let options = self.settings.device_options(&ieee);
        let created = self.registry.upsert_device(descriptor, options);
        if created {
            self.configure_entity(&EntityId::Device(ieee))?;
        }
        Ok(created)
    }

    pub fn restore_device(&mut self, device: Device) -> Result<()> {
        let entity = EntityId::Device(device.ieee_addr().clone());
        self.registry.restore_device(device);
        self.configure_entity(&entity)
    }

    pub fn restore_group(&mut self, group: Group) -> Result<()> {
        let entity = EntityId::Group(group.id());
        self.registry.restore_group(group);
        self.configure_entity(&entity)
    }

    pub fn add_group(&mut self, id: GroupId, options: GroupOptions) -> Result<()> {
        self.registry.add_group(id, options)?;
        self.configure_entity(&EntityId::Group(id))
    }

    /// Create the group if needed; returns true if it was created
    pub fn ensure_group(&mut self, id: GroupId) -> Result<bool> {
        let created = self.registry.ensure_group(id);
        if created {
            self.configure_entity(&EntityId::Group(id))?;
        }
        Ok(created)
    }

    /// (Re)build the store policy of an entity from its current options
    pub fn configure_entity(&mut self, entity: &EntityId) -> Result<()> {
        let policy = self.policy_for(entity)?;
        self.store.configure(entity.clone(), policy)?;
        Ok(())
    }

    pub fn policy_for(&self, entity: &EntityId) -> Result<StatePolicy> {
        let policy = match entity {
            EntityId::Device(ieee) => {
                let device = self
                    .registry
                    .device(ieee)
                    .ok_or_else(|| BridgeError::UnknownEntity(ieee.to_string()))?;
                StatePolicy::for_device(device.friendly_name(), device.options())?
            }
            EntityId::Group(id) => {
                let group = self
                    .registry
                    .group(*id)
                    .ok_or_else(|| BridgeError::UnknownEntity(id.to_string()))?;
                StatePolicy::for_group(group.friendly_name(), group.options())?
            }
        };
        Ok(policy)
    }

    /// Remove a device with its state; membership and removal events are emitted
    pub fn remove_device(&mut self, ieee: &IeeeAddr) -> Result<()> {
        let events = self.registry.remove_device(ieee)?;
        self.store.remove(&EntityId::Device(ieee.clone()));
        self.emit_all(events);
        Ok(())
    }

    /// Remove a group with its state; one membership event per member is
    /// emitted before the removal event
    pub fn remove_group(&mut self, id: GroupId) -> Result<()> {
        let events = self.registry.remove_group(id)?;
        self.store.remove(&EntityId::Group(id));
        self.emit_all(events);
        Ok(())
    }
}
