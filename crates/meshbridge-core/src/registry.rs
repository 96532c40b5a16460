//! Registry owning every device and group known to the bridge
//!
//! Entities are stored by stable id and refer to each other only by id.
//! Callers get read views; each mutation goes through a named method that
//! returns the event(s) announcing it, for the caller to emit.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::device::{
    Device, DeviceDefinition, DeviceDescriptor, EndpointRef, IeeeAddr, InterviewStatus, LastSeen, LastSeenReason,
};
use crate::entity::EntityId;
use crate::event::{Event, GroupMembersChanged, MembersAction};
use crate::group::{Group, GroupId};
use crate::settings::{validate_friendly_name, DeviceOptions, GroupOptions, SettingsError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("friendly name '{0}' is already in use")]
    NameInUse(String),
    #[error("group {0} already exists")]
    GroupExists(GroupId),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[derive(Debug, Default)]
pub struct Registry {
    devices: BTreeMap<IeeeAddr, Device>,
    groups: BTreeMap<GroupId, Group>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, ieee: &IeeeAddr) -> Option<&Device> {
        self.devices.get(ieee)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Groups the device has at least one endpoint in
    pub fn groups_of(&self, ieee: &IeeeAddr) -> Vec<GroupId> {
        self.groups
            .values()
            .filter(|g| g.contains_device(ieee))
            .map(|g| g.id())
            .collect()
    }

    pub fn contains(&self, entity: &EntityId) -> bool {
        match entity {
            EntityId::Device(ieee) => self.devices.contains_key(ieee),
            EntityId::Group(id) => self.groups.contains_key(id),
        }
    }

    pub fn friendly_name(&self, entity: &EntityId) -> Option<&str> {
        match entity {
            EntityId::Device(ieee) => self.devices.get(ieee).map(|d| d.friendly_name()),
            EntityId::Group(id) => self.groups.get(id).map(|g| g.friendly_name()),
        }
    }

    /// Resolve a friendly name, IEEE address or numeric group id
    pub fn resolve(&self, key: &str) -> Option<EntityId> {
        if let Some(device) = self.devices.values().find(|d| d.friendly_name() == key) {
            return Some(EntityId::Device(device.ieee_addr().clone()));
        }
        if let Some(group) = self.groups.values().find(|g| g.friendly_name() == key) {
            return Some(EntityId::Group(group.id()));
        }
        if IeeeAddr::looks_like(key) {
            let ieee = IeeeAddr::new(key);
            if self.devices.contains_key(&ieee) {
                return Some(EntityId::Device(ieee));
            }
        }
        key.parse::<u16>()
            .ok()
            .map(GroupId)
            .filter(|id| self.groups.contains_key(id))
            .map(EntityId::Group)
    }

    /// Resolve `<device>` or `<device>/<endpoint>` to an endpoint reference
    ///
    /// A bare device resolves to its default endpoint. The whole key is tried
    /// as a device first since friendly names may contain slashes.
    pub fn resolve_endpoint(&self, key: &str) -> Result<EndpointRef, RegistryError> {
        if let Some(EntityId::Device(ieee)) = self.resolve(key) {
            let endpoint = self.devices.get(&ieee).map_or(1, |d| d.default_endpoint());
            return Ok(EndpointRef::new(ieee, endpoint));
        }
        if let Some((device, endpoint)) = key.rsplit_once('/') {
            if let (Some(EntityId::Device(ieee)), Ok(endpoint)) = (self.resolve(device), endpoint.parse::<u8>()) {
                return Ok(EndpointRef::new(ieee, endpoint));
            }
        }
        Err(RegistryError::UnknownDevice(key.to_string()))
    }

    /// Resolve a group by friendly name or numeric id
    pub fn resolve_group(&self, key: &str) -> Result<GroupId, RegistryError> {
        match self.resolve(key) {
            Some(EntityId::Group(id)) => Ok(id),
            _ => Err(RegistryError::UnknownGroup(key.to_string())),
        }
    }

    /// Register a device seen on the network, or refresh what the radio knows
    /// about it; returns true if the device is new
    pub fn upsert_device(&mut self, descriptor: DeviceDescriptor, options: DeviceOptions) -> bool {
        if let Some(device) = self.devices.get_mut(&descriptor.ieee_addr) {
            device.merge_descriptor(descriptor);
            return false;
        }

        let ieee = descriptor.ieee_addr.clone();
        let name = options
            .friendly_name
            .clone()
            .filter(|name| self.name_owner(name).is_none())
            .unwrap_or_else(|| ieee.to_string());
        debug!(device = %ieee, name = %name, "Registered device");
        self.devices.insert(ieee, Device::new(descriptor, name, options));
        true
    }

    /// Put back a device saved by a previous run
    pub fn restore_device(&mut self, device: Device) {
        self.devices.insert(device.ieee_addr().clone(), device);
    }

    /// Put back a group saved by a previous run
    pub fn restore_group(&mut self, group: Group) {
        self.groups.insert(group.id(), group);
    }

    pub fn set_interview(&mut self, ieee: &IeeeAddr, status: InterviewStatus) -> Result<Event, RegistryError> {
        self.device_mut(ieee)?.set_interview(status);
        Ok(Event::DeviceInterview {
            device: ieee.clone(),
            status,
        })
    }

    /// Apply the definition matched during the interview; announces the
    /// exposes only when they changed
    pub fn apply_definition(
        &mut self,
        ieee: &IeeeAddr,
        definition: DeviceDefinition,
    ) -> Result<Option<Event>, RegistryError> {
        let device = self.device_mut(ieee)?;
        let changed = device.exposes() != definition.exposes.as_slice();
        device.apply_definition(definition);
        Ok(changed.then(|| Event::ExposesChanged { device: ieee.clone() }))
    }

    pub fn set_network_address(&mut self, ieee: &IeeeAddr, address: u16) -> Result<Option<Event>, RegistryError> {
        let device = self.device_mut(ieee)?;
        if device.network_address() == address {
            return Ok(None);
        }
        device.set_network_address(address);
        Ok(Some(Event::DeviceNetworkAddressChanged { device: ieee.clone() }))
    }

    pub fn touch_last_seen(
        &mut self,
        ieee: &IeeeAddr,
        at: DateTime<Utc>,
        reason: LastSeenReason,
    ) -> Result<Event, RegistryError> {
        self.device_mut(ieee)?.set_last_seen(LastSeen { at, reason });
        Ok(Event::LastSeenChanged {
            device: ieee.clone(),
            reason,
        })
    }

    pub fn set_firmware_version(&mut self, ieee: &IeeeAddr, version: Option<u32>) -> Result<(), RegistryError> {
        self.device_mut(ieee)?.set_firmware_version(version);
        Ok(())
    }

    pub fn rename(&mut self, entity: &EntityId, name: &str) -> Result<Event, RegistryError> {
        validate_friendly_name(name)?;
        match self.name_owner(name) {
            Some(owner) if &owner != entity => return Err(RegistryError::NameInUse(name.to_string())),
            _ => {}
        }

        let from = match entity {
            EntityId::Device(ieee) => {
                let device = self.device_mut(ieee)?;
                let from = device.friendly_name().to_string();
                let mut options = device.options().clone();
                options.friendly_name = Some(name.to_string());
                device.set_options(options);
                device.set_friendly_name(name.to_string());
                from
            }
            EntityId::Group(id) => {
                let group = self.group_mut(*id)?;
                let from = group.friendly_name().to_string();
                group.set_friendly_name(name.to_string());
                from
            }
        };
        Ok(Event::EntityRenamed {
            entity: entity.clone(),
            from,
            to: name.to_string(),
        })
    }

    pub fn set_device_options(&mut self, ieee: &IeeeAddr, options: DeviceOptions) -> Result<Event, RegistryError> {
        let device = self.device_mut(ieee)?;
        let from = serde_json::to_value(device.options()).unwrap_or_default();
        let to = serde_json::to_value(&options).unwrap_or_default();
        device.set_options(options);
        Ok(Event::EntityOptionsChanged {
            entity: EntityId::Device(ieee.clone()),
            from,
            to,
        })
    }

    pub fn set_group_options(&mut self, id: GroupId, options: GroupOptions) -> Result<Event, RegistryError> {
        let group = self.group_mut(id)?;
        let from = serde_json::to_value(group.options()).unwrap_or_default();
        let to = serde_json::to_value(&options).unwrap_or_default();
        group.set_options(options);
        Ok(Event::EntityOptionsChanged {
            entity: EntityId::Group(id),
            from,
            to,
        })
    }

    /// Remove a device, dropping it from every group first
    pub fn remove_device(&mut self, ieee: &IeeeAddr) -> Result<Vec<Event>, RegistryError> {
        if !self.devices.contains_key(ieee) {
            return Err(RegistryError::UnknownDevice(ieee.to_string()));
        }
        let mut events = Vec::new();
        for group in self.groups.values_mut() {
            let endpoints: Vec<EndpointRef> = group
                .members()
                .iter()
                .filter(|m| &m.endpoint.device == ieee)
                .map(|m| m.endpoint.clone())
                .collect();
            for endpoint in endpoints {
                group.remove_member(&endpoint);
                events.push(Event::GroupMembersChanged(GroupMembersChanged {
                    group: group.id(),
                    action: MembersAction::RemoveAll,
                    endpoint,
                    skip_disable_reporting: true,
                }));
            }
        }

        let name = self
            .devices
            .remove(ieee)
            .map(|d| d.friendly_name().to_string())
            .unwrap_or_default();
        events.push(Event::EntityRemoved {
            entity: EntityId::Device(ieee.clone()),
            name,
        });
        Ok(events)
    }

    pub fn add_group(&mut self, id: GroupId, options: GroupOptions) -> Result<(), RegistryError> {
        if self.groups.contains_key(&id) {
            return Err(RegistryError::GroupExists(id));
        }
        if let Some(name) = &options.friendly_name {
            validate_friendly_name(name)?;
            if self.name_owner(name).is_some() {
                return Err(RegistryError::NameInUse(name.clone()));
            }
        }
        debug!(group = %id, "Created group");
        self.groups.insert(id, Group::new(id, options));
        Ok(())
    }

    /// Create the group with default options if it does not exist; returns
    /// true if it was created
    pub fn ensure_group(&mut self, id: GroupId) -> bool {
        if self.groups.contains_key(&id) {
            return false;
        }
        debug!(group = %id, "Created group implicitly");
        self.groups.insert(id, Group::new(id, GroupOptions::default()));
        true
    }

    /// Remove a group; each member is announced as removed before the group
    pub fn remove_group(&mut self, id: GroupId) -> Result<Vec<Event>, RegistryError> {
        let group = self
            .groups
            .remove(&id)
            .ok_or_else(|| RegistryError::UnknownGroup(id.to_string()))?;

        let mut events: Vec<Event> = group
            .members()
            .iter()
            .map(|m| {
                Event::GroupMembersChanged(GroupMembersChanged {
                    group: id,
                    action: MembersAction::RemoveAll,
                    endpoint: m.endpoint.clone(),
                    skip_disable_reporting: false,
                })
            })
            .collect();
        events.push(Event::EntityRemoved {
            entity: EntityId::Group(id),
            name: group.friendly_name().to_string(),
        });
        Ok(events)
    }

    /// Add a member; `None` when it already was one
    pub fn add_member(&mut self, id: GroupId, endpoint: EndpointRef) -> Result<Option<Event>, RegistryError> {
        if !self.devices.contains_key(&endpoint.device) {
            return Err(RegistryError::UnknownDevice(endpoint.device.to_string()));
        }
        let group = self.group_mut(id)?;
        if !group.add_member(endpoint.clone()) {
            return Ok(None);
        }
        Ok(Some(Event::GroupMembersChanged(GroupMembersChanged {
            group: id,
            action: MembersAction::Add,
            endpoint,
            skip_disable_reporting: false,
        })))
    }

    /// Remove a member; `None` when it was not one
    pub fn remove_member(
        &mut self,
        id: GroupId,
        endpoint: &EndpointRef,
        skip_disable_reporting: bool,
    ) -> Result<Option<Event>, RegistryError> {
        let group = self.group_mut(id)?;
        if group.remove_member(endpoint).is_none() {
            return Ok(None);
        }
        Ok(Some(Event::GroupMembersChanged(GroupMembersChanged {
            group: id,
            action: MembersAction::Remove,
            endpoint: endpoint.clone(),
            skip_disable_reporting,
        })))
    }

    /// Remove an endpoint from every group it is in
    pub fn remove_from_all_groups(&mut self, endpoint: &EndpointRef, skip_disable_reporting: bool) -> Vec<Event> {
        self.groups
            .values_mut()
            .filter_map(|group| {
                group.remove_member(endpoint)?;
                Some(Event::GroupMembersChanged(GroupMembersChanged {
                    group: group.id(),
                    action: MembersAction::RemoveAll,
                    endpoint: endpoint.clone(),
                    skip_disable_reporting,
                }))
            })
            .collect()
    }

    pub fn set_member_reporting(&mut self, id: GroupId, endpoint: &EndpointRef, reporting: bool) -> bool {
        self.groups
            .get_mut(&id)
            .is_some_and(|g| g.set_member_reporting(endpoint, reporting))
    }

    /// Short summary used in bridge responses and notices
    pub fn describe(&self, entity: &EntityId) -> Value {
        match entity {
            EntityId::Device(ieee) => match self.devices.get(ieee) {
                Some(device) => serde_json::json!({
                    "ieee_address": ieee,
                    "friendly_name": device.friendly_name(),
                    "network_address": device.network_address(),
                    "type": device.device_type(),
                    "power_source": device.power_source(),
                    "model_id": device.model_id(),
                    "interview": device.interview(),
                }),
                None => Value::Null,
            },
            EntityId::Group(id) => match self.groups.get(id) {
                Some(group) => serde_json::json!({
                    "id": id,
                    "friendly_name": group.friendly_name(),
                    "members": group.members().iter().map(|m| m.endpoint.to_string()).collect::<Vec<_>>(),
                }),
                None => Value::Null,
            },
        }
    }

    fn name_owner(&self, name: &str) -> Option<EntityId> {
        self.devices
            .values()
            .find(|d| d.friendly_name() == name)
            .map(|d| EntityId::Device(d.ieee_addr().clone()))
            .or_else(|| {
                self.groups
                    .values()
                    .find(|g| g.friendly_name() == name)
                    .map(|g| EntityId::Group(g.id()))
            })
    }

    fn device_mut(&mut self, ieee: &IeeeAddr) -> Result<&mut Device, RegistryError> {
        self.devices
            .get_mut(ieee)
            .ok_or_else(|| RegistryError::UnknownDevice(ieee.to_string()))
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut Group, RegistryError> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| RegistryError::UnknownGroup(id.to_string()))
    }
}
