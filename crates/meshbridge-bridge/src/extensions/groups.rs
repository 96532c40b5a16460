//! Group membership and aggregate group state
//!
//! Membership changes go to the radio first; the registry follows only
//! once the radio confirmed, and a `GroupMembersChanged` event is emitted
//! only when membership actually changed. At start the configured
//! `groups.<id>.devices` lists are reconciled against the registry.
//!
//! State flows both ways: member reports and membership changes update the
//! `state` of optimistic groups, group commands update optimistic members. Each direction marks what it
//! produced so the other does not bounce it back.

use meshbridge_core::group::{aggregate_state, MemberState};
use meshbridge_core::{
    ChangeEvent, EndpointRef, EntityId, Event, EventKind, GroupId, GroupOptions, IeeeAddr, InterviewStatus,
    OnOff, Payload, RadioCommand, RadioCompletion, RequestId, StateChangeReason,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::BridgeRequest;
use crate::core::Core;
use crate::error::{BridgeError, Result};
use crate::extension::Extension;

pub const OPERATIONS: &[&str] = &[
    "group/add",
    "group/remove",
    "group/members/add",
    "group/members/remove",
    "group/members/remove_all",
];

/// A radio command waiting for its completion
#[derive(Debug)]
enum Pending {
    Add {
        request: Option<BridgeRequest>,
        group: GroupId,
        endpoint: EndpointRef,
    },
    Remove {
        request: Option<BridgeRequest>,
        group: GroupId,
        endpoint: EndpointRef,
        skip_disable_reporting: bool,
    },
    RemoveAll {
        request: BridgeRequest,
        endpoint: EndpointRef,
        skip_disable_reporting: bool,
    },
    RemoveGroup {
        request: BridgeRequest,
        group: GroupId,
    },
    /// Reporting enabled for a new member
    Reporting { group: GroupId, endpoint: EndpointRef },
}

impl Pending {
    fn is_membership(&self, id: GroupId, ep: &EndpointRef) -> bool {
        match self {
            Pending::Add { group, endpoint, .. } | Pending::Remove { group, endpoint, .. } => {
                *group == id && endpoint == ep
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct Groups {
    pending: HashMap<RequestId, Pending>,
    /// Order in which members last reported `state`
    last_report: HashMap<IeeeAddr, u64>,
    report_seq: u64,
    /// Group changes derived from members; not propagated back
    aggregated: HashSet<GroupId>,
    /// Member changes derived from a group; not aggregated back
    propagated: HashSet<IeeeAddr>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_request(&mut self, core: &mut Core, request: BridgeRequest) {
        let result = match request.op.as_str() {
            "group/add" => add_group(core, &request).map(Some),
            "group/remove" => self.remove_group(core, request.clone()).map(|()| None),
            "group/members/add" => self.members_add(core, request.clone()).map(|()| None),
            "group/members/remove" => self.members_remove(core, request.clone()).map(|()| None),
            "group/members/remove_all" => self.members_remove_all(core, request.clone()).map(|()| None),
            _ => return,
        };
        // asynchronous operations answer on completion
        match result {
            Ok(Some(data)) => request.respond_ok(core, data),
            Ok(None) => {}
            Err(e) => request.respond_error(core, e),
        }
    }

    fn remove_group(&mut self, core: &mut Core, request: BridgeRequest) -> Result<()> {
        let group = core.registry.resolve_group(&request.field("id")?)?;
        let id = core.send_radio(RadioCommand::RemoveGroup { group });
        self.pending.insert(id, Pending::RemoveGroup { request, group });
        Ok(())
    }

    fn members_add(&mut self, core: &mut Core, request: BridgeRequest) -> Result<()> {
        let key = request.field("group")?;
        // unknown numeric ids are created once the radio confirms
        let group = match core.registry.resolve_group(&key) {
            Ok(group) => group,
            Err(e) => key.trim().parse::<u16>().map(GroupId).map_err(|_| e)?,
        };
        let endpoint = core.registry.resolve_endpoint(&request.field("device")?)?;
        self.send_add(core, Some(request), group, endpoint);
        Ok(())
    }

    fn members_remove(&mut self, core: &mut Core, request: BridgeRequest) -> Result<()> {
        let group = core.registry.resolve_group(&request.field("group")?)?;
        let endpoint = core.registry.resolve_endpoint(&request.field("device")?)?;
        let skip_disable_reporting = request.flag("skip_disable_reporting");
        self.send_remove(core, Some(request), group, endpoint, skip_disable_reporting);
        Ok(())
    }

    fn members_remove_all(&mut self, core: &mut Core, request: BridgeRequest) -> Result<()> {
        let endpoint = core.registry.resolve_endpoint(&request.field("device")?)?;
        let skip_disable_reporting = request.flag("skip_disable_reporting");
        let id = core.send_radio(RadioCommand::RemoveFromAllGroups {
            endpoint: endpoint.clone(),
        });
        self.pending.insert(
            id,
            Pending::RemoveAll {
                request,
                endpoint,
                skip_disable_reporting,
            },
        );
        Ok(())
    }

    fn send_add(&mut self, core: &mut Core, request: Option<BridgeRequest>, group: GroupId, endpoint: EndpointRef) {
        let id = core.send_radio(RadioCommand::AddToGroup {
            endpoint: endpoint.clone(),
            group,
        });
        self.pending.insert(
            id,
            Pending::Add {
                request,
                group,
                endpoint,
            },
        );
    }

    fn send_remove(
        &mut self,
        core: &mut Core,
        request: Option<BridgeRequest>,
        group: GroupId,
        endpoint: EndpointRef,
        skip_disable_reporting: bool,
    ) {
        let id = core.send_radio(RadioCommand::RemoveFromGroup {
            endpoint: endpoint.clone(),
            group,
        });
        self.pending.insert(
            id,
            Pending::Remove {
                request,
                group,
                endpoint,
                skip_disable_reporting,
            },
        );
    }

    fn disable_reporting(&mut self, core: &mut Core, endpoint: EndpointRef) {
        core.send_radio(RadioCommand::SetReporting {
            endpoint,
            enabled: false,
        });
    }

    fn on_completion(&mut self, core: &mut Core, completion: &RadioCompletion) -> Result<()> {
        let Some(pending) = self.pending.remove(&completion.id) else {
            return Ok(());
        };
        if let Err(e) = &completion.result {
            warn!(request = %completion.id, command = ?completion.command, error = %e, "Group command failed");
            match pending {
                Pending::Add { request: Some(request), .. } | Pending::Remove { request: Some(request), .. } => {
                    request.respond_error(core, e)
                }
                Pending::RemoveAll { request, .. } | Pending::RemoveGroup { request, .. } => {
                    request.respond_error(core, e)
                }
                _ => {}
            }
            return Ok(());
        }

        match pending {
            Pending::Add {
                request,
                group,
                endpoint,
            } => {
                core.ensure_group(group)?;
                let changed = core.registry.add_member(group, endpoint.clone())?;
                let was_changed = changed.is_some();
                if let Some(event) = changed {
                    info!(group = %group, endpoint = %endpoint, "Added group member");
                    core.emit(event);
                    let id = core.send_radio(RadioCommand::SetReporting {
                        endpoint: endpoint.clone(),
                        enabled: true,
                    });
                    self.pending.insert(id, Pending::Reporting { group, endpoint: endpoint.clone() });
                }
                if let Some(request) = request {
                    let data = json!({
                        "group": request.payload.get("group"),
                        "device": request.payload.get("device"),
                        "changed": was_changed,
                    });
                    request.respond_ok(core, data);
                }
            }
            Pending::Remove {
                request,
                group,
                endpoint,
                skip_disable_reporting,
            } => {
                let changed = match core.registry.group(group) {
                    Some(_) => core.registry.remove_member(group, &endpoint, skip_disable_reporting)?,
                    None => None,
                };
                let was_changed = changed.is_some();
                if let Some(event) = changed {
                    info!(group = %group, endpoint = %endpoint, "Removed group member");
                    core.emit(event);
                    if !skip_disable_reporting {
                        self.disable_reporting(core, endpoint);
                    }
                }
                if let Some(request) = request {
                    let data = json!({
                        "group": request.payload.get("group"),
                        "device": request.payload.get("device"),
                        "changed": was_changed,
                    });
                    request.respond_ok(core, data);
                }
            }
            Pending::RemoveAll {
                request,
                endpoint,
                skip_disable_reporting,
            } => {
                let events = core.registry.remove_from_all_groups(&endpoint, skip_disable_reporting);
                let changed = !events.is_empty();
                core.emit_all(events);
                if changed && !skip_disable_reporting {
                    self.disable_reporting(core, endpoint);
                }
                let data = json!({"device": request.payload.get("device"), "changed": changed});
                request.respond_ok(core, data);
            }
            Pending::RemoveGroup { request, group } => {
                let (name, reporting): (Option<String>, Vec<EndpointRef>) = match core.registry.group(group) {
                    Some(g) => (
                        Some(g.friendly_name().to_string()),
                        g.members()
                            .iter()
                            .filter(|m| m.reporting)
                            .map(|m| m.endpoint.clone())
                            .collect(),
                    ),
                    None => (None, Vec::new()),
                };
                core.remove_group(group)?;
                info!(group = %group, name = ?name, "Removed group");
                for endpoint in reporting {
                    self.disable_reporting(core, endpoint);
                }
                request.respond_ok(core, json!({"id": request.payload.get("id").cloned().unwrap_or(Value::Null)}));
            }
            Pending::Reporting { group, endpoint } => {
                core.registry.set_member_reporting(group, &endpoint, true);
            }
        }
        Ok(())
    }

    /// Bring configured groups into the registry, then queue the membership
    /// commands that make the radio match the configured member lists
    fn reconcile(&mut self, core: &mut Core) -> Result<()> {
        for (id, options) in core.settings.configured_groups() {
            let current = core.registry.group(id).map(|g| g.options().clone());
            match current {
                None => {
                    if let Err(e) = core.add_group(id, options) {
                        warn!(group = %id, error = %e, "Configured group could not be created");
                    }
                }
                Some(current) if current != options => {
                    let event = core.registry.set_group_options(id, options)?;
                    core.configure_entity(&EntityId::Group(id))?;
                    core.emit(event);
                }
                Some(_) => {}
            }
        }
        self.reconcile_members(core);
        Ok(())
    }

    fn reconcile_members(&mut self, core: &mut Core) {
        for (id, options) in core.settings.configured_groups() {
            // an empty list leaves membership to requests
            if options.devices.is_empty() {
                continue;
            }
            let Some(group) = core.registry.group(id) else {
                continue;
            };

            let mut desired = Vec::new();
            for key in &options.devices {
                match core.registry.resolve_endpoint(key) {
                    Ok(endpoint) => desired.push(endpoint),
                    Err(_) => debug!(group = %id, member = %key, "Configured member not known yet"),
                }
            }
            let current: Vec<EndpointRef> = group.members().iter().map(|m| m.endpoint.clone()).collect();

            let to_add: Vec<EndpointRef> = desired.iter().filter(|ep| !current.contains(ep)).cloned().collect();
            let to_remove: Vec<EndpointRef> = current.into_iter().filter(|ep| !desired.contains(ep)).collect();

            for endpoint in to_add {
                if !self.pending.values().any(|p| p.is_membership(id, &endpoint)) {
                    debug!(group = %id, endpoint = %endpoint, "Reconciling: adding member");
                    self.send_add(core, None, id, endpoint);
                }
            }
            for endpoint in to_remove {
                if !self.pending.values().any(|p| p.is_membership(id, &endpoint)) {
                    debug!(group = %id, endpoint = %endpoint, "Reconciling: removing member");
                    self.send_remove(core, None, id, endpoint, false);
                }
            }
        }
    }

    fn on_state_change(&mut self, core: &mut Core, change: &ChangeEvent) -> Result<()> {
        match &change.entity {
            EntityId::Device(ieee) => {
                if !change.update.contains_key("state") {
                    return Ok(());
                }
                self.report_seq += 1;
                self.last_report.insert(ieee.clone(), self.report_seq);
                if self.propagated.remove(ieee) {
                    return Ok(());
                }
                for group in core.registry.groups_of(ieee) {
                    self.aggregate(core, group)?;
                }
            }
            EntityId::Group(group) => {
                if change.reason != Some(StateChangeReason::GroupOptimistic) {
                    return Ok(());
                }
                if self.aggregated.remove(group) {
                    return Ok(());
                }
                self.propagate(core, *group, &change.update)?;
            }
        }
        Ok(())
    }

    /// Recompute the group `state` from its members; optimistic groups only
    fn aggregate(&mut self, core: &mut Core, id: GroupId) -> Result<()> {
        let Some(group) = core.registry.group(id) else {
            return Ok(());
        };
        if !group.options().is_optimistic() {
            return Ok(());
        }
        let members: Vec<MemberState<u64>> = group
            .members()
            .iter()
            .map(|m| MemberState {
                state: core
                    .store
                    .get(&EntityId::Device(m.endpoint.device.clone()))
                    .and_then(|s| s.get("state"))
                    .and_then(OnOff::parse),
                last_report: self.last_report.get(&m.endpoint.device).copied(),
            })
            .collect();
        let Some(state) = aggregate_state(group.options().off_state, &members) else {
            return Ok(());
        };

        let entity = EntityId::Group(id);
        let mut update = Payload::new();
        update.insert("state".to_string(), json!(state.as_str()));
        let changes = core.store.set(&entity, update, Some(StateChangeReason::GroupOptimistic))?;
        if changes.iter().any(|c| c.reason == Some(StateChangeReason::GroupOptimistic)) {
            self.aggregated.insert(id);
        }
        core.emit_changes(changes);
        Ok(())
    }

    /// Apply a group command to its optimistic members
    fn propagate(&mut self, core: &mut Core, id: GroupId, update: &Payload) -> Result<()> {
        let Some(group) = core.registry.group(id) else {
            return Ok(());
        };
        let update: Payload = update
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if update.is_empty() {
            return Ok(());
        }
        let mut devices: Vec<IeeeAddr> = group.members().iter().map(|m| m.endpoint.device.clone()).collect();
        devices.sort();
        devices.dedup();

        for ieee in devices {
            let entity = EntityId::Device(ieee.clone());
            if !core.store.is_registered(&entity) {
                continue;
            }
            let changes = core.store.command(&entity, update.clone(), core.now())?;
            if changes.iter().any(|c| c.update.contains_key("state")) {
                self.propagated.insert(ieee);
            }
            core.emit_changes(changes);
        }
        Ok(())
    }
}

fn add_group(core: &mut Core, request: &BridgeRequest) -> Result<Value> {
    let friendly_name = request.field("friendly_name")?;
    let id = match request.payload.get("id") {
        Some(value) => value
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(GroupId)
            .ok_or_else(|| BridgeError::InvalidRequest(format!("invalid group id {}", value)))?,
        None => (1..=u16::MAX)
            .map(GroupId)
            .find(|id| core.registry.group(*id).is_none())
            .ok_or_else(|| BridgeError::InvalidRequest("no free group id".to_string()))?,
    };
    core.add_group(
        id,
        GroupOptions {
            friendly_name: Some(friendly_name.clone()),
            ..Default::default()
        },
    )?;
    info!(group = %id, name = %friendly_name, "Added group");
    Ok(json!({"friendly_name": friendly_name, "id": id}))
}

impl Extension for Groups {
    fn name(&self) -> &'static str {
        "groups"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::MqttMessage,
            EventKind::RadioCompleted,
            EventKind::StateChange,
            EventKind::GroupMembersChanged,
            EventKind::DeviceInterview,
            EventKind::EntityRemoved,
        ]
    }

    fn start(&mut self, core: &mut Core) -> Result<()> {
        self.reconcile(core)
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::MqttMessage { topic, payload } => {
                if let Some(request) = BridgeRequest::parse(core, topic, payload) {
                    self.on_request(core, request);
                }
            }
            Event::RadioCompleted(completion) => self.on_completion(core, completion)?,
            Event::StateChange(change) => self.on_state_change(core, change)?,
            Event::GroupMembersChanged(change) => self.aggregate(core, change.group)?,
            Event::DeviceInterview {
                status: InterviewStatus::Successful,
                ..
            } => self.reconcile_members(core),
            Event::EntityRemoved {
                entity: EntityId::Device(ieee),
                ..
            } => {
                self.last_report.remove(ieee);
                self.propagated.remove(ieee);
            }
            Event::EntityRemoved {
                entity: EntityId::Group(id),
                ..
            } => {
                self.aggregated.remove(id);
            }
            _ => {}
        }
        Ok(())
    }

    fn stop(&mut self, _core: &mut Core) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "Dropping unfinished group commands");
        }
        self.pending.clear();
    }
}
