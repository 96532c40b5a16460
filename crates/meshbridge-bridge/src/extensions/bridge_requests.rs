//! Entity management requests on `<base>/bridge/request/...`
//!
//! Group and OTA requests are answered by their own extensions; anything
//! nobody handles gets an error response from here.

use meshbridge_core::{
    EntityId, Event, EventKind, RadioCommand, RadioCompletion, RadioResponse, RequestId, StatePolicy,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use super::{groups, ota, BridgeRequest};
use crate::core::Core;
use crate::error::{BridgeError, Result};
use crate::extension::Extension;

pub const OPERATIONS: &[&str] = &[
    "device/rename",
    "group/rename",
    "device/options",
    "group/options",
    "device/remove",
    "networkmap",
];

#[derive(Default)]
pub struct BridgeRequests {
    /// Network map scans waiting for the radio
    scans: HashMap<RequestId, BridgeRequest>,
}

impl BridgeRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self, core: &mut Core, request: &BridgeRequest) -> Option<Result<Value>> {
        let result = match request.op.as_str() {
            "device/rename" => rename(core, request, false),
            "group/rename" => rename(core, request, true),
            "device/options" => options(core, request, false),
            "group/options" => options(core, request, true),
            "device/remove" => remove(core, request),
            "networkmap" => {
                let id = core.send_radio(RadioCommand::NetworkMap);
                self.scans.insert(id, request.clone());
                return None;
            }
            op if groups::OPERATIONS.contains(&op) || ota::OPERATIONS.contains(&op) => return None,
            op => Err(BridgeError::InvalidRequest(format!("unknown request '{}'", op))),
        };
        Some(result)
    }

    fn on_completion(&mut self, core: &mut Core, completion: &RadioCompletion) {
        let Some(request) = self.scans.remove(&completion.id) else {
            return;
        };
        let result = match &completion.result {
            Ok(RadioResponse::NetworkMap { map }) => Ok(json!({"type": "raw", "routes": false, "value": map})),
            Ok(other) => Err(BridgeError::InvalidRequest(format!("unexpected response {:?}", other))),
            Err(e) => Err(BridgeError::Radio(e.clone())),
        };
        request.respond(core, result);
    }
}

fn resolve(core: &Core, key: &str, group: bool) -> Result<EntityId> {
    match core.registry.resolve(key) {
        Some(entity) if entity.is_group() == group => Ok(entity),
        _ => Err(BridgeError::UnknownEntity(key.to_string())),
    }
}

fn rename(core: &mut Core, request: &BridgeRequest, group: bool) -> Result<Value> {
    let from = request.field("from")?;
    let to = request.field("to")?;
    let entity = resolve(core, &from, group)?;

    let event = core.registry.rename(&entity, &to)?;
    core.configure_entity(&entity)?;
    info!(entity = %entity, from = %from, to = %to, "Renamed");
    core.emit(event);
    Ok(json!({"from": from, "to": to}))
}

fn options(core: &mut Core, request: &BridgeRequest, group: bool) -> Result<Value> {
    let id = request.field("id")?;
    let changes = request.object("options")?;
    if changes.contains_key("friendly_name") {
        return Err(BridgeError::InvalidRequest(
            "friendly_name can only be changed with a rename request".to_string(),
        ));
    }
    let entity = resolve(core, &id, group)?;
    let invalid = |e: serde_json::Error| BridgeError::InvalidRequest(format!("invalid options: {}", e));

    let event = match &entity {
        EntityId::Device(ieee) => {
            let device = core
                .registry
                .device(ieee)
                .ok_or_else(|| BridgeError::UnknownEntity(id.clone()))?;
            let updated = device.options().with_changes(&changes).map_err(invalid)?;
            let policy = StatePolicy::for_device(device.friendly_name(), &updated)?;
            if policy.debounce.is_some() && policy.throttle.is_some() {
                return Err(BridgeError::InvalidRequest(
                    "debounce and throttle cannot both be set".to_string(),
                ));
            }
            core.registry.set_device_options(ieee, updated)?
        }
        EntityId::Group(group_id) => {
            let group = core
                .registry
                .group(*group_id)
                .ok_or_else(|| BridgeError::UnknownEntity(id.clone()))?;
            let updated = group.options().with_changes(&changes).map_err(invalid)?;
            StatePolicy::for_group(group.friendly_name(), &updated)?;
            core.registry.set_group_options(*group_id, updated)?
        }
    };
    core.configure_entity(&entity)?;

    let response = match &event {
        Event::EntityOptionsChanged { from, to, .. } => json!({"id": id, "from": from, "to": to}),
        _ => json!({"id": id}),
    };
    core.emit(event);
    Ok(response)
}

fn remove(core: &mut Core, request: &BridgeRequest) -> Result<Value> {
    let id = request.field("id")?;
    let entity = resolve(core, &id, false)?;
    if let EntityId::Device(ieee) = &entity {
        info!(device = %ieee, "Removing device on request");
        core.remove_device(ieee)?;
    }
    Ok(json!({"id": id}))
}

impl Extension for BridgeRequests {
    fn name(&self) -> &'static str {
        "bridge_requests"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![EventKind::MqttMessage, EventKind::RadioCompleted]
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::MqttMessage { topic, payload } => {
                let Some(request) = BridgeRequest::parse(core, topic, payload) else {
                    return Ok(());
                };
                if let Some(result) = self.handle(core, &request) {
                    request.respond(core, result);
                }
            }
            Event::RadioCompleted(completion) => self.on_completion(core, completion),
            _ => {}
        }
        Ok(())
    }
}
