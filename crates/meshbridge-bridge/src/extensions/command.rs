//! Broker commands: `<name>/set[/<attr>]` and `<name>/get[/<attr>]`

use meshbridge_core::{
    EndpointRef, EntityId, Event, EventKind, Payload, RadioCommand, RadioCompletion, RadioResponse, RadioTarget,
    RequestId,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::core::Core;
use crate::error::{BridgeError, Result};
use crate::extension::Extension;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Set,
    Get,
}

impl Action {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "set" => Some(Action::Set),
            "get" => Some(Action::Get),
            _ => None,
        }
    }
}

/// Split `<name>/<action>[/<attr>]`; names may contain slashes
fn parse_topic(path: &str) -> Option<(&str, Action, Option<&str>)> {
    let (head, last) = path.rsplit_once('/')?;
    if let Some(action) = Action::parse(last) {
        return (!head.is_empty()).then_some((head, action, None));
    }
    let (name, segment) = head.rsplit_once('/')?;
    let action = Action::parse(segment)?;
    (!name.is_empty()).then_some((name, action, Some(last)))
}

/// Command payload as attribute values; a bare value means `state`
fn parse_payload(payload: &str, attribute: Option<&str>) -> Payload {
    let value = serde_json::from_str::<Value>(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    match (attribute, value) {
        (Some(attribute), value) => {
            let mut update = Payload::new();
            update.insert(attribute.to_string(), value);
            update
        }
        (None, Value::Object(map)) => map,
        (None, value) => {
            let mut update = Payload::new();
            update.insert("state".to_string(), value);
            update
        }
    }
}

#[derive(Default)]
pub struct Command {
    /// Reads waiting for their values
    reads: HashMap<RequestId, EntityId>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_message(&mut self, core: &mut Core, topic: &str, payload: &str) -> Result<()> {
        let Some(path) = topic.strip_prefix(&core.topic("")) else {
            return Ok(());
        };
        if path.starts_with("bridge/") {
            return Ok(());
        }
        let Some((name, action, attribute)) = parse_topic(path) else {
            return Ok(());
        };

        let (entity, endpoint) = match core.registry.resolve(name) {
            Some(entity) => (entity, None),
            None => {
                let endpoint = core
                    .registry
                    .resolve_endpoint(name)
                    .map_err(|_| BridgeError::UnknownEntity(name.to_string()))?;
                (EntityId::Device(endpoint.device.clone()), Some(endpoint.endpoint))
            }
        };

        if let EntityId::Device(ieee) = &entity {
            if core.registry.device(ieee).is_some_and(|d| d.options().is_disabled()) {
                debug!(device = %ieee, "Command for disabled device ignored");
                return Ok(());
            }
        }

        let update = parse_payload(payload, attribute);
        match action {
            Action::Set => self.set(core, &entity, endpoint, update),
            Action::Get => self.get(core, &entity, endpoint, update),
        }
    }

    fn set(&mut self, core: &mut Core, entity: &EntityId, endpoint: Option<u8>, update: Payload) -> Result<()> {
        let writes = targets(core, entity, endpoint, update, true)?;
        if writes.is_empty() {
            return Ok(());
        }

        let mut applied = Payload::new();
        for (target, payload) in writes {
            applied.extend(payload.clone());
            core.send_radio(RadioCommand::Write { target, payload });
        }

        let changes = core.store.command(entity, applied, core.now())?;
        core.emit_changes(changes);
        Ok(())
    }

    fn get(&mut self, core: &mut Core, entity: &EntityId, endpoint: Option<u8>, update: Payload) -> Result<()> {
        let mut update = update;
        if update.is_empty() {
            update.insert("state".to_string(), json!(""));
        }
        for (target, payload) in targets(core, entity, endpoint, update, false)? {
            let attributes = payload.keys().cloned().collect();
            let id = core.send_radio(RadioCommand::Read { target, attributes });
            self.reads.insert(id, entity.clone());
        }
        Ok(())
    }

    fn on_completion(&mut self, core: &mut Core, completion: &RadioCompletion) -> Result<()> {
        match (&completion.command, &completion.result) {
            (RadioCommand::Write { target, .. }, Err(e)) => {
                warn!(?target, error = %e, "Write failed, keeping the optimistic state");
            }
            (RadioCommand::Read { .. }, result) => {
                let Some(entity) = self.reads.remove(&completion.id) else {
                    return Ok(());
                };
                match result {
                    Ok(RadioResponse::Read { values }) if core.store.is_registered(&entity) => {
                        let changes = core.store.report(&entity, values.clone(), core.now())?;
                        core.emit_changes(changes);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(entity = %entity, error = %e, "Read failed"),
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Group the keys of a command by the radio target that handles them
///
/// Keys a device does not expose for the action are dropped with a warning.
fn targets(
    core: &Core,
    entity: &EntityId,
    endpoint: Option<u8>,
    update: Payload,
    set: bool,
) -> Result<Vec<(RadioTarget, Payload)>> {
    let device = match entity {
        EntityId::Group(id) => return Ok(vec![(RadioTarget::Group(*id), update)]),
        EntityId::Device(ieee) => core
            .registry
            .device(ieee)
            .ok_or_else(|| BridgeError::UnknownEntity(ieee.to_string()))?,
    };

    let mut by_endpoint: BTreeMap<u8, Payload> = BTreeMap::new();
    for (key, value) in update {
        let expose = device.expose(&key);
        let allowed = device.exposes().is_empty()
            || expose.is_some_and(|e| if set { e.is_settable() } else { e.is_gettable() });
        if !allowed {
            warn!(device = %device.friendly_name(), key = %key, "Attribute is not exposed for this command");
            continue;
        }
        let ep = endpoint
            .or_else(|| expose.and_then(|e| e.endpoint))
            .unwrap_or_else(|| device.default_endpoint());
        by_endpoint.entry(ep).or_default().insert(key, value);
    }

    Ok(by_endpoint
        .into_iter()
        .map(|(ep, payload)| {
            let target = RadioTarget::Endpoint(EndpointRef::new(device.ieee_addr().clone(), ep));
            (target, payload)
        })
        .collect())
}

impl Extension for Command {
    fn name(&self) -> &'static str {
        "command"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![EventKind::MqttMessage, EventKind::RadioCompleted]
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::MqttMessage { topic, payload } => self.on_message(core, topic, payload),
            Event::RadioCompleted(completion) => self.on_completion(core, completion),
            _ => Ok(()),
        }
    }
}
