//! Outbound side of the broker: entity state, availability, bridge topics

use meshbridge_core::settings::AttributeFilter;
use meshbridge_core::{
    Availability, ChangeEvent, EntityId, Event, EventKind, IeeeAddr, Payload, PublishOptions,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::error::Result;
use crate::extension::Extension;

#[derive(Default)]
pub struct Publish {
    /// Compiled `filtered_attributes` per entity, rebuilt when options change
    filters: HashMap<EntityId, AttributeFilter>,
    availability: HashMap<IeeeAddr, Availability>,
}

impl Publish {
    pub fn new() -> Self {
        Self::default()
    }

    fn filter(&mut self, core: &Core, entity: &EntityId) -> &AttributeFilter {
        self.filters.entry(entity.clone()).or_insert_with(|| {
            let (name, patterns) = match entity {
                EntityId::Device(ieee) => match core.registry.device(ieee) {
                    Some(d) => (d.friendly_name().to_string(), d.options().filtered_attributes.clone()),
                    None => return AttributeFilter::default(),
                },
                EntityId::Group(id) => match core.registry.group(*id) {
                    Some(g) => (g.friendly_name().to_string(), g.options().filtered_attributes.clone()),
                    None => return AttributeFilter::default(),
                },
            };
            AttributeFilter::compile(&name, &patterns).unwrap_or_else(|e| {
                warn!(entity = %entity, error = %e, "Ignoring invalid attribute filter");
                AttributeFilter::default()
            })
        })
    }

    fn on_state_change(&mut self, core: &mut Core, change: &ChangeEvent) {
        let Some(name) = core.registry.friendly_name(&change.entity).map(str::to_string) else {
            return;
        };

        let mut message: Payload = if core.settings.advanced.cache_state {
            let mut message = change.to.clone();
            // uncached keys are only in the update
            for (key, value) in &change.update {
                if !value.is_null() && !message.contains_key(key) {
                    message.insert(key.clone(), value.clone());
                }
            }
            message
        } else {
            change
                .update
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let filter = self.filter(core, &change.entity);
        if !filter.is_empty() {
            message.retain(|key, _| !filter.matches(key));
        }

        if let EntityId::Device(ieee) = &change.entity {
            let last_seen = core
                .registry
                .device(ieee)
                .and_then(|d| d.last_seen())
                .and_then(|seen| core.settings.advanced.last_seen.format(seen.at));
            if let Some(last_seen) = last_seen {
                message.insert("last_seen".to_string(), last_seen);
            }
            if core.settings.mqtt.include_device_information {
                message.insert("device".to_string(), core.registry.describe(&change.entity));
            }
        }

        if message.is_empty() {
            return;
        }

        let options = entity_options(core, &change.entity);
        let output = core.settings.advanced.output;
        if output.attribute() {
            for (key, value) in &message {
                let payload = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                core.publish(core.topic(&format!("{}/{}", name, key)), payload, options);
            }
        }
        if output.json() {
            core.publish(core.topic(&name), Value::Object(message.clone()).to_string(), options);
        }

        core.emit(Event::EntityStatePublished {
            entity: change.entity.clone(),
            message,
            reason: change.reason,
        });
    }

    fn publish_availability(&self, core: &mut Core, ieee: &IeeeAddr, name: &str) {
        let Some(state) = self.availability.get(ieee) else {
            return;
        };
        if *state == Availability::Unknown {
            return;
        }
        let mut options = entity_options(core, &EntityId::Device(ieee.clone()));
        options.retain = !core.settings.mqtt.force_disable_retain;
        core.publish(
            core.topic(&format!("{}/availability", name)),
            json!({"state": state.as_str()}).to_string(),
            options,
        );
    }

    /// Empty retained payloads drop what the broker kept for an old name
    fn clear_retained(&self, core: &mut Core, name: &str) {
        if core.settings.mqtt.force_disable_retain {
            return;
        }
        let options = PublishOptions {
            retain: true,
            ..Default::default()
        };
        for path in [name.to_string(), format!("{}/availability", name)] {
            core.publish(core.topic(&path), String::new(), options);
        }
    }

    fn publish_bridge_state(&self, core: &mut Core, state: &str) {
        let options = PublishOptions {
            retain: !core.settings.mqtt.force_disable_retain,
            ..Default::default()
        };
        core.publish(core.topic("bridge/state"), state.to_string(), options);
    }
}

/// Broker flags for an entity's topics
fn entity_options(core: &Core, entity: &EntityId) -> PublishOptions {
    let (retain, qos, message_expiry) = match entity {
        EntityId::Device(ieee) => core
            .registry
            .device(ieee)
            .map(|d| (d.options().retain, d.options().qos, d.options().retention))
            .unwrap_or_default(),
        EntityId::Group(id) => core
            .registry
            .group(*id)
            .map(|g| (g.options().retain, g.options().qos, None))
            .unwrap_or_default(),
    };
    PublishOptions {
        retain: retain.unwrap_or(false) && !core.settings.mqtt.force_disable_retain,
        qos: qos.unwrap_or(0),
        message_expiry,
    }
}

impl Extension for Publish {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::StateChange,
            EventKind::AvailabilityChanged,
            EventKind::EntityRenamed,
            EventKind::EntityRemoved,
            EventKind::EntityOptionsChanged,
            EventKind::BridgeResponse,
            EventKind::BridgeNotice,
        ]
    }

    fn start(&mut self, core: &mut Core) -> Result<()> {
        self.publish_bridge_state(core, "online");

        let advanced = &core.settings.advanced;
        if advanced.cache_state && advanced.cache_state_send_on_startup {
            let entities: Vec<EntityId> = core.store.entities().cloned().collect();
            let mut replayed = 0;
            for entity in entities {
                if let Some(change) = core.store.replay_cached(&entity)? {
                    core.emit(Event::StateChange(change));
                    replayed += 1;
                }
            }
            info!(entities = replayed, "Replaying cached state");
        }
        Ok(())
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::StateChange(change) => self.on_state_change(core, change),
            Event::AvailabilityChanged { device, to, .. } => {
                self.availability.insert(device.clone(), *to);
                if let Some(name) = core.registry.device(device).map(|d| d.friendly_name().to_string()) {
                    self.publish_availability(core, device, &name);
                }
            }
            Event::EntityRenamed { entity, from, to } => {
                debug!(entity = %entity, from = %from, to = %to, "Moving retained topics");
                self.filters.remove(entity);
                self.clear_retained(core, from);
                if let EntityId::Device(ieee) = entity {
                    self.publish_availability(core, ieee, to);
                }
                if let Some(change) = core.store.replay_cached(entity)? {
                    core.emit(Event::StateChange(change));
                }
            }
            Event::EntityRemoved { entity, name } => {
                self.filters.remove(entity);
                if let EntityId::Device(ieee) = entity {
                    self.availability.remove(ieee);
                }
                self.clear_retained(core, name);
            }
            Event::EntityOptionsChanged { entity, .. } => {
                self.filters.remove(entity);
            }
            Event::BridgeResponse { topic, payload } => {
                let topic = core.topic(&format!("bridge/response/{}", topic));
                core.publish(topic, payload.to_string(), PublishOptions::default());
            }
            Event::BridgeNotice { kind, data } => {
                let payload = json!({"type": kind, "data": data}).to_string();
                core.publish(core.topic("bridge/event"), payload, PublishOptions::default());
            }
            _ => {}
        }
        Ok(())
    }

    fn stop(&mut self, core: &mut Core) {
        self.publish_bridge_state(core, "offline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{payload, Harness};
    use meshbridge_core::settings::{LastSeenFormat, OutputMode};
    use meshbridge_core::{DeviceOptions, DeviceType, PowerSource, Settings, StateChangeReason};

    fn harness(settings: Settings) -> (Harness, IeeeAddr) {
        let mut h = Harness::new(settings, vec![Box::new(Publish::new())]);
        h.start();
        let ieee = h.join(1, DeviceType::Router, PowerSource::Mains);
        h.take_publishes();
        h.clear_events();
        (h, ieee)
    }

    fn report(h: &mut Harness, ieee: &IeeeAddr, value: Value) {
        let entity = EntityId::Device(ieee.clone());
        let now = h.core.now();
        let changes = h.core.store.report(&entity, payload(value), now).unwrap();
        h.core.emit_changes(changes);
        h.host.drain(&mut h.core);
    }

    #[test]
    fn test_bridge_state_online_and_offline() {
        let mut h = Harness::new(Settings::default(), vec![Box::new(Publish::new())]);
        h.start();
        let publishes = h.take_publishes();
        assert_eq!(publishes[0].topic, "meshbridge/bridge/state");
        assert_eq!(publishes[0].payload, "online");
        assert!(publishes[0].options.retain);

        h.stop();
        assert_eq!(h.last_publish("meshbridge/bridge/state"), Some(json!("offline")));
    }

    #[test]
    fn test_state_published_with_cached_attributes() {
        let (mut h, ieee) = harness(Settings::default());
        let topic = format!("meshbridge/{}", ieee);

        report(&mut h, &ieee, json!({"state": "ON", "brightness": 20}));
        report(&mut h, &ieee, json!({"brightness": 40}));
        assert_eq!(h.last_publish(&topic), Some(json!({"state": "ON", "brightness": 40})));
    }

    #[test]
    fn test_without_cache_only_update_is_published() {
        let mut settings = Settings::default();
        settings.advanced.cache_state = false;
        let (mut h, ieee) = harness(settings);
        let topic = format!("meshbridge/{}", ieee);

        report(&mut h, &ieee, json!({"state": "ON", "brightness": 20}));
        report(&mut h, &ieee, json!({"brightness": 40}));
        assert_eq!(h.last_publish(&topic), Some(json!({"brightness": 40})));
    }

    #[test]
    fn test_filtered_attributes_and_last_seen() {
        let mut settings = Settings::default();
        settings.advanced.last_seen = LastSeenFormat::Epoch;
        settings.devices.insert(
            "0x0000000000000001".into(),
            DeviceOptions {
                filtered_attributes: vec!["^linkquality$".into()],
                retain: Some(true),
                ..Default::default()
            },
        );
        let (mut h, ieee) = harness(settings);

        report(&mut h, &ieee, json!({"state": "ON", "linkquality": 80}));
        let publishes = h.take_publishes();
        assert_eq!(publishes.len(), 1);
        assert!(publishes[0].options.retain);
        let message: Value = serde_json::from_str(&publishes[0].payload).unwrap();
        assert_eq!(message["state"], "ON");
        assert!(message.get("linkquality").is_none());
        assert!(message["last_seen"].is_i64());
    }

    #[test]
    fn test_attribute_output() {
        let mut settings = Settings::default();
        settings.advanced.output = OutputMode::Attribute;
        let (mut h, ieee) = harness(settings);

        report(&mut h, &ieee, json!({"state": "ON", "brightness": 20}));
        let topics: Vec<(String, String)> = h.take_publishes().into_iter().map(|p| (p.topic, p.payload)).collect();
        assert_eq!(
            topics,
            vec![
                (format!("meshbridge/{}/brightness", ieee), "20".to_string()),
                (format!("meshbridge/{}/state", ieee), "ON".to_string()),
            ]
        );
    }

    #[test]
    fn test_availability_is_retained() {
        let (mut h, ieee) = harness(Settings::default());
        h.emit(Event::AvailabilityChanged {
            device: ieee.clone(),
            from: Availability::Unknown,
            to: Availability::Online,
        });
        let publishes = h.take_publishes();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].topic, format!("meshbridge/{}/availability", ieee));
        assert_eq!(publishes[0].payload, r#"{"state":"online"}"#);
        assert!(publishes[0].options.retain);
    }

    #[test]
    fn test_rename_clears_old_topics_and_replays() {
        let (mut h, ieee) = harness(Settings::default());
        report(&mut h, &ieee, json!({"state": "ON"}));
        h.take_publishes();
        h.clear_events();

        let entity = EntityId::Device(ieee.clone());
        let renamed = h.core.registry.rename(&entity, "lamp").unwrap();
        h.emit(renamed);

        let publishes = h.take_publishes();
        let cleared: Vec<&str> = publishes
            .iter()
            .filter(|p| p.payload.is_empty())
            .map(|p| p.topic.as_str())
            .collect();
        assert_eq!(
            cleared,
            vec![format!("meshbridge/{}", ieee), format!("meshbridge/{}/availability", ieee)]
        );
        let last = publishes.last().unwrap();
        assert_eq!(last.topic, "meshbridge/lamp");
        assert_eq!(serde_json::from_str::<Value>(&last.payload).unwrap(), json!({"state": "ON"}));
        assert_eq!(
            h.events(EventKind::StateChange).len(),
            1,
            "replay goes through the bus"
        );
    }

    #[test]
    fn test_startup_replays_cache() {
        let mut h = Harness::new(Settings::default(), vec![Box::new(Publish::new())]);
        let ieee = IeeeAddr::from_u64(7);
        h.core
            .register_device(meshbridge_core::DeviceDescriptor {
                ieee_addr: ieee.clone(),
                network_address: 7,
                device_type: DeviceType::EndDevice,
                power_source: PowerSource::Battery,
                model_id: None,
                endpoints: vec![1],
            })
            .unwrap();
        h.core
            .store
            .seed(&EntityId::Device(ieee.clone()), payload(json!({"temperature": 19})))
            .unwrap();

        h.start();
        let changes = h.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].reason, Some(StateChangeReason::PublishCached));
        assert_eq!(
            h.last_publish(&format!("meshbridge/{}", ieee)),
            Some(json!({"temperature": 19}))
        );
    }

    #[test]
    fn test_bridge_response_and_notice_topics() {
        let mut h = Harness::new(Settings::default(), vec![Box::new(Publish::new())]);
        h.start();
        h.take_publishes();

        h.emit(Event::BridgeResponse {
            topic: "device/rename".into(),
            payload: json!({"status": "ok"}),
        });
        h.emit(Event::BridgeNotice {
            kind: "device_leave".into(),
            data: json!({"friendly_name": "x"}),
        });
        let publishes = h.take_publishes();
        assert_eq!(publishes[0].topic, "meshbridge/bridge/response/device/rename");
        assert_eq!(publishes[1].topic, "meshbridge/bridge/event");
        assert_eq!(
            serde_json::from_str::<Value>(&publishes[1].payload).unwrap()["type"],
            "device_leave"
        );
    }
}
