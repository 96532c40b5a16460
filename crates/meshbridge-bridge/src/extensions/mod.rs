//! Built-in extensions and the helpers they share
//!
//! The default set, in start order:
//! persistence, receive, command, bridge requests, groups, availability,
//! OTA, publish.

pub mod availability;
pub mod bridge_requests;
pub mod command;
pub mod groups;
pub mod ota;
pub mod persistence;
pub mod publish;
pub mod receive;

use serde_json::{json, Map, Value};
use std::fmt::Display;
use std::path::PathBuf;

use crate::core::Core;
use crate::error::{BridgeError, Result};
use crate::extension::Extension;
use meshbridge_core::Event;

/// The extensions a bridge runs unless told otherwise
pub fn default_extensions(state_path: Option<PathBuf>) -> Vec<Box<dyn Extension>> {
    vec![
        Box::new(persistence::Persistence::new(state_path)),
        Box::new(receive::Receive::new()),
        Box::new(command::Command::new()),
        Box::new(bridge_requests::BridgeRequests::new()),
        Box::new(groups::Groups::new()),
        Box::new(availability::AvailabilityTracker::new()),
        Box::new(ota::Ota::new()),
        Box::new(publish::Publish::new()),
    ]
}

/// A message on `<base>/bridge/request/<op>`
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub op: String,
    pub payload: Value,
    transaction: Option<Value>,
}

impl BridgeRequest {
    /// `None` when the topic is not a bridge request
    pub fn parse(core: &Core, topic: &str, payload: &str) -> Option<Self> {
        let prefix = core.topic("bridge/request/");
        let op = topic.strip_prefix(&prefix)?.to_string();
        let payload = match serde_json::from_str::<Value>(payload) {
            Ok(value) => value,
            Err(_) => Value::String(payload.to_string()),
        };
        let transaction = payload.get("transaction").cloned();
        Some(Self {
            op,
            payload,
            transaction,
        })
    }

    /// A field as a string; a bare string payload stands in for `id`
    pub fn field(&self, key: &str) -> Result<String> {
        match self.payload.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            None if key == "id" => match &self.payload {
                Value::String(s) => Ok(s.clone()),
                _ => Err(BridgeError::InvalidRequest(format!("missing '{}'", key))),
            },
            _ => Err(BridgeError::InvalidRequest(format!("missing '{}'", key))),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.payload.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn object(&self, key: &str) -> Result<Map<String, Value>> {
        self.payload
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| BridgeError::InvalidRequest(format!("'{}' must be an object", key)))
    }

    pub fn respond_ok(&self, core: &mut Core, data: Value) {
        let mut payload = json!({"data": data, "status": "ok"});
        self.attach_transaction(&mut payload);
        core.emit(Event::BridgeResponse {
            topic: self.op.clone(),
            payload,
        });
    }

    pub fn respond_error(&self, core: &mut Core, error: impl Display) {
        let mut payload = json!({"data": {}, "status": "error", "error": error.to_string()});
        self.attach_transaction(&mut payload);
        core.emit(Event::BridgeResponse {
            topic: self.op.clone(),
            payload,
        });
    }

    /// Answer with the outcome of a handler
    pub fn respond(&self, core: &mut Core, result: Result<Value>) {
        match result {
            Ok(data) => self.respond_ok(core, data),
            Err(e) => self.respond_error(core, e),
        }
    }

    fn attach_transaction(&self, payload: &mut Value) {
        if let (Some(transaction), Value::Object(map)) = (&self.transaction, payload) {
            map.insert("transaction".to_string(), transaction.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use chrono::Utc;
    use meshbridge_core::{DeviceDescriptor, DeviceType, IeeeAddr, LastSeenReason, PowerSource, Settings};
    use std::time::Instant;

    fn core() -> Core {
        Core::new(Settings::default(), Instant::now(), Utc::now())
    }

    #[test]
    fn test_parse_request() {
        let core = core();
        assert!(BridgeRequest::parse(&core, "meshbridge/lamp/set", "{}").is_none());

        let request = BridgeRequest::parse(
            &core,
            "meshbridge/bridge/request/device/rename",
            r#"{"from": "a", "to": "b", "transaction": 7}"#,
        )
        .unwrap();
        assert_eq!(request.op, "device/rename");
        assert_eq!(request.field("from").unwrap(), "a");
        assert!(request.field("id").is_err());

        let request = BridgeRequest::parse(&core, "meshbridge/bridge/request/device/remove", "lamp").unwrap();
        assert_eq!(request.field("id").unwrap(), "lamp");
    }

    #[test]
    fn test_response_carries_transaction() {
        let mut core = core();
        core.bus
            .subscribe(meshbridge_core::EventKind::BridgeResponse, meshbridge_core::SubscriberId(0));
        let request = BridgeRequest::parse(
            &core,
            "meshbridge/bridge/request/group/add",
            r#"{"friendly_name": "x", "transaction": "t1"}"#,
        )
        .unwrap();
        request.respond_error(&mut core, "nope");

        let delivery = core.bus.next_delivery().unwrap();
        match delivery.event {
            Event::BridgeResponse { topic, payload } => {
                assert_eq!(topic, "group/add");
                assert_eq!(payload["status"], "error");
                assert_eq!(payload["error"], "nope");
                assert_eq!(payload["transaction"], "t1");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_default_extensions_publish_startup_availability() {
        let mut settings = Settings::default();
        settings.availability.enabled = true;
        let mut h = Harness::new(settings, default_extensions(None));
        let ieee = IeeeAddr::from_u64(1);
        let utc = h.core.utc_now();
        h.core
            .register_device(DeviceDescriptor {
                ieee_addr: ieee.clone(),
                network_address: 1,
                device_type: DeviceType::EndDevice,
                power_source: PowerSource::Battery,
                model_id: None,
                endpoints: vec![1],
            })
            .unwrap();
        h.core
            .registry
            .touch_last_seen(&ieee, utc - chrono::Duration::minutes(2000), LastSeenReason::MessageEmitted)
            .unwrap();

        h.start();
        let publishes = h.take_publishes();
        let topics: Vec<&str> = publishes.iter().map(|p| p.topic.as_str()).collect();
        assert!(topics.contains(&"meshbridge/bridge/state"));
        let availability = publishes
            .iter()
            .find(|p| p.topic == format!("meshbridge/{}/availability", ieee))
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&availability.payload).unwrap(),
            json!({"state": "offline"})
        );
        assert!(availability.options.retain);
    }
}
