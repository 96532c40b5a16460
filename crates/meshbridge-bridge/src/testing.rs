//! Synchronous driver for extension tests: no runtime, no collaborators

use chrono::{TimeZone, Utc};
use meshbridge_core::{
    ChangeEvent, DeviceDescriptor, DeviceType, EntityId, Event, EventKind, IeeeAddr, Payload, PowerSource,
    RadioCommand, RadioCompletion, RadioError, RadioResponse, RequestId, Settings,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::collab::RadioEvent;
use crate::core::{Core, OutboundPublish};
use crate::error::Result as BridgeResult;
use crate::extension::{Extension, ExtensionHost};
use crate::intake;

type Log = Arc<Mutex<Vec<Event>>>;

/// Registered last, so it sees every event after the extensions under test
struct Recorder {
    log: Log,
}

impl Extension for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::StateChange,
            EventKind::AvailabilityChanged,
            EventKind::OtaStateChanged,
            EventKind::GroupMembersChanged,
            EventKind::EntityRenamed,
            EventKind::EntityRemoved,
            EventKind::EntityOptionsChanged,
            EventKind::BridgeResponse,
            EventKind::BridgeNotice,
            EventKind::HandlerFailed,
        ]
    }

    fn on_event(&mut self, _core: &mut Core, event: &Event) -> BridgeResult<()> {
        self.log.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub core: Core,
    pub host: ExtensionHost,
    log: Log,
}

impl Harness {
    pub fn new(settings: Settings, extensions: Vec<Box<dyn Extension>>) -> Self {
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap_or_else(Utc::now);
        let mut host = ExtensionHost::new();
        for extension in extensions {
            host.register(extension);
        }
        let log = Log::default();
        host.register(Box::new(Recorder { log: log.clone() }));
        Self {
            core: Core::new(settings, Instant::now(), utc),
            host,
            log,
        }
    }

    /// Recorded events of one kind, removed from the log
    pub fn events(&self, kind: EventKind) -> Vec<Event> {
        let mut log = self.log.lock().unwrap();
        let (matching, rest): (Vec<Event>, Vec<Event>) = log.drain(..).partition(|e| e.kind() == kind);
        *log = rest;
        matching
    }

    pub fn changes(&self) -> Vec<ChangeEvent> {
        self.events(EventKind::StateChange)
            .into_iter()
            .filter_map(|e| match e {
                Event::StateChange(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    /// Bridge responses as `(op, payload)`
    pub fn responses(&self) -> Vec<(String, Value)> {
        self.events(EventKind::BridgeResponse)
            .into_iter()
            .filter_map(|e| match e {
                Event::BridgeResponse { topic, payload } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn start(&mut self) {
        let failures = self.host.start_all(&mut self.core);
        assert!(failures.is_empty(), "extensions failed to start: {:?}", failures);
        self.host.drain(&mut self.core);
    }

    /// Emit an event as if another extension had, and deliver it
    pub fn emit(&mut self, event: Event) {
        self.core.emit(event);
        self.host.drain(&mut self.core);
    }

    pub fn stop(&mut self) {
        self.host.stop_all(&mut self.core);
        self.host.drain(&mut self.core);
    }

    pub fn radio(&mut self, event: RadioEvent) {
        intake::handle_radio_event(&mut self.core, event).unwrap();
        self.host.drain(&mut self.core);
    }

    pub fn mqtt(&mut self, topic: &str, payload: &str) {
        self.core.emit(Event::MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        self.host.drain(&mut self.core);
    }

    pub fn advance(&mut self, by: Duration) {
        let now = self.core.now() + by;
        self.host.fire_due(&mut self.core, now);
    }

    pub fn complete(&mut self, id: RequestId, command: RadioCommand, result: Result<RadioResponse, RadioError>) {
        self.core.emit(Event::RadioCompleted(RadioCompletion { id, command, result }));
        self.host.drain(&mut self.core);
    }

    /// Acknowledge every queued radio command, including ones queued by
    /// the acknowledgements; returns everything that was sent
    pub fn ack_all(&mut self) -> Vec<RadioCommand> {
        let mut sent = Vec::new();
        loop {
            let queued = self.core.take_radio_commands();
            if queued.is_empty() {
                return sent;
            }
            for (id, command) in queued {
                sent.push(command.clone());
                self.complete(id, command, Ok(RadioResponse::Ack));
            }
        }
    }

    pub fn take_radio(&mut self) -> Vec<(RequestId, RadioCommand)> {
        self.core.take_radio_commands()
    }

    pub fn take_publishes(&mut self) -> Vec<OutboundPublish> {
        self.core.take_publishes()
    }

    /// Payload of the last publish on a topic, parsed as JSON when possible
    pub fn last_publish(&mut self, topic: &str) -> Option<Value> {
        self.take_publishes()
            .into_iter()
            .filter(|p| p.topic == topic)
            .last()
            .map(|p| serde_json::from_str(&p.payload).unwrap_or(Value::String(p.payload)))
    }

    pub fn join(&mut self, n: u64, device_type: DeviceType, power_source: PowerSource) -> IeeeAddr {
        let ieee = IeeeAddr::from_u64(n);
        self.radio(RadioEvent::DeviceJoined(DeviceDescriptor {
            ieee_addr: ieee.clone(),
            network_address: n as u16,
            device_type,
            power_source,
            model_id: None,
            endpoints: vec![1],
        }));
        ieee
    }

    pub fn state(&self, entity: impl Into<EntityId>) -> Payload {
        self.core.store.get(&entity.into()).cloned().unwrap_or_default()
    }
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}
