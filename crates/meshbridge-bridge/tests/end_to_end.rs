//! Drives a complete bridge with the default extensions through mock
//! collaborators

use async_trait::async_trait;
use meshbridge_bridge::{
    default_extensions, Bridge, Broker, Core, Extension, Inbound, PersistedState, PublishError, Radio, RadioEvent,
};
use meshbridge_core::{
    ChangeEvent, DeviceDescriptor, DeviceMessage, DeviceType, EntityId, Event, EventKind, IeeeAddr, MessageKind,
    PowerSource, PublishOptions, RadioCommand, RadioError, RadioResponse, Settings, StateChangeReason,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Default)]
struct MockRadio {
    commands: Mutex<Vec<RadioCommand>>,
}

#[async_trait]
impl Radio for MockRadio {
    async fn execute(&self, command: RadioCommand) -> Result<RadioResponse, RadioError> {
        self.commands.lock().unwrap().push(command);
        Ok(RadioResponse::Ack)
    }
}

#[derive(Default)]
struct MockBroker {
    published: Mutex<Vec<(String, String, PublishOptions)>>,
}

impl MockBroker {
    fn payloads(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, payload, _)| serde_json::from_str(payload).unwrap_or(Value::String(payload.clone())))
            .collect()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string(), options));
        Ok(())
    }
}

type Changes = Arc<Mutex<Vec<ChangeEvent>>>;

struct ChangeLog {
    changes: Changes,
}

impl Extension for ChangeLog {
    fn name(&self) -> &'static str {
        "change_log"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![EventKind::StateChange]
    }

    fn on_event(&mut self, _core: &mut Core, event: &Event) -> meshbridge_bridge::Result<()> {
        if let Event::StateChange(change) = event {
            self.changes.lock().unwrap().push(change.clone());
        }
        Ok(())
    }
}

struct Fixture {
    bridge: Bridge,
    radio: Arc<MockRadio>,
    broker: Arc<MockBroker>,
    changes: Changes,
}

fn fixture(state_path: Option<PathBuf>) -> Fixture {
    let radio = Arc::new(MockRadio::default());
    let broker = Arc::new(MockBroker::default());
    let changes = Changes::default();
    let mut extensions = default_extensions(state_path);
    extensions.push(Box::new(ChangeLog {
        changes: changes.clone(),
    }));
    let bridge = Bridge::with_extensions(Settings::default(), radio.clone(), broker.clone(), extensions);
    Fixture {
        bridge,
        radio,
        broker,
        changes,
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn joined(n: u64) -> Inbound {
    Inbound::Radio(RadioEvent::DeviceJoined(DeviceDescriptor {
        ieee_addr: IeeeAddr::from_u64(n),
        network_address: n as u16,
        device_type: DeviceType::Router,
        power_source: PowerSource::Mains,
        model_id: None,
        endpoints: vec![1],
    }))
}

fn report(n: u64, data: Value) -> Inbound {
    Inbound::Radio(RadioEvent::Message(DeviceMessage {
        device: IeeeAddr::from_u64(n),
        endpoint: 1,
        kind: MessageKind::AttributeReport,
        cluster: "genOnOff".to_string(),
        linkquality: None,
        group: None,
        data: data.as_object().cloned().unwrap_or_default(),
    }))
}

impl Fixture {
    async fn feed(&mut self, inbound: Inbound) {
        self.bridge.handle(inbound, now());
        self.bridge.settle().await;
    }

    fn take_changes(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

#[tokio::test(start_paused = true)]
async fn test_report_then_optimistic_command() {
    let mut f = fixture(None);
    f.bridge.start(now());
    f.bridge.settle().await;
    assert_eq!(f.broker.payloads("meshbridge/bridge/state"), vec![json!("online")]);

    let ieee = IeeeAddr::from_u64(1);
    let entity = EntityId::Device(ieee.clone());
    f.feed(joined(1)).await;
    f.take_changes();

    // a report lands in the store with one reason-less change
    f.feed(report(1, json!({"x": 1}))).await;
    let changes = f.take_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].reason, None);
    assert_eq!(changes[0].to["x"], 1);
    assert_eq!(f.bridge.core().store.get(&entity).unwrap()["x"], 1);
    assert_eq!(f.broker.payloads(&format!("meshbridge/{}", ieee)).last().unwrap()["x"], 1);

    // a broker command applies optimistically right away
    f.feed(Inbound::Broker {
        topic: format!("meshbridge/{}/set", ieee),
        payload: r#"{"x": 2}"#.to_string(),
    })
    .await;
    let changes = f.take_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].reason, Some(StateChangeReason::GroupOptimistic));
    assert_eq!(changes[0].to["x"], 2);
    assert!(f
        .radio
        .commands
        .lock()
        .unwrap()
        .iter()
        .any(|c| matches!(c, RadioCommand::Write { payload, .. } if payload.get("x") == Some(&json!(2)))));

    // nothing confirms it and nothing rolls it back
    tokio::time::advance(Duration::from_secs(30)).await;
    f.bridge.fire_due(now());
    f.bridge.settle().await;
    assert!(f.take_changes().is_empty());
    assert_eq!(f.bridge.core().store.get(&entity).unwrap()["x"], 2);

    f.bridge.stop(now());
    f.bridge.settle().await;
    assert_eq!(
        f.broker.payloads("meshbridge/bridge/state").last(),
        Some(&json!("offline"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_bridge_request_round_trip() {
    let mut f = fixture(None);
    f.bridge.start(now());
    f.feed(joined(1)).await;

    f.feed(Inbound::Broker {
        topic: "meshbridge/bridge/request/device/rename".to_string(),
        payload: json!({"from": IeeeAddr::from_u64(1).as_str(), "to": "hall/light", "transaction": 7}).to_string(),
    })
    .await;
    let responses = f.broker.payloads("meshbridge/bridge/response/device/rename");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["status"], "ok");
    assert_eq!(responses[0]["transaction"], 7);

    f.feed(report(1, json!({"state": "ON"}))).await;
    assert_eq!(f.broker.payloads("meshbridge/hall/light").last().unwrap()["state"], "ON");
}

#[tokio::test(start_paused = true)]
async fn test_run_until_shutdown() {
    let f = fixture(None);
    let Fixture {
        mut bridge, broker, ..
    } = f;
    let inbound = bridge.inbound();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        bridge
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        bridge
    });

    inbound.send(joined(1)).unwrap();
    inbound.send(report(1, json!({"temperature": 19.5}))).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop_tx.send(()).unwrap();
    let bridge = task.await.unwrap();

    assert_eq!(bridge.in_flight(), 0);
    let state = broker.payloads(&format!("meshbridge/{}", IeeeAddr::from_u64(1)));
    assert_eq!(state.last().unwrap()["temperature"], 19.5);
    assert_eq!(
        broker.payloads("meshbridge/bridge/state"),
        vec![json!("online"), json!("offline")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut f = fixture(Some(path.clone()));
    f.bridge.start(now());
    f.feed(joined(1)).await;
    f.feed(report(1, json!({"brightness": 128}))).await;
    f.bridge.stop(now());
    f.bridge.settle().await;

    let saved = PersistedState::load(&path).unwrap().unwrap();
    assert_eq!(saved.entities.len(), 1);

    let mut f = fixture(Some(path));
    f.bridge.start(now());
    f.bridge.settle().await;
    let entity = EntityId::Device(IeeeAddr::from_u64(1));
    assert_eq!(f.bridge.core().store.get(&entity).unwrap()["brightness"], 128);
    // the cached state goes out again on startup
    assert_eq!(
        f.broker.payloads(&format!("meshbridge/{}", IeeeAddr::from_u64(1))).last().unwrap()["brightness"],
        128
    );
}
