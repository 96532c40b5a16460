//! Firmware update checks and transfers
//!
//! Devices that support OTA are checked on a fixed interval. Updates only
//! start on request; a failed update parks the device in `Failed` until
//! someone asks again.

use meshbridge_core::firmware::{is_newer, update_attribute};
use meshbridge_core::{
    EntityId, Event, EventKind, IeeeAddr, InterviewStatus, OtaState, Payload, RadioCommand, RadioCompletion,
    RadioError, RadioResponse, RequestId, TimerKey,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::BridgeRequest;
use crate::core::Core;
use crate::error::{BridgeError, Result};
use crate::extension::Extension;

pub const OPERATIONS: &[&str] = &[
    "device/ota_update/check",
    "device/ota_update/update",
    "device/ota_update/cancel",
];

#[derive(Debug, Clone, Default)]
struct Entry {
    state: OtaState,
    latest: Option<u32>,
    progress: Option<f32>,
    cancel_requested: bool,
}

enum Pending {
    Check {
        device: IeeeAddr,
        request: Option<BridgeRequest>,
    },
    Update {
        device: IeeeAddr,
        request: BridgeRequest,
    },
    Abort {
        device: IeeeAddr,
    },
}

#[derive(Default)]
pub struct Ota {
    entries: HashMap<IeeeAddr, Entry>,
    pending: HashMap<RequestId, Pending>,
}

impl Ota {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, ieee: &IeeeAddr) -> OtaState {
        self.entries.get(ieee).map(|e| e.state).unwrap_or_default()
    }

    fn schedule(&self, core: &mut Core, ieee: &IeeeAddr) {
        if core.settings.ota.disable_automatic_update_check {
            return;
        }
        let at = core.now() + core.settings.ota.check_interval();
        core.timers.set(TimerKey::OtaCheck(ieee.clone()), at);
    }

    fn transition(&mut self, core: &mut Core, ieee: &IeeeAddr, to: OtaState, error: Option<String>) -> Result<()> {
        let entry = self.entries.entry(ieee.clone()).or_default();
        let from = entry.state;
        entry.state = to;
        if to != OtaState::Updating {
            entry.progress = None;
            entry.cancel_requested = false;
        }
        if from != to {
            info!(device = %ieee, from = from.as_str(), to = to.as_str(), "OTA state changed");
            core.emit(Event::OtaStateChanged {
                device: ieee.clone(),
                from,
                to,
                error,
            });
        }
        self.write_attribute(core, ieee)
    }

    /// Mirror the entry into the `update` attribute of the device state
    fn write_attribute(&self, core: &mut Core, ieee: &IeeeAddr) -> Result<()> {
        let Some(entry) = self.entries.get(ieee) else {
            return Ok(());
        };
        let installed = core.registry.device(ieee).and_then(|d| d.firmware_version());
        let mut update = Payload::new();
        update.insert(
            "update".to_string(),
            update_attribute(entry.state, entry.progress, installed, entry.latest),
        );
        let changes = core.store.set(&EntityId::Device(ieee.clone()), update, None)?;
        core.emit_changes(changes);
        Ok(())
    }

    fn check(&mut self, core: &mut Core, ieee: &IeeeAddr, request: Option<BridgeRequest>) -> Result<()> {
        core.timers.cancel(&TimerKey::OtaCheck(ieee.clone()));
        let id = core.send_radio(RadioCommand::OtaCheck { device: ieee.clone() });
        self.pending.insert(
            id,
            Pending::Check {
                device: ieee.clone(),
                request,
            },
        );
        self.transition(core, ieee, OtaState::Checking, None)
    }

    fn on_timer(&mut self, core: &mut Core, ieee: &IeeeAddr) -> Result<()> {
        let supported = core.registry.device(ieee).is_some_and(|d| d.supports_ota());
        if !supported {
            self.entries.remove(ieee);
            return Ok(());
        }
        let state = self.state(ieee);
        if !state.accepts_scheduled_check() {
            debug!(device = %ieee, state = state.as_str(), "Skipping scheduled OTA check");
            self.schedule(core, ieee);
            return Ok(());
        }
        debug!(device = %ieee, "Scheduled OTA check");
        self.check(core, ieee, None)
    }

    fn on_request(&mut self, core: &mut Core, request: BridgeRequest) -> Result<()> {
        let result = self.handle(core, &request);
        match result {
            // answered when the radio completes
            Ok(None) => Ok(()),
            Ok(Some(data)) => {
                request.respond_ok(core, data);
                Ok(())
            }
            Err(e) => {
                request.respond_error(core, &e);
                Ok(())
            }
        }
    }

    fn handle(&mut self, core: &mut Core, request: &BridgeRequest) -> Result<Option<Value>> {
        let id = request.field("id")?;
        let ieee = match core.registry.resolve(&id) {
            Some(EntityId::Device(ieee)) => ieee,
            _ => return Err(BridgeError::UnknownEntity(id)),
        };
        if !core.registry.device(&ieee).is_some_and(|d| d.supports_ota()) {
            return Err(BridgeError::InvalidRequest(format!("device '{}' does not support OTA updates", id)));
        }
        let state = self.state(&ieee);

        match request.op.as_str() {
            "device/ota_update/check" => {
                if state.is_busy() {
                    return Err(BridgeError::InvalidRequest(format!(
                        "device '{}' is already {}",
                        id,
                        state.as_str()
                    )));
                }
                self.check(core, &ieee, Some(request.clone()))?;
                Ok(None)
            }
            "device/ota_update/update" => {
                if state.is_busy() {
                    return Err(BridgeError::InvalidRequest(format!(
                        "device '{}' is already {}",
                        id,
                        state.as_str()
                    )));
                }
                core.timers.cancel(&TimerKey::OtaCheck(ieee.clone()));
                let command_id = core.send_radio(RadioCommand::OtaUpdate { device: ieee.clone() });
                self.pending.insert(
                    command_id,
                    Pending::Update {
                        device: ieee.clone(),
                        request: request.clone(),
                    },
                );
                info!(device = %ieee, "Starting OTA update");
                self.transition(core, &ieee, OtaState::Updating, None)?;
                Ok(None)
            }
            "device/ota_update/cancel" => {
                if state != OtaState::Updating {
                    return Err(BridgeError::InvalidRequest(format!("device '{}' is not updating", id)));
                }
                if let Some(entry) = self.entries.get_mut(&ieee) {
                    entry.cancel_requested = true;
                }
                info!(device = %ieee, "OTA update cancel requested");
                Ok(Some(json!({"id": id})))
            }
            op => Err(BridgeError::InvalidRequest(format!("unknown request '{}'", op))),
        }
    }

    fn on_progress(&mut self, core: &mut Core, ieee: &IeeeAddr, percent: f32) -> Result<()> {
        let Some(entry) = self.entries.get_mut(ieee) else {
            return Ok(());
        };
        if entry.state != OtaState::Updating {
            return Ok(());
        }
        if entry.cancel_requested {
            entry.cancel_requested = false;
            info!(device = %ieee, percent, "Aborting OTA update");
            let id = core.send_radio(RadioCommand::OtaAbort { device: ieee.clone() });
            self.pending.insert(id, Pending::Abort { device: ieee.clone() });
            return Ok(());
        }
        entry.progress = Some(percent);
        self.write_attribute(core, ieee)
    }

    fn on_completion(&mut self, core: &mut Core, completion: &RadioCompletion) -> Result<()> {
        let Some(pending) = self.pending.remove(&completion.id) else {
            return Ok(());
        };
        match pending {
            Pending::Check { device, request } => {
                self.schedule(core, &device);
                match &completion.result {
                    Ok(RadioResponse::OtaCheck {
                        update_available,
                        latest_version,
                    }) => {
                        let installed = core.registry.device(&device).and_then(|d| d.firmware_version());
                        let available = is_newer(installed, *latest_version, *update_available);
                        self.entries.entry(device.clone()).or_default().latest = *latest_version;
                        let to = if available { OtaState::UpdateAvailable } else { OtaState::Idle };
                        debug!(device = %device, available, "OTA check finished");
                        self.transition(core, &device, to, None)?;
                        if let Some(request) = request {
                            request.respond_ok(core, json!({"id": request.field("id")?, "update_available": available}));
                        }
                    }
                    result => {
                        let error = describe_failure(result);
                        warn!(device = %device, error = %error, "OTA check failed");
                        self.transition(core, &device, OtaState::Idle, Some(error.clone()))?;
                        if let Some(request) = request {
                            request.respond_error(core, error);
                        }
                    }
                }
            }
            Pending::Update { device, request } => {
                let from = core.registry.device(&device).and_then(|d| d.firmware_version());
                match &completion.result {
                    Ok(RadioResponse::OtaUpdated { version }) => {
                        let latest = self.entries.get(&device).and_then(|e| e.latest);
                        let to = version.or(latest);
                        core.registry.set_firmware_version(&device, to)?;
                        info!(device = %device, ?from, ?to, "OTA update finished");
                        self.transition(core, &device, OtaState::Idle, None)?;
                        request.respond_ok(core, json!({"id": request.field("id")?, "from": from, "to": to}));
                    }
                    Err(RadioError::Cancelled) => {
                        info!(device = %device, "OTA update cancelled");
                        self.transition(core, &device, OtaState::Idle, Some(RadioError::Cancelled.to_string()))?;
                        request.respond_error(core, RadioError::Cancelled);
                    }
                    result => {
                        let error = describe_failure(result);
                        warn!(device = %device, error = %error, "OTA update failed");
                        self.transition(core, &device, OtaState::Failed, Some(error.clone()))?;
                        request.respond_error(core, error);
                    }
                }
                self.schedule(core, &device);
            }
            Pending::Abort { device } => {
                if let Err(e) = &completion.result {
                    warn!(device = %device, error = %e, "OTA abort failed");
                }
            }
        }
        Ok(())
    }

    fn forget(&mut self, core: &mut Core, ieee: &IeeeAddr) {
        self.entries.remove(ieee);
        core.timers.cancel(&TimerKey::OtaCheck(ieee.clone()));
    }
}

fn describe_failure(result: &std::result::Result<RadioResponse, RadioError>) -> String {
    match result {
        Ok(response) => format!("unexpected response {:?}", response),
        Err(e) => e.to_string(),
    }
}

impl Extension for Ota {
    fn name(&self) -> &'static str {
        "ota"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::MqttMessage,
            EventKind::DeviceInterview,
            EventKind::DeviceLeave,
            EventKind::EntityRemoved,
            EventKind::OtaProgress,
            EventKind::RadioCompleted,
            EventKind::TimerExpired,
        ]
    }

    fn start(&mut self, core: &mut Core) -> Result<()> {
        let devices: Vec<IeeeAddr> = core
            .registry
            .devices()
            .filter(|d| d.supports_ota())
            .map(|d| d.ieee_addr().clone())
            .collect();
        for ieee in &devices {
            self.schedule(core, ieee);
        }
        debug!(devices = devices.len(), "OTA checks scheduled");
        Ok(())
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::MqttMessage { topic, payload } => {
                if let Some(request) = BridgeRequest::parse(core, topic, payload) {
                    if OPERATIONS.contains(&request.op.as_str()) {
                        self.on_request(core, request)?;
                    }
                }
            }
            Event::DeviceInterview {
                device,
                status: InterviewStatus::Successful,
            } => {
                let supported = core.registry.device(device).is_some_and(|d| d.supports_ota());
                if supported && core.timers.deadline(&TimerKey::OtaCheck(device.clone())).is_none() {
                    self.schedule(core, device);
                }
            }
            Event::DeviceLeave { ieee_addr, .. } => self.forget(core, ieee_addr),
            Event::EntityRemoved {
                entity: EntityId::Device(ieee),
                ..
            } => self.forget(core, ieee),
            Event::OtaProgress { device, percent } => self.on_progress(core, device, *percent)?,
            Event::RadioCompleted(completion) => self.on_completion(core, completion)?,
            Event::TimerExpired(TimerKey::OtaCheck(ieee)) => self.on_timer(core, ieee)?,
            _ => {}
        }
        Ok(())
    }

    fn stop(&mut self, core: &mut Core) {
        core.timers.cancel_where(|key| matches!(key, TimerKey::OtaCheck(_)));
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::RadioEvent;
    use crate::testing::Harness;
    use meshbridge_core::{DeviceDefinition, DeviceType, PowerSource, Settings};
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn harness(settings: Settings) -> (Harness, IeeeAddr) {
        let mut h = Harness::new(settings, vec![Box::new(Ota::new())]);
        h.start();
        let ieee = h.join(1, DeviceType::Router, PowerSource::Mains);
        h.radio(RadioEvent::DeviceInterview {
            ieee_addr: ieee.clone(),
            status: InterviewStatus::Successful,
            definition: Some(DeviceDefinition {
                supports_ota: true,
                firmware_version: Some(3),
                ..Default::default()
            }),
        });
        h.take_radio();
        h.clear_events();
        (h, ieee)
    }

    fn states(h: &Harness) -> Vec<(OtaState, OtaState)> {
        h.events(EventKind::OtaStateChanged)
            .into_iter()
            .filter_map(|e| match e {
                Event::OtaStateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn request(h: &mut Harness, op: &str, id: &IeeeAddr) {
        h.mqtt(
            &format!("meshbridge/bridge/request/{}", op),
            &json!({"id": id.as_str()}).to_string(),
        );
    }

    #[test]
    fn test_scheduled_check() {
        let (mut h, ieee) = harness(Settings::default());
        h.advance(DAY);
        let (id, command) = h.take_radio().remove(0);
        assert_eq!(command, RadioCommand::OtaCheck { device: ieee.clone() });
        h.complete(
            id,
            command,
            Ok(RadioResponse::OtaCheck {
                update_available: true,
                latest_version: Some(4),
            }),
        );
        assert_eq!(
            states(&h),
            vec![
                (OtaState::Idle, OtaState::Checking),
                (OtaState::Checking, OtaState::UpdateAvailable)
            ]
        );
        let update = &h.state(ieee.clone())["update"];
        assert_eq!(update["state"], "available");
        assert_eq!(update["installed_version"], 3);
        assert_eq!(update["latest_version"], 4);

        // and again a day later
        h.advance(DAY);
        assert_eq!(h.take_radio().len(), 1);
    }

    #[test]
    fn test_automatic_checks_disabled() {
        let mut settings = Settings::default();
        settings.ota.disable_automatic_update_check = true;
        let (mut h, ieee) = harness(settings);
        h.advance(DAY * 3);
        assert!(h.take_radio().is_empty());

        // manual checks still work
        request(&mut h, "device/ota_update/check", &ieee);
        let (id, command) = h.take_radio().remove(0);
        h.complete(
            id,
            command,
            Ok(RadioResponse::OtaCheck {
                update_available: false,
                latest_version: Some(3),
            }),
        );
        let (_, response) = h.responses().remove(0);
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["update_available"], false);
    }

    #[test]
    fn test_check_failure_returns_to_idle() {
        let (mut h, ieee) = harness(Settings::default());
        request(&mut h, "device/ota_update/check", &ieee);
        let (id, command) = h.take_radio().remove(0);
        h.complete(id, command, Err(RadioError::Timeout(ieee.to_string())));
        assert_eq!(
            states(&h),
            vec![(OtaState::Idle, OtaState::Checking), (OtaState::Checking, OtaState::Idle)]
        );
        assert_eq!(h.responses().remove(0).1["status"], "error");
    }

    #[test]
    fn test_update_records_version() {
        let (mut h, ieee) = harness(Settings::default());
        request(&mut h, "device/ota_update/update", &ieee);
        let (id, command) = h.take_radio().remove(0);
        assert_eq!(command, RadioCommand::OtaUpdate { device: ieee.clone() });

        h.radio(RadioEvent::OtaProgress {
            ieee_addr: ieee.clone(),
            percent: 50.0,
        });
        assert_eq!(h.state(ieee.clone())["update"]["progress"], 50.0);

        h.complete(id, command, Ok(RadioResponse::OtaUpdated { version: Some(5) }));
        assert_eq!(h.core.registry.device(&ieee).unwrap().firmware_version(), Some(5));
        let update = &h.state(ieee.clone())["update"];
        assert_eq!(update["state"], "idle");
        assert_eq!(update["installed_version"], 5);
        assert!(update.get("progress").is_none());

        let (_, response) = h.responses().remove(0);
        assert_eq!(response["data"]["from"], 3);
        assert_eq!(response["data"]["to"], 5);
    }

    #[test]
    fn test_failed_update_needs_manual_retry() {
        let (mut h, ieee) = harness(Settings::default());
        request(&mut h, "device/ota_update/update", &ieee);
        let (id, command) = h.take_radio().remove(0);
        h.complete(id, command, Err(RadioError::Rejected("image corrupt".into())));
        assert_eq!(states(&h).last(), Some(&(OtaState::Updating, OtaState::Failed)));

        // scheduled checks leave it alone
        h.advance(DAY * 2);
        assert!(h.take_radio().is_empty());
        assert_eq!(h.state(ieee.clone())["update"]["state"], "failed");

        request(&mut h, "device/ota_update/update", &ieee);
        assert_eq!(h.take_radio().len(), 1);
        assert_eq!(states(&h).last(), Some(&(OtaState::Failed, OtaState::Updating)));
    }

    #[test]
    fn test_cancel_at_next_checkpoint() {
        let (mut h, ieee) = harness(Settings::default());
        request(&mut h, "device/ota_update/cancel", &ieee);
        assert_eq!(h.responses().remove(0).1["status"], "error");

        request(&mut h, "device/ota_update/update", &ieee);
        let (id, command) = h.take_radio().remove(0);
        request(&mut h, "device/ota_update/cancel", &ieee);
        assert_eq!(h.responses().remove(0).1["status"], "ok");
        assert!(h.take_radio().is_empty());

        h.radio(RadioEvent::OtaProgress {
            ieee_addr: ieee.clone(),
            percent: 10.0,
        });
        let sent = h.ack_all();
        assert_eq!(sent, vec![RadioCommand::OtaAbort { device: ieee.clone() }]);

        h.complete(id, command, Err(RadioError::Cancelled));
        assert_eq!(states(&h).last(), Some(&(OtaState::Updating, OtaState::Idle)));
        assert_eq!(h.responses().remove(0).1["status"], "error");
    }

    #[test]
    fn test_busy_device_rejects_requests() {
        let (mut h, ieee) = harness(Settings::default());
        request(&mut h, "device/ota_update/update", &ieee);
        h.take_radio();
        h.clear_events();
        request(&mut h, "device/ota_update/check", &ieee);
        assert!(h.take_radio().is_empty());
        assert_eq!(h.responses().remove(0).1["status"], "error");
    }
}
