//! Radio intake: turns raw radio events into registry updates and bus events

use meshbridge_core::{
    DeviceDescriptor, DeviceType, EntityId, Event, IeeeAddr, InterviewStatus, LastSeenReason, PowerSource,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collab::RadioEvent;
use crate::core::Core;
use crate::error::Result;

pub fn handle_radio_event(core: &mut Core, event: RadioEvent) -> Result<()> {
    match event {
        RadioEvent::DeviceJoined(descriptor) => {
            let ieee = descriptor.ieee_addr.clone();
            let created = core.register_device(descriptor)?;
            info!(device = %ieee, new = created, "Device joined");
            core.emit(Event::DeviceJoined { device: ieee.clone() });
            if created {
                let notice = notice_data(core, &ieee);
                core.emit(Event::BridgeNotice {
                    kind: "device_joined".to_string(),
                    data: notice,
                });
            }
            touch(core, &ieee, LastSeenReason::DeviceJoined)?;
        }
        RadioEvent::DeviceInterview {
            ieee_addr,
            status,
            definition,
        } => {
            ensure_device(core, &ieee_addr, 1)?;
            let event = core.registry.set_interview(&ieee_addr, status)?;
            let mut exposes_changed = None;
            if let (InterviewStatus::Successful, Some(definition)) = (status, definition) {
                exposes_changed = core.registry.apply_definition(&ieee_addr, definition)?;
            }
            info!(device = %ieee_addr, ?status, "Device interview");
            core.emit(event);
            core.emit_all(exposes_changed);

            let mut notice = notice_data(core, &ieee_addr);
            notice["status"] = json!(status);
            core.emit(Event::BridgeNotice {
                kind: "device_interview".to_string(),
                data: notice,
            });
        }
        RadioEvent::DeviceAnnounce {
            ieee_addr,
            network_address,
        } => {
            if core.registry.device(&ieee_addr).is_none() {
                debug!(device = %ieee_addr, "Announce from unknown device ignored");
                return Ok(());
            }
            let changed = core.registry.set_network_address(&ieee_addr, network_address)?;
            core.emit_all(changed);
            core.emit(Event::DeviceAnnounce {
                device: ieee_addr.clone(),
            });
            touch(core, &ieee_addr, LastSeenReason::DeviceAnnounce)?;
        }
        RadioEvent::NetworkAddressChanged {
            ieee_addr,
            network_address,
        } => {
            if core.registry.device(&ieee_addr).is_none() {
                debug!(device = %ieee_addr, "Address change for unknown device ignored");
                return Ok(());
            }
            if let Some(event) = core.registry.set_network_address(&ieee_addr, network_address)? {
                core.emit(event);
                touch(core, &ieee_addr, LastSeenReason::NetworkAddress)?;
            }
        }
        RadioEvent::DeviceLeave { ieee_addr } => {
            let Some(name) = core.registry.device(&ieee_addr).map(|d| d.friendly_name().to_string()) else {
                debug!(device = %ieee_addr, "Leave from unknown device ignored");
                return Ok(());
            };
            info!(device = %ieee_addr, name = %name, "Device left the network");
            core.emit(Event::DeviceLeave {
                ieee_addr: ieee_addr.clone(),
                name: name.clone(),
            });
            core.emit(Event::BridgeNotice {
                kind: "device_leave".to_string(),
                data: json!({"ieee_address": ieee_addr, "friendly_name": name}),
            });
            core.remove_device(&ieee_addr)?;
        }
        RadioEvent::Message(message) => {
            ensure_device(core, &message.device, message.endpoint)?;
            let disabled = core
                .registry
                .device(&message.device)
                .is_some_and(|d| d.options().is_disabled());
            if disabled {
                debug!(device = %message.device, "Message from disabled device ignored");
                return Ok(());
            }
            core.emit(Event::DeviceMessage(message));
        }
        RadioEvent::OtaProgress { ieee_addr, percent } => {
            if core.registry.device(&ieee_addr).is_none() {
                warn!(device = %ieee_addr, "OTA progress for unknown device");
                return Ok(());
            }
            core.emit(Event::OtaProgress {
                device: ieee_addr,
                percent,
            });
        }
    }
    Ok(())
}

/// Devices are created on first sight, whatever the event
fn ensure_device(core: &mut Core, ieee: &IeeeAddr, endpoint: u8) -> Result<()> {
    if core.registry.device(ieee).is_some() {
        return Ok(());
    }
    debug!(device = %ieee, "Creating device from first message");
    core.register_device(DeviceDescriptor {
        ieee_addr: ieee.clone(),
        network_address: 0,
        device_type: DeviceType::Unknown,
        power_source: PowerSource::Unknown,
        model_id: None,
        endpoints: vec![endpoint],
    })?;
    Ok(())
}

fn touch(core: &mut Core, ieee: &IeeeAddr, reason: LastSeenReason) -> Result<()> {
    let at = core.utc_now();
    let event = core.registry.touch_last_seen(ieee, at, reason)?;
    core.emit(event);
    Ok(())
}

fn notice_data(core: &Core, ieee: &IeeeAddr) -> serde_json::Value {
    core.registry.describe(&EntityId::Device(ieee.clone()))
}
