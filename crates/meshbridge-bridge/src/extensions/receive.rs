//! Applies device reports to the state store

use meshbridge_core::{
    DeviceMessage, EntityId, Event, EventKind, LastSeenReason, StateChangeReason,
};
use serde_json::json;
use tracing::trace;

use crate::core::Core;
use crate::error::Result;
use crate::extension::Extension;

#[derive(Default)]
pub struct Receive;

impl Receive {
    pub fn new() -> Self {
        Self
    }

    fn on_message(&mut self, core: &mut Core, message: &DeviceMessage) -> Result<()> {
        let entity = EntityId::Device(message.device.clone());
        if !core.store.is_registered(&entity) {
            return Ok(());
        }

        let mut update = message.data.clone();
        if let Some(linkquality) = message.linkquality {
            update.insert("linkquality".to_string(), json!(linkquality));
        }

        let changes = if update.is_empty() {
            Vec::new()
        } else {
            core.store.report(&entity, update, core.now())?
        };
        let emitted = !changes.is_empty() || core.store.has_pending(&entity);
        trace!(device = %message.device, changes = changes.len(), "Device message applied");

        // last seen is updated before the changes go out so they carry it
        let reason = if emitted {
            LastSeenReason::MessageEmitted
        } else {
            LastSeenReason::MessageNonEmitted
        };
        let last_seen = core.registry.touch_last_seen(&message.device, core.utc_now(), reason)?;
        core.emit_changes(changes);
        core.emit(last_seen);
        Ok(())
    }
}

impl Extension for Receive {
    fn name(&self) -> &'static str {
        "receive"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![EventKind::DeviceMessage, EventKind::LastSeenChanged]
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::DeviceMessage(message) => self.on_message(core, message),
            Event::LastSeenChanged {
                device,
                reason: LastSeenReason::MessageNonEmitted,
            } if core.settings.advanced.last_seen.is_enabled() => {
                // nothing else goes out for this message, so refresh last_seen on its own
                let entity = EntityId::Device(device.clone());
                if core.store.is_registered(&entity) {
                    let change = core.store.republish(&entity, StateChangeReason::LastSeenChanged)?;
                    core.emit(Event::StateChange(change));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
