//! Keeps `state.json` in sync with the registry and the state cache
//!
//! Loaded once at start, before any other extension runs; saved every few
//! minutes and on shutdown. Availability is written for inspection only;
//! the availability tracker reclassifies devices from last seen on start.

use meshbridge_core::{Availability, EntityId, Event, EventKind, IeeeAddr, TimerKey};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::error::Result;
use crate::extension::Extension;
use crate::persist::{PersistedEntity, PersistedState};

const SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Persistence {
    path: Option<PathBuf>,
    availability: HashMap<IeeeAddr, Availability>,
}

impl Persistence {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            availability: HashMap::new(),
        }
    }

    fn enabled(&self, core: &Core) -> Option<PathBuf> {
        let advanced = &core.settings.advanced;
        if advanced.cache_state && advanced.cache_state_persistent {
            self.path.clone()
        } else {
            None
        }
    }

    fn restore(&mut self, core: &mut Core, state: PersistedState) -> Result<()> {
        let mut seeded = 0;
        for record in state.entities {
            if let Some(device) = record.device {
                core.restore_device(device)?;
            }
            if let Some(group) = record.group {
                core.restore_group(group)?;
            }
            if let (EntityId::Device(ieee), Some(last_seen)) = (&record.entity, record.last_seen) {
                let missing = core.registry.device(ieee).is_some_and(|d| d.last_seen().is_none());
                if missing {
                    core.registry.touch_last_seen(ieee, last_seen.at, last_seen.reason)?;
                }
            }
            if !core.store.is_registered(&record.entity) {
                debug!(entity = %record.entity, "Dropping state of unknown entity");
                continue;
            }
            core.store.seed(&record.entity, record.state)?;
            if let EntityId::Device(ieee) = &record.entity {
                self.availability.insert(ieee.clone(), record.availability);
            }
            seeded += 1;
        }
        info!(
            devices = core.registry.devices().count(),
            groups = core.registry.groups().count(),
            seeded,
            "Restored saved state"
        );
        Ok(())
    }

    fn snapshot(&self, core: &Core) -> PersistedState {
        let mut entities: Vec<PersistedEntity> = core
            .store
            .entities()
            .map(|entity| {
                let device = match entity {
                    EntityId::Device(ieee) => core.registry.device(ieee).cloned(),
                    EntityId::Group(_) => None,
                };
                let group = match entity {
                    EntityId::Group(id) => core.registry.group(*id).cloned(),
                    EntityId::Device(_) => None,
                };
                let availability = match entity {
                    EntityId::Device(ieee) => self.availability.get(ieee).copied().unwrap_or_default(),
                    EntityId::Group(_) => Availability::Unknown,
                };
                PersistedEntity {
                    entity: entity.clone(),
                    state: core.store.get(entity).cloned().unwrap_or_default(),
                    last_seen: device.as_ref().and_then(|d| d.last_seen().cloned()),
                    availability,
                    device,
                    group,
                }
            })
            .collect();
        entities.sort_by_key(|e| e.entity.to_string());
        PersistedState::new(core.utc_now(), entities)
    }

    fn save(&self, core: &Core) {
        let Some(path) = self.enabled(core) else {
            return;
        };
        if let Err(e) = self.snapshot(core).save(&path) {
            warn!(path = %path.display(), error = %e, "Failed to save state");
        }
    }
}

impl Extension for Persistence {
    fn name(&self) -> &'static str {
        "persistence"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::AvailabilityChanged,
            EventKind::DeviceLeave,
            EventKind::TimerExpired,
        ]
    }

    fn start(&mut self, core: &mut Core) -> Result<()> {
        let Some(path) = self.enabled(core) else {
            debug!("State persistence disabled");
            return Ok(());
        };
        if let Some(state) = PersistedState::load(&path)? {
            self.restore(core, state)?;
        }
        let at = core.now() + SAVE_INTERVAL;
        core.timers.set(TimerKey::PersistState, at);
        Ok(())
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::AvailabilityChanged { device, to, .. } => {
                self.availability.insert(device.clone(), *to);
            }
            Event::DeviceLeave { ieee_addr, .. } => {
                self.availability.remove(ieee_addr);
            }
            Event::TimerExpired(TimerKey::PersistState) => {
                self.save(core);
                let at = core.now() + SAVE_INTERVAL;
                core.timers.set(TimerKey::PersistState, at);
            }
            _ => {}
        }
        Ok(())
    }

    fn stop(&mut self, core: &mut Core) {
        core.timers.cancel(&TimerKey::PersistState);
        self.save(core);
    }
}
