//! Device availability tracking
//!
//! Every eligible device has a deadline; any traffic moves it to online and
//! pushes the deadline out by its timeout, expiry marks it offline.
//! Always-listening devices (routers, mains powered) use the active timeout
//! and are pinged at half of it so a quiet but healthy device stays online.
//! A failed ping only schedules a retry at a quarter of the timeout; the
//! deadline alone decides offline.

use meshbridge_core::settings::AvailabilityOverride;
use meshbridge_core::{
    Availability, Device, EntityId, Event, EventKind, IeeeAddr, InterviewStatus, RadioCommand, RadioCompletion,
    RequestId, TimerKey,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::Core;
use crate::error::Result;
use crate::extension::Extension;

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: Availability,
    timeout: Duration,
    active: bool,
}

#[derive(Default)]
pub struct AvailabilityTracker {
    entries: HashMap<IeeeAddr, Entry>,
    pings: HashMap<RequestId, IeeeAddr>,
}

/// Timeout and active flag of a device, `None` when it is not tracked
fn tracking(core: &Core, device: &Device) -> Option<(Duration, bool)> {
    if device.is_coordinator() || device.options().is_disabled() {
        return None;
    }
    let settings = &core.settings.availability;
    let custom = match device.options().availability {
        Some(AvailabilityOverride::Enabled(false)) => return None,
        Some(AvailabilityOverride::Enabled(true)) => None,
        Some(AvailabilityOverride::Timeout { timeout }) => Some(Duration::from_secs(timeout * 60)),
        None if settings.enabled => None,
        None => return None,
    };
    let active = device.is_always_listening();
    let timeout = custom.unwrap_or_else(|| {
        if active {
            settings.active.duration()
        } else {
            settings.passive.duration()
        }
    });
    Some((timeout, active))
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, ieee: &IeeeAddr) -> Option<Availability> {
        self.entries.get(ieee).map(|e| e.state)
    }

    /// Create or refresh the entry of a device; returns false if it is not tracked
    fn track(&mut self, core: &mut Core, ieee: &IeeeAddr) -> bool {
        let Some((timeout, active)) = core.registry.device(ieee).and_then(|d| tracking(core, d)) else {
            self.forget(core, ieee);
            return false;
        };
        match self.entries.get_mut(ieee) {
            Some(entry) if entry.timeout == timeout && entry.active == active => {}
            Some(entry) => {
                entry.timeout = timeout;
                entry.active = active;
                self.arm(core, ieee);
            }
            None => {
                self.entries.insert(
                    ieee.clone(),
                    Entry {
                        state: Availability::Unknown,
                        timeout,
                        active,
                    },
                );
                self.arm(core, ieee);
            }
        }
        true
    }

    /// Deadline from now, plus the poll for active devices
    fn arm(&self, core: &mut Core, ieee: &IeeeAddr) {
        let Some(entry) = self.entries.get(ieee) else {
            return;
        };
        let now = core.now();
        core.timers.set(TimerKey::AvailabilityDeadline(ieee.clone()), now + entry.timeout);
        if entry.active {
            core.timers.set(TimerKey::AvailabilityPoll(ieee.clone()), now + entry.timeout / 2);
        }
    }

    fn forget(&mut self, core: &mut Core, ieee: &IeeeAddr) {
        if self.entries.remove(ieee).is_some() {
            debug!(device = %ieee, "No longer tracking availability");
        }
        core.timers.cancel(&TimerKey::AvailabilityDeadline(ieee.clone()));
        core.timers.cancel(&TimerKey::AvailabilityPoll(ieee.clone()));
        self.pings.retain(|_, device| device != ieee);
    }

    fn transition(&mut self, core: &mut Core, ieee: &IeeeAddr, to: Availability) {
        let Some(entry) = self.entries.get_mut(ieee) else {
            return;
        };
        let from = entry.state;
        if from == to {
            return;
        }
        entry.state = to;
        info!(device = %ieee, from = from.as_str(), to = to.as_str(), "Availability changed");
        core.emit(Event::AvailabilityChanged {
            device: ieee.clone(),
            from,
            to,
        });
    }

    fn seen(&mut self, core: &mut Core, ieee: &IeeeAddr) {
        if !self.entries.contains_key(ieee) && !self.track(core, ieee) {
            return;
        }
        self.arm(core, ieee);
        self.transition(core, ieee, Availability::Online);
    }

    /// Classify a device from its last-seen time, as at startup
    fn classify(&mut self, core: &mut Core, ieee: &IeeeAddr) {
        if !self.track(core, ieee) {
            return;
        }
        let Some(entry) = self.entries.get(ieee).copied() else {
            return;
        };
        let Some(last_seen) = core.registry.device(ieee).and_then(|d| d.last_seen()).map(|s| s.at) else {
            return;
        };
        let elapsed = (core.utc_now() - last_seen).to_std().unwrap_or_default();
        if elapsed >= entry.timeout {
            core.timers.cancel(&TimerKey::AvailabilityDeadline(ieee.clone()));
            self.transition(core, ieee, Availability::Offline);
            return;
        }
        let now = core.now();
        let remaining = entry.timeout - elapsed;
        core.timers.set(TimerKey::AvailabilityDeadline(ieee.clone()), now + remaining);
        if entry.active {
            // the ping must be answered before the shortened deadline
            let poll = (remaining / 2).min(entry.timeout / 2);
            core.timers.set(TimerKey::AvailabilityPoll(ieee.clone()), now + poll);
        }
        self.transition(core, ieee, Availability::Online);
    }

    fn on_timer(&mut self, core: &mut Core, key: &TimerKey) {
        match key {
            TimerKey::AvailabilityDeadline(ieee) if self.entries.contains_key(ieee) => {
                debug!(device = %ieee, "Availability deadline passed");
                self.transition(core, ieee, Availability::Offline);
            }
            TimerKey::AvailabilityPoll(ieee) if self.entries.contains_key(ieee) => {
                let id = core.send_radio(RadioCommand::Ping { device: ieee.clone() });
                self.pings.insert(id, ieee.clone());
            }
            _ => {}
        }
    }

    fn on_completion(&mut self, core: &mut Core, completion: &RadioCompletion) {
        let Some(ieee) = self.pings.remove(&completion.id) else {
            return;
        };
        match &completion.result {
            Ok(_) => self.seen(core, &ieee),
            Err(e) => {
                let Some(entry) = self.entries.get(&ieee) else {
                    return;
                };
                debug!(device = %ieee, error = %e, "Ping failed, retrying");
                let retry = core.now() + entry.timeout / 4;
                core.timers.set(TimerKey::AvailabilityPoll(ieee), retry);
            }
        }
    }
}

impl Extension for AvailabilityTracker {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::DeviceJoined,
            EventKind::DeviceInterview,
            EventKind::DeviceAnnounce,
            EventKind::DeviceMessage,
            EventKind::LastSeenChanged,
            EventKind::DeviceLeave,
            EventKind::EntityRemoved,
            EventKind::EntityOptionsChanged,
            EventKind::RadioCompleted,
            EventKind::TimerExpired,
        ]
    }

    fn start(&mut self, core: &mut Core) -> Result<()> {
        let devices: Vec<IeeeAddr> = core.registry.devices().map(|d| d.ieee_addr().clone()).collect();
        for ieee in &devices {
            self.classify(core, ieee);
        }
        debug!(tracked = self.entries.len(), "Availability tracking started");
        Ok(())
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()> {
        match event {
            Event::DeviceJoined { device }
            | Event::DeviceAnnounce { device }
            | Event::LastSeenChanged { device, .. }
            | Event::DeviceInterview {
                device,
                status: InterviewStatus::Successful,
            } => self.seen(core, device),
            Event::DeviceMessage(message) => self.seen(core, &message.device),
            Event::DeviceLeave { ieee_addr, .. } => self.forget(core, ieee_addr),
            Event::EntityRemoved {
                entity: EntityId::Device(ieee),
                ..
            } => self.forget(core, ieee),
            Event::EntityOptionsChanged {
                entity: EntityId::Device(ieee),
                ..
            } => {
                self.track(core, ieee);
            }
            Event::RadioCompleted(completion) => self.on_completion(core, completion),
            Event::TimerExpired(key) => self.on_timer(core, key),
            _ => {}
        }
        Ok(())
    }

    fn stop(&mut self, core: &mut Core) {
        core.timers.cancel_where(|key| {
            matches!(key, TimerKey::AvailabilityDeadline(_) | TimerKey::AvailabilityPoll(_))
        });
        self.pings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use meshbridge_core::{
        DeviceDescriptor, DeviceOptions, DeviceType, LastSeenReason, PowerSource, RadioError, RadioResponse,
        Settings,
    };

    const MINUTE: Duration = Duration::from_secs(60);

    fn transitions(h: &Harness) -> Vec<(Availability, Availability)> {
        h.events(EventKind::AvailabilityChanged)
            .into_iter()
            .filter_map(|e| match e {
                Event::AvailabilityChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn enabled() -> Settings {
        let mut settings = Settings::default();
        settings.availability.enabled = true;
        settings
    }

    fn harness(settings: Settings) -> Harness {
        let mut h = Harness::new(settings, vec![Box::new(AvailabilityTracker::new())]);
        h.start();
        h
    }

    /// A device known from a previous run, last seen `minutes_ago`
    fn known_device(h: &mut Harness, n: u64, device_type: DeviceType, power_source: PowerSource, minutes_ago: i64) {
        let ieee = IeeeAddr::from_u64(n);
        let utc = h.core.utc_now();
        h.core
            .register_device(DeviceDescriptor {
                ieee_addr: ieee.clone(),
                network_address: n as u16,
                device_type,
                power_source,
                model_id: None,
                endpoints: vec![1],
            })
            .unwrap();
        h.core
            .registry
            .touch_last_seen(&ieee, utc - chrono::Duration::minutes(minutes_ago), LastSeenReason::MessageEmitted)
            .unwrap();
    }

    #[test]
    fn test_passive_device_goes_offline() {
        let mut h = harness(enabled());
        let ieee = h.join(1, DeviceType::EndDevice, PowerSource::Battery);
        assert_eq!(transitions(&h), vec![(Availability::Unknown, Availability::Online)]);

        h.advance(1499 * MINUTE);
        assert!(transitions(&h).is_empty());
        assert!(h.take_radio().is_empty(), "passive devices are not pinged");

        h.advance(MINUTE);
        assert_eq!(transitions(&h), vec![(Availability::Online, Availability::Offline)]);

        // traffic brings it back
        h.emit(Event::DeviceAnnounce { device: ieee });
        assert_eq!(transitions(&h), vec![(Availability::Offline, Availability::Online)]);
    }

    #[test]
    fn test_active_device_kept_online_by_ping() {
        let mut h = harness(enabled());
        let ieee = h.join(1, DeviceType::Router, PowerSource::Mains);
        h.clear_events();

        h.advance(5 * MINUTE);
        let pings = h.take_radio();
        assert_eq!(pings.len(), 1);
        let (id, command) = pings[0].clone();
        assert_eq!(command, RadioCommand::Ping { device: ieee.clone() });
        h.complete(id, command, Ok(RadioResponse::Ack));

        h.advance(9 * MINUTE);
        assert!(transitions(&h).is_empty());
    }

    #[test]
    fn test_failed_ping_retries_without_marking_offline() {
        let mut h = harness(enabled());
        let ieee = h.join(1, DeviceType::Router, PowerSource::Mains);
        h.clear_events();

        h.advance(5 * MINUTE);
        let (id, command) = h.take_radio().remove(0);
        h.complete(id, command, Err(RadioError::Timeout(ieee.to_string())));
        assert!(transitions(&h).is_empty());
        assert_eq!(
            h.core.timers.deadline(&TimerKey::AvailabilityPoll(ieee.clone())),
            Some(h.core.now() + Duration::from_secs(150))
        );

        // the retry fails too; the deadline decides
        h.advance(Duration::from_secs(150));
        let (id, command) = h.take_radio().remove(0);
        h.complete(id, command, Err(RadioError::Timeout(ieee.to_string())));
        assert!(transitions(&h).is_empty());
        h.advance(Duration::from_secs(150));
        assert_eq!(transitions(&h), vec![(Availability::Online, Availability::Offline)]);
    }

    #[test]
    fn test_overrides() {
        let mut settings = Settings::default();
        settings.devices.insert(
            "0x0000000000000001".into(),
            DeviceOptions {
                availability: Some(AvailabilityOverride::Enabled(false)),
                ..Default::default()
            },
        );
        settings.devices.insert(
            "0x0000000000000002".into(),
            DeviceOptions {
                availability: Some(AvailabilityOverride::Timeout { timeout: 1 }),
                ..Default::default()
            },
        );
        let mut h = harness(settings);
        h.join(1, DeviceType::EndDevice, PowerSource::Battery);
        h.join(2, DeviceType::EndDevice, PowerSource::Battery);
        assert_eq!(transitions(&h).len(), 1);

        h.advance(MINUTE);
        assert_eq!(transitions(&h), vec![(Availability::Online, Availability::Offline)]);
    }

    #[test]
    fn test_disabled_globally() {
        let mut settings = Settings::default();
        settings.availability.enabled = false;
        let mut h = harness(settings);
        h.join(1, DeviceType::EndDevice, PowerSource::Battery);
        h.advance(2000 * MINUTE);
        assert!(transitions(&h).is_empty());
    }

    #[test]
    fn test_leave_cancels_timers() {
        let mut h = harness(enabled());
        let ieee = h.join(1, DeviceType::Router, PowerSource::Mains);
        assert!(h.core.timers.deadline(&TimerKey::AvailabilityDeadline(ieee.clone())).is_some());
        assert!(h.core.timers.deadline(&TimerKey::AvailabilityPoll(ieee.clone())).is_some());
        h.emit(Event::DeviceLeave {
            ieee_addr: ieee.clone(),
            name: ieee.to_string(),
        });
        assert!(h.core.timers.deadline(&TimerKey::AvailabilityDeadline(ieee.clone())).is_none());
        assert!(h.core.timers.deadline(&TimerKey::AvailabilityPoll(ieee)).is_none());
    }

    #[test]
    fn test_startup_classification() {
        let mut h = Harness::new(enabled(), vec![Box::new(AvailabilityTracker::new())]);
        known_device(&mut h, 1, DeviceType::EndDevice, PowerSource::Battery, 2000);
        known_device(&mut h, 2, DeviceType::EndDevice, PowerSource::Battery, 100);
        h.start();

        let changes = h.events(EventKind::AvailabilityChanged);
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&Event::AvailabilityChanged {
            device: IeeeAddr::from_u64(1),
            from: Availability::Unknown,
            to: Availability::Offline,
        }));

        // the recent one expires after the rest of its timeout
        h.advance(1399 * MINUTE);
        assert!(transitions(&h).is_empty());
        h.advance(MINUTE);
        assert_eq!(transitions(&h), vec![(Availability::Online, Availability::Offline)]);
    }

    #[test]
    fn test_startup_pings_router_before_shortened_deadline() {
        let mut h = Harness::new(enabled(), vec![Box::new(AvailabilityTracker::new())]);
        known_device(&mut h, 1, DeviceType::Router, PowerSource::Mains, 8);
        h.start();
        assert_eq!(transitions(&h), vec![(Availability::Unknown, Availability::Online)]);

        // two minutes left: pinged after one
        h.advance(MINUTE);
        let mut pings = h.take_radio();
        assert_eq!(pings.len(), 1);
        let (id, command) = pings.remove(0);
        assert_eq!(command, RadioCommand::Ping { device: IeeeAddr::from_u64(1) });
        h.complete(id, command, Ok(RadioResponse::Ack));

        h.advance(2 * MINUTE);
        assert!(transitions(&h).is_empty());
    }
}
