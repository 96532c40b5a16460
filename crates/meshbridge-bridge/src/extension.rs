//! Extension framework
//!
//! Extensions are independent units of behavior. Each declares the event
//! kinds it consumes, is started and stopped by the [`ExtensionHost`], and
//! reaches the rest of the bridge only through [`Core`]: the bus, the
//! registry, the state store and the IO queues. Extensions never hold
//! references to each other.

use meshbridge_core::{Delivery, Event, EventKind, SubscriberId};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::error::Result;

pub trait Extension: Send {
    fn name(&self) -> &'static str;

    /// Event kinds delivered to [`Extension::on_event`]
    fn subscriptions(&self) -> Vec<EventKind>;

    /// One-time setup after the extension is subscribed
    fn start(&mut self, _core: &mut Core) -> Result<()> {
        Ok(())
    }

    fn on_event(&mut self, core: &mut Core, event: &Event) -> Result<()>;

    /// Release resources; also called after a failed start
    fn stop(&mut self, _core: &mut Core) {}
}

struct Slot {
    extension: Box<dyn Extension>,
    running: bool,
}

/// Ordered container of extensions
#[derive(Default)]
pub struct ExtensionHost {
    slots: Vec<Slot>,
}

impl ExtensionHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension; start order follows registration order
    pub fn register(&mut self, extension: Box<dyn Extension>) {
        self.slots.push(Slot {
            extension,
            running: false,
        });
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.extension.name()).collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.slots.iter().any(|s| s.running && s.extension.name() == name)
    }

    /// Subscribe and start every extension not running yet
    ///
    /// All of them are subscribed before the first start, so events emitted
    /// while starting reach extensions registered later. An extension whose
    /// start fails is stopped and unsubscribed; the others still start. The
    /// failures are returned.
    pub fn start_all(&mut self, core: &mut Core) -> Vec<(&'static str, String)> {
        let starting: Vec<usize> = (0..self.slots.len()).filter(|&i| !self.slots[i].running).collect();
        for &index in &starting {
            for kind in self.slots[index].extension.subscriptions() {
                core.bus.subscribe(kind, SubscriberId(index));
            }
        }

        let mut failures = Vec::new();
        for index in starting {
            let subscriber = SubscriberId(index);
            let slot = &mut self.slots[index];
            let name = slot.extension.name();
            match slot.extension.start(core) {
                Ok(()) => {
                    slot.running = true;
                    debug!(extension = name, "Extension started");
                }
                Err(e) => {
                    warn!(extension = name, error = %e, "Extension failed to start");
                    slot.extension.stop(core);
                    core.bus.unsubscribe_all(subscriber);
                    failures.push((name, e.to_string()));
                }
            }
        }
        info!(running = self.slots.iter().filter(|s| s.running).count(), "Extensions started");
        failures
    }

    /// Stop in reverse order; safe to call more than once
    pub fn stop_all(&mut self, core: &mut Core) {
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.running {
                slot.extension.stop(core);
                slot.running = false;
                debug!(extension = slot.extension.name(), "Extension stopped");
            }
            core.bus.unsubscribe_all(SubscriberId(index));
        }
    }

    /// Flush the state store deadlines and fire the timers due at `now`
    pub fn fire_due(&mut self, core: &mut Core, now: Instant) {
        core.advance(now);
        loop {
            let changes = core.store.poll_expired(core.now());
            let due = core.timers.take_due(core.now());
            if changes.is_empty() && due.is_empty() {
                break;
            }
            core.emit_changes(changes);
            core.emit_all(due.into_iter().map(Event::TimerExpired));
            self.drain(core);
        }
    }

    /// Deliver queued events until the bus is empty
    pub fn drain(&mut self, core: &mut Core) {
        while let Some(delivery) = core.bus.next_delivery() {
            self.dispatch(core, delivery);
        }
    }

    fn dispatch(&mut self, core: &mut Core, delivery: Delivery) {
        for (token, subscriber) in delivery.targets() {
            if !core.bus.is_subscribed(token) {
                continue;
            }
            let Some(slot) = self.slots.get_mut(subscriber.0) else {
                continue;
            };
            if let Err(e) = slot.extension.on_event(core, &delivery.event) {
                core.bus.report_failure(slot.extension.name(), &delivery.event, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use chrono::Utc;
    use meshbridge_core::{Settings, TimerKey};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        name: &'static str,
        log: Log,
        fail_start: bool,
        fail_events: bool,
        emit_on_start: bool,
    }

    impl Scripted {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: log.clone(),
                fail_start: false,
                fail_events: false,
                emit_on_start: false,
            }
        }
    }

    impl Extension for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn subscriptions(&self) -> Vec<EventKind> {
            vec![EventKind::TimerExpired, EventKind::HandlerFailed]
        }

        fn start(&mut self, core: &mut Core) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.emit_on_start {
                core.emit(Event::TimerExpired(TimerKey::PersistState));
            }
            if self.fail_start {
                return Err(BridgeError::InvalidRequest("no".into()));
            }
            Ok(())
        }

        fn on_event(&mut self, _core: &mut Core, event: &Event) -> Result<()> {
            self.log.lock().unwrap().push(format!("{} {:?}", self.name, event.kind()));
            if self.fail_events && event.kind() == EventKind::TimerExpired {
                return Err(BridgeError::InvalidRequest("boom".into()));
            }
            Ok(())
        }

        fn stop(&mut self, _core: &mut Core) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    fn core() -> Core {
        Core::new(Settings::default(), Instant::now(), Utc::now())
    }

    #[test]
    fn test_failed_start_is_stopped_and_unsubscribed() {
        let log = Log::default();
        let mut host = ExtensionHost::new();
        host.register(Box::new(Scripted::new("a", &log)));
        host.register(Box::new(Scripted {
            fail_start: true,
            ..Scripted::new("b", &log)
        }));
        let mut core = core();

        let failures = host.start_all(&mut core);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "b");
        assert!(host.is_running("a"));
        assert!(!host.is_running("b"));

        core.emit(Event::TimerExpired(TimerKey::PersistState));
        host.drain(&mut core);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start b", "stop b", "a TimerExpired"]
        );
    }

    #[test]
    fn test_start_events_reach_later_extensions() {
        let log = Log::default();
        let mut host = ExtensionHost::new();
        host.register(Box::new(Scripted {
            emit_on_start: true,
            ..Scripted::new("a", &log)
        }));
        host.register(Box::new(Scripted::new("b", &log)));
        let mut core = core();

        assert!(host.start_all(&mut core).is_empty());
        host.drain(&mut core);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start b", "a TimerExpired", "b TimerExpired"]
        );
    }

    #[test]
    fn test_stop_reverse_order_and_idempotent() {
        let log = Log::default();
        let mut host = ExtensionHost::new();
        host.register(Box::new(Scripted::new("a", &log)));
        host.register(Box::new(Scripted::new("b", &log)));
        let mut core = core();
        host.start_all(&mut core);

        host.stop_all(&mut core);
        host.stop_all(&mut core);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
        assert_eq!(core.bus.subscriber_count(EventKind::TimerExpired), 0);
    }

    #[test]
    fn test_handler_failure_reaches_other_extensions() {
        let log = Log::default();
        let mut host = ExtensionHost::new();
        host.register(Box::new(Scripted {
            fail_events: true,
            ..Scripted::new("a", &log)
        }));
        host.register(Box::new(Scripted::new("b", &log)));
        let mut core = core();
        host.start_all(&mut core);
        log.lock().unwrap().clear();

        core.emit(Event::TimerExpired(TimerKey::PersistState));
        host.drain(&mut core);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a TimerExpired", "b TimerExpired", "a HandlerFailed", "b HandlerFailed"]
        );
    }
}
