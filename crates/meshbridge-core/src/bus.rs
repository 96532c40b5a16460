//! Event bus connecting the bridge components
//!
//! Emitting an event never runs a handler inline. The bus snapshots the live
//! subscribers of the event's kind and queues one delivery; whoever drives the
//! bus pulls deliveries with [`EventBus::next_delivery`] and calls each target
//! whose token is still subscribed. Events emitted by handlers land behind the
//! ones already queued, which gives breadth-first ordering and a flat stack.

use std::collections::VecDeque;
use tracing::{trace, warn};

use crate::event::{Event, EventKind};

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// Identifies the party a delivery is for; the driver maps it to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub usize);

#[derive(Debug, Clone)]
struct Subscription {
    token: SubscriptionToken,
    kind: EventKind,
    subscriber: SubscriberId,
}

/// One queued event and the subscribers it is addressed to
#[derive(Debug)]
pub struct Delivery {
    pub event: Event,
    targets: Vec<(SubscriptionToken, SubscriberId)>,
}

impl Delivery {
    pub fn targets(&self) -> impl Iterator<Item = (SubscriptionToken, SubscriberId)> + '_ {
        self.targets.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    queue: VecDeque<Delivery>,
    next_token: u64,
    emitted: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind; deliveries follow subscription order
    pub fn subscribe(&mut self, kind: EventKind, subscriber: SubscriberId) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;
        self.subscriptions.push(Subscription {
            token,
            kind,
            subscriber,
        });
        trace!(?kind, subscriber = subscriber.0, "Subscribed");
        token
    }

    /// Remove a subscription; returns false if the token was not live
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.token != token);
        before != self.subscriptions.len()
    }

    /// Remove every subscription held by a subscriber
    pub fn unsubscribe_all(&mut self, subscriber: SubscriberId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.subscriber != subscriber);
        before - self.subscriptions.len()
    }

    pub fn is_subscribed(&self, token: SubscriptionToken) -> bool {
        self.subscriptions.iter().any(|s| s.token == token)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions.iter().filter(|s| s.kind == kind).count()
    }

    /// Queue an event for everyone currently subscribed to its kind
    pub fn emit(&mut self, event: Event) {
        let kind = event.kind();
        let targets: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.token, s.subscriber))
            .collect();
        self.emitted += 1;

        if targets.is_empty() {
            trace!(?kind, "Event dropped (no subscribers)");
            return;
        }
        self.queue.push_back(Delivery { event, targets });
    }

    pub fn next_delivery(&mut self) -> Option<Delivery> {
        self.queue.pop_front()
    }

    /// Number of deliveries waiting
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Total events emitted, delivered or not
    pub fn events_emitted(&self) -> u64 {
        self.emitted
    }

    /// Record a failed handler: log it and announce it on the bus
    ///
    /// Failures while handling a `HandlerFailed` event are only logged.
    pub fn report_failure(&mut self, subscriber: &str, event: &Event, error: String) {
        let kind = event.kind();
        warn!(subscriber, ?kind, error = %error, "Event handler failed");
        if kind != EventKind::HandlerFailed {
            self.emit(Event::HandlerFailed {
                subscriber: subscriber.to_string(),
                kind,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::IeeeAddr;
    use crate::event::TimerKey;

    fn timer(n: u64) -> Event {
        Event::TimerExpired(TimerKey::OtaCheck(IeeeAddr::from_u64(n)))
    }

    fn timer_n(event: &Event) -> u64 {
        match event {
            Event::TimerExpired(TimerKey::OtaCheck(ieee)) => {
                u64::from_str_radix(ieee.as_str().trim_start_matches("0x"), 16).unwrap()
            }
            _ => 0,
        }
    }

    /// Minimal driver: handlers get the bus so they can emit and subscribe
    fn drain<F>(bus: &mut EventBus, mut handler: F)
    where
        F: FnMut(&mut EventBus, SubscriberId, &Event) -> Result<(), String>,
    {
        while let Some(delivery) = bus.next_delivery() {
            for (token, subscriber) in delivery.targets() {
                if !bus.is_subscribed(token) {
                    continue;
                }
                if let Err(e) = handler(bus, subscriber, &delivery.event) {
                    bus.report_failure("test", &delivery.event, e);
                }
            }
        }
    }

    #[test]
    fn test_breadth_first_order() {
        let mut bus = EventBus::new();
        bus.subscribe(EventKind::TimerExpired, SubscriberId(0));
        bus.subscribe(EventKind::TimerExpired, SubscriberId(1));

        let mut seen = Vec::new();
        bus.emit(timer(1));
        bus.emit(timer(2));
        drain(&mut bus, |bus, sub, event| {
            let n = timer_n(event);
            seen.push((n, sub.0));
            if n == 1 && sub.0 == 0 {
                bus.emit(timer(10));
            }
            Ok(())
        });

        assert_eq!(seen, vec![(1, 0), (1, 1), (2, 0), (2, 1), (10, 0), (10, 1)]);
    }

    #[test]
    fn test_late_subscription_misses_in_flight_event() {
        let mut bus = EventBus::new();
        bus.subscribe(EventKind::TimerExpired, SubscriberId(0));

        let mut seen = Vec::new();
        bus.emit(timer(1));
        drain(&mut bus, |bus, sub, event| {
            seen.push((timer_n(event), sub.0));
            if sub.0 == 0 && timer_n(event) == 1 {
                bus.subscribe(EventKind::TimerExpired, SubscriberId(1));
                bus.emit(timer(2));
            }
            Ok(())
        });

        assert_eq!(seen, vec![(1, 0), (2, 0), (2, 1)]);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let mut bus = EventBus::new();
        bus.subscribe(EventKind::TimerExpired, SubscriberId(0));
        let second = bus.subscribe(EventKind::TimerExpired, SubscriberId(1));

        let mut seen = Vec::new();
        bus.emit(timer(1));
        bus.emit(timer(2));
        drain(&mut bus, |bus, sub, event| {
            seen.push((timer_n(event), sub.0));
            if sub.0 == 0 {
                bus.unsubscribe(second);
            }
            Ok(())
        });

        assert_eq!(seen, vec![(1, 0), (2, 0)]);
        assert!(!bus.is_subscribed(second));
    }

    #[test]
    fn test_handler_failure_isolated() {
        let mut bus = EventBus::new();
        bus.subscribe(EventKind::TimerExpired, SubscriberId(0));
        bus.subscribe(EventKind::TimerExpired, SubscriberId(1));
        bus.subscribe(EventKind::HandlerFailed, SubscriberId(2));

        let mut seen = Vec::new();
        bus.emit(timer(1));
        drain(&mut bus, |_, sub, event| {
            seen.push(sub.0);
            match (sub.0, event) {
                (0, _) => Err("boom".to_string()),
                (2, Event::HandlerFailed { kind, error, .. }) => {
                    assert_eq!(*kind, EventKind::TimerExpired);
                    assert_eq!(error, "boom");
                    Err("failure handler failed too".to_string())
                }
                _ => Ok(()),
            }
        });

        // the failure of the HandlerFailed subscriber does not loop
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let mut bus = EventBus::new();
        bus.emit(timer(1));
        assert_eq!(bus.pending(), 0);
        assert_eq!(bus.events_emitted(), 1);

        let token = bus.subscribe(EventKind::TimerExpired, SubscriberId(4));
        assert_eq!(bus.subscriber_count(EventKind::TimerExpired), 1);
        assert_eq!(bus.unsubscribe_all(SubscriberId(4)), 1);
        assert!(!bus.unsubscribe(token));
    }
}
