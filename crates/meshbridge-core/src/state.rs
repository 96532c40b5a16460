//! Canonical entity state and the policy deciding when a change is published
//!
//! Every device and group registered with the store has one state record.
//! Updates enter through one of the policy paths:
//!
//! - [`StateStore::report`]: radio-confirmed values, subject to debounce or
//!   throttle
//! - [`StateStore::command`]: values requested over the broker, applied
//!   immediately when the entity is optimistic
//! - [`StateStore::set`]: derived values applied as-is with a given reason
//!
//! Each path yields the [`ChangeEvent`]s to emit, in order. Timed work
//! (debounce flushes, optimistic confirmation windows) is collected by
//! [`StateStore::poll_expired`]; the caller sleeps until
//! [`StateStore::next_deadline`].

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::entity::EntityId;
use crate::event::{ChangeEvent, StateChangeReason};
use crate::settings::{AttributeFilter, DeviceOptions, GroupOptions, SettingsError};

/// Attribute key/value map used for state, updates and payloads
pub type Payload = serde_json::Map<String, Value>;

/// How long an optimistic value waits for a confirming report
pub const DEFAULT_CONFIRM_WINDOW: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),
    #[error("{0}: debounce and throttle cannot both be configured")]
    InvalidPolicy(EntityId),
}

/// Publish policy of one entity
#[derive(Debug, Clone)]
pub struct StatePolicy {
    pub optimistic: bool,
    pub debounce: Option<Duration>,
    /// Keys whose pending value must not be overwritten inside a debounce window
    pub debounce_ignore: Vec<String>,
    pub throttle: Option<Duration>,
    /// Keys published but never cached
    pub filtered_cache: AttributeFilter,
    /// Keys never applied optimistically
    pub filtered_optimistic: AttributeFilter,
    pub confirm_window: Duration,
}

impl Default for StatePolicy {
    fn default() -> Self {
        Self {
            optimistic: true,
            debounce: None,
            debounce_ignore: Vec::new(),
            throttle: None,
            filtered_cache: AttributeFilter::default(),
            filtered_optimistic: AttributeFilter::default(),
            confirm_window: DEFAULT_CONFIRM_WINDOW,
        }
    }
}

impl StatePolicy {
    pub fn for_device(name: &str, options: &DeviceOptions) -> Result<Self, SettingsError> {
        Ok(Self {
            optimistic: options.is_optimistic(),
            debounce: options.debounce_window(),
            debounce_ignore: options.debounce_ignore.clone(),
            throttle: options.throttle_window(),
            filtered_cache: AttributeFilter::compile(name, &options.filtered_cache)?,
            filtered_optimistic: AttributeFilter::compile(name, &options.filtered_optimistic)?,
            confirm_window: DEFAULT_CONFIRM_WINDOW,
        })
    }

    pub fn for_group(name: &str, options: &GroupOptions) -> Result<Self, SettingsError> {
        Ok(Self {
            optimistic: options.is_optimistic(),
            filtered_cache: AttributeFilter::compile(name, &options.filtered_cache)?,
            filtered_optimistic: AttributeFilter::compile(name, &options.filtered_optimistic)?,
            ..Self::default()
        })
    }
}

#[derive(Debug)]
struct PendingDebounce {
    payload: Payload,
    deadline: Instant,
}

#[derive(Debug)]
struct Unconfirmed {
    keys: BTreeSet<String>,
    deadline: Instant,
}

#[derive(Debug)]
struct Record {
    policy: StatePolicy,
    state: Payload,
    debounce: Option<PendingDebounce>,
    throttle_until: Option<Instant>,
    unconfirmed: Option<Unconfirmed>,
}

impl Record {
    /// Merge an update into the record and describe the change, if any
    fn commit(
        &mut self,
        entity: &EntityId,
        update: Payload,
        reason: Option<StateChangeReason>,
        force: bool,
    ) -> Option<ChangeEvent> {
        let from = self.state.clone();
        let mut delta = Payload::new();

        for (key, value) in update {
            if value.is_null() {
                if self.state.remove(&key).is_some() {
                    delta.insert(key, Value::Null);
                }
                continue;
            }
            if self.policy.filtered_cache.matches(&key) {
                delta.insert(key, value);
                continue;
            }
            if self.state.get(&key) != Some(&value) {
                self.state.insert(key.clone(), value.clone());
                delta.insert(key, value);
            }
        }

        if delta.is_empty() && !force {
            return None;
        }
        Some(ChangeEvent {
            entity: entity.clone(),
            from,
            to: self.state.clone(),
            update: delta,
            reason,
        })
    }

    fn flush_debounce(&mut self, entity: &EntityId) -> Option<ChangeEvent> {
        let pending = self.debounce.take()?;
        self.commit(entity, pending.payload, Some(StateChangeReason::PublishDebounce), false)
    }

    fn confirm(&mut self, update: &Payload) {
        if let Some(unconfirmed) = &mut self.unconfirmed {
            unconfirmed.keys.retain(|k| !update.contains_key(k));
            if unconfirmed.keys.is_empty() {
                self.unconfirmed = None;
            }
        }
    }
}

/// Owner of all entity state records
#[derive(Debug, Default)]
pub struct StateStore {
    records: BTreeMap<EntityId, Record>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity or replace its policy, keeping its state
    pub fn configure(&mut self, entity: EntityId, policy: StatePolicy) -> Result<(), StateError> {
        if policy.debounce.is_some() && policy.throttle.is_some() {
            return Err(StateError::InvalidPolicy(entity));
        }
        match self.records.get_mut(&entity) {
            Some(record) => record.policy = policy,
            None => {
                self.records.insert(
                    entity,
                    Record {
                        policy,
                        state: Payload::new(),
                        debounce: None,
                        throttle_until: None,
                        unconfirmed: None,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, entity: &EntityId) -> bool {
        self.records.contains_key(entity)
    }

    /// Drop an entity and everything pending for it
    pub fn remove(&mut self, entity: &EntityId) -> Option<Payload> {
        self.records.remove(entity).map(|r| r.state)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.records.keys()
    }

    pub fn get(&self, entity: &EntityId) -> Option<&Payload> {
        self.records.get(entity).map(|r| &r.state)
    }

    /// Seed a record from persisted state without producing events
    pub fn seed(&mut self, entity: &EntityId, state: Payload) -> Result<(), StateError> {
        let record = self.record(entity)?;
        record.state = state
            .into_iter()
            .filter(|(k, v)| !v.is_null() && !record.policy.filtered_cache.matches(k))
            .collect();
        Ok(())
    }

    /// Clear the cached state of an entity, keeping its registration
    pub fn clear(&mut self, entity: &EntityId) -> Result<(), StateError> {
        let record = self.record(entity)?;
        record.state.clear();
        record.debounce = None;
        record.unconfirmed = None;
        Ok(())
    }

    /// Apply values directly with the given reason, bypassing debounce/throttle
    ///
    /// A pending debounce for the entity is flushed first so events keep
    /// their order.
    pub fn set(
        &mut self,
        entity: &EntityId,
        update: Payload,
        reason: Option<StateChangeReason>,
    ) -> Result<Vec<ChangeEvent>, StateError> {
        let record = self.record(entity)?;
        let mut events: Vec<ChangeEvent> = record.flush_debounce(entity).into_iter().collect();
        events.extend(record.commit(entity, update, reason, false));
        Ok(events)
    }

    /// Apply a radio-confirmed report
    pub fn report(&mut self, entity: &EntityId, update: Payload, now: Instant) -> Result<Vec<ChangeEvent>, StateError> {
        let record = self.record(entity)?;
        record.confirm(&update);

        if let Some(window) = record.policy.debounce {
            let mut events = Vec::new();
            let conflicting = record.debounce.as_ref().is_some_and(|pending| {
                record.policy.debounce_ignore.iter().any(|key| {
                    matches!((pending.payload.get(key), update.get(key)), (Some(old), Some(new)) if old != new)
                })
            });
            if conflicting {
                events.extend(record.flush_debounce(entity));
            }

            let pending = record.debounce.get_or_insert_with(|| PendingDebounce {
                payload: Payload::new(),
                deadline: now,
            });
            pending.payload.extend(update);
            pending.deadline = now + window;
            return Ok(events);
        }

        if let Some(window) = record.policy.throttle {
            let in_window = record.throttle_until.is_some_and(|until| now < until);
            if in_window {
                // cache stays current, publish waits for the next window
                record.commit(entity, update, None, false);
                return Ok(Vec::new());
            }
            let event = record.commit(entity, update, Some(StateChangeReason::PublishThrottle), false);
            if event.is_some() {
                record.throttle_until = Some(now + window);
            }
            return Ok(event.into_iter().collect());
        }

        Ok(record.commit(entity, update, None, false).into_iter().collect())
    }

    /// Apply values requested by a broker command
    ///
    /// Non-optimistic entities keep only confirmed values, so nothing is
    /// applied for them. Optimistic values stay in place if no report
    /// confirms them within the confirmation window.
    pub fn command(&mut self, entity: &EntityId, update: Payload, now: Instant) -> Result<Vec<ChangeEvent>, StateError> {
        let record = self.record(entity)?;
        let mut events: Vec<ChangeEvent> = record.flush_debounce(entity).into_iter().collect();
        if !record.policy.optimistic {
            return Ok(events);
        }

        let update: Payload = update
            .into_iter()
            .filter(|(key, _)| !record.policy.filtered_optimistic.matches(key))
            .collect();
        if let Some(event) = record.commit(entity, update, Some(StateChangeReason::GroupOptimistic), false) {
            let deadline = now + record.policy.confirm_window;
            let unconfirmed = record.unconfirmed.get_or_insert_with(|| Unconfirmed {
                keys: BTreeSet::new(),
                deadline,
            });
            unconfirmed.keys.extend(event.update.keys().cloned());
            unconfirmed.deadline = deadline;
            events.push(event);
        }
        Ok(events)
    }

    /// Force an event carrying no new values (e.g. a last-seen refresh)
    pub fn republish(&mut self, entity: &EntityId, reason: StateChangeReason) -> Result<ChangeEvent, StateError> {
        let record = self.record(entity)?;
        Ok(ChangeEvent {
            entity: entity.clone(),
            from: record.state.clone(),
            to: record.state.clone(),
            update: Payload::new(),
            reason: Some(reason),
        })
    }

    /// Replay the cached snapshot; `None` when nothing is cached
    pub fn replay_cached(&self, entity: &EntityId) -> Result<Option<ChangeEvent>, StateError> {
        let record = self
            .records
            .get(entity)
            .ok_or_else(|| StateError::UnknownEntity(entity.clone()))?;
        if record.state.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChangeEvent {
            entity: entity.clone(),
            from: record.state.clone(),
            to: record.state.clone(),
            update: record.state.clone(),
            reason: Some(StateChangeReason::PublishCached),
        }))
    }

    /// A debounced payload is waiting to be flushed
    pub fn has_pending(&self, entity: &EntityId) -> bool {
        self.records.get(entity).is_some_and(|r| r.debounce.is_some())
    }

    /// Keys applied optimistically and not confirmed yet
    pub fn unconfirmed(&self, entity: &EntityId) -> Vec<String> {
        self.records
            .get(entity)
            .and_then(|r| r.unconfirmed.as_ref())
            .map(|u| u.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Earliest instant at which [`StateStore::poll_expired`] has work
    pub fn next_deadline(&self) -> Option<Instant> {
        self.records
            .values()
            .flat_map(|r| {
                let debounce = r.debounce.as_ref().map(|d| d.deadline);
                let confirm = r.unconfirmed.as_ref().map(|u| u.deadline);
                debounce.into_iter().chain(confirm)
            })
            .min()
    }

    /// Run everything due at `now`, returning flushed debounce events in
    /// deadline order
    pub fn poll_expired(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let mut due: Vec<(Instant, EntityId)> = Vec::new();

        for (entity, record) in self.records.iter_mut() {
            if let Some(pending) = &record.debounce {
                if pending.deadline <= now {
                    due.push((pending.deadline, entity.clone()));
                }
            }
            if record.unconfirmed.as_ref().is_some_and(|u| u.deadline <= now) {
                if let Some(unconfirmed) = record.unconfirmed.take() {
                    debug!(
                        entity = %entity,
                        keys = ?unconfirmed.keys,
                        "Optimistic state not confirmed by device, keeping it"
                    );
                }
            }
            if record.throttle_until.is_some_and(|until| until <= now) {
                record.throttle_until = None;
            }
        }

        due.sort();
        due.into_iter()
            .filter_map(|(_, entity)| {
                let record = self.records.get_mut(&entity)?;
                record.flush_debounce(&entity)
            })
            .collect()
    }

    fn record(&mut self, entity: &EntityId) -> Result<&mut Record, StateError> {
        self.records
            .get_mut(entity)
            .ok_or_else(|| StateError::UnknownEntity(entity.clone()))
    }
}
