//! Bridge settings and per-entity options

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;

use crate::device::IeeeAddr;
use crate::group::{GroupId, OffState};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("{entity}: debounce and throttle cannot both be configured")]
    DebounceAndThrottle { entity: String },
    #[error("{entity}: invalid attribute filter '{pattern}': {source}")]
    InvalidFilter {
        entity: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid friendly name '{0}'")]
    InvalidFriendlyName(String),
    #[error("duplicate friendly name '{0}'")]
    DuplicateFriendlyName(String),
    #[error("invalid group id '{0}'")]
    InvalidGroupId(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub availability: AvailabilitySettings,
    #[serde(default)]
    pub ota: OtaSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    /// Defaults applied to every device
    #[serde(default)]
    pub device_options: DeviceOptions,
    /// Per-device options keyed by IEEE address
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceOptions>,
    /// Per-group options keyed by numeric group id
    #[serde(default)]
    pub groups: BTreeMap<String, GroupOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Prefix of every topic the bridge publishes or listens on
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Never set the retain flag, whatever the entity options say
    #[serde(default)]
    pub force_disable_retain: bool,
    /// Add a `device` object with identity details to device state payloads
    #[serde(default)]
    pub include_device_information: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            force_disable_retain: false,
            include_device_information: false,
        }
    }
}

fn default_base_topic() -> String {
    "meshbridge".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_active_timeout")]
    pub active: AvailabilityTimeout,
    #[serde(default = "default_passive_timeout")]
    pub passive: AvailabilityTimeout,
}

impl Default for AvailabilitySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            active: default_active_timeout(),
            passive: default_passive_timeout(),
        }
    }
}

/// Availability timeout in minutes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AvailabilityTimeout {
    pub timeout: u64,
}

impl AvailabilityTimeout {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.timeout * 60)
    }
}

fn default_active_timeout() -> AvailabilityTimeout {
    AvailabilityTimeout { timeout: 10 }
}

fn default_passive_timeout() -> AvailabilityTimeout {
    AvailabilityTimeout { timeout: 1500 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaSettings {
    /// Minutes between scheduled update checks
    #[serde(default = "default_update_check_interval")]
    pub update_check_interval: u64,
    #[serde(default)]
    pub disable_automatic_update_check: bool,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            update_check_interval: default_update_check_interval(),
            disable_automatic_update_check: false,
        }
    }
}

impl OtaSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval * 60)
    }
}

fn default_update_check_interval() -> u64 {
    24 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    /// Publish the full cached state instead of only the reported attributes
    #[serde(default = "default_true")]
    pub cache_state: bool,
    /// Keep the cache across restarts
    #[serde(default = "default_true")]
    pub cache_state_persistent: bool,
    /// Replay cached state when the bridge starts
    #[serde(default = "default_true")]
    pub cache_state_send_on_startup: bool,
    #[serde(default)]
    pub last_seen: LastSeenFormat,
    #[serde(default)]
    pub output: OutputMode,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            cache_state: true,
            cache_state_persistent: true,
            cache_state_send_on_startup: true,
            last_seen: LastSeenFormat::default(),
            output: OutputMode::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Format of the `last_seen` attribute added to published state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LastSeenFormat {
    #[default]
    #[serde(rename = "disable")]
    Disable,
    #[serde(rename = "ISO_8601")]
    Iso8601,
    #[serde(rename = "ISO_8601_local")]
    Iso8601Local,
    #[serde(rename = "epoch")]
    Epoch,
}

impl LastSeenFormat {
    pub fn is_enabled(&self) -> bool {
        *self != LastSeenFormat::Disable
    }

    pub fn format(&self, at: DateTime<Utc>) -> Option<Value> {
        match self {
            LastSeenFormat::Disable => None,
            LastSeenFormat::Iso8601 => Some(Value::String(at.to_rfc3339())),
            LastSeenFormat::Iso8601Local => {
                Some(Value::String(at.with_timezone(&Local).to_rfc3339()))
            }
            LastSeenFormat::Epoch => Some(Value::from(at.timestamp_millis())),
        }
    }
}

/// How entity state is laid out on the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One JSON payload on the entity topic
    #[default]
    Json,
    /// One topic per attribute
    Attribute,
    AttributeAndJson,
}

impl OutputMode {
    pub fn json(&self) -> bool {
        matches!(self, OutputMode::Json | OutputMode::AttributeAndJson)
    }

    pub fn attribute(&self) -> bool {
        matches!(self, OutputMode::Attribute | OutputMode::AttributeAndJson)
    }
}

/// Per-device availability override
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AvailabilityOverride {
    Enabled(bool),
    /// Enabled with a custom timeout in minutes
    Timeout { timeout: u64 },
}

/// Options for a device; every field is optional so global defaults and
/// device-specific values can be layered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
    /// Message expiry interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
    /// Debounce window in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debounce_ignore: Vec<String>,
    /// Throttle window in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_cache: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_optimistic: Vec<String>,
}

impl DeviceOptions {
    /// Layer device-specific options over the global defaults
    pub fn merged(global: &DeviceOptions, specific: &DeviceOptions) -> DeviceOptions {
        fn pick<T: Clone>(specific: &Option<T>, global: &Option<T>) -> Option<T> {
            specific.clone().or_else(|| global.clone())
        }
        fn pick_list(specific: &[String], global: &[String]) -> Vec<String> {
            if specific.is_empty() {
                global.to_vec()
            } else {
                specific.to_vec()
            }
        }

        DeviceOptions {
            friendly_name: specific.friendly_name.clone(),
            description: specific.description.clone(),
            disabled: pick(&specific.disabled, &global.disabled),
            retain: pick(&specific.retain, &global.retain),
            retention: pick(&specific.retention, &global.retention),
            qos: pick(&specific.qos, &global.qos),
            availability: pick(&specific.availability, &global.availability),
            optimistic: pick(&specific.optimistic, &global.optimistic),
            debounce: pick(&specific.debounce, &global.debounce),
            debounce_ignore: pick_list(&specific.debounce_ignore, &global.debounce_ignore),
            throttle: pick(&specific.throttle, &global.throttle),
            filtered_attributes: pick_list(&specific.filtered_attributes, &global.filtered_attributes),
            filtered_cache: pick_list(&specific.filtered_cache, &global.filtered_cache),
            filtered_optimistic: pick_list(&specific.filtered_optimistic, &global.filtered_optimistic),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic.unwrap_or(true)
    }

    pub fn debounce_window(&self) -> Option<Duration> {
        self.debounce.filter(|s| *s > 0.0).map(Duration::from_secs_f64)
    }

    pub fn throttle_window(&self) -> Option<Duration> {
        self.throttle.filter(|s| *s > 0.0).map(Duration::from_secs_f64)
    }

    /// Apply a JSON object of changed options (as sent in an options request)
    pub fn with_changes(&self, changes: &serde_json::Map<String, Value>) -> Result<DeviceOptions, serde_json::Error> {
        let mut current = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut current {
            for (key, value) in changes {
                if value.is_null() {
                    map.remove(key);
                } else {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        serde_json::from_value(current)
    }

    fn validate(&self, entity: &str) -> Result<(), SettingsError> {
        if self.debounce_window().is_some() && self.throttle_window().is_some() {
            return Err(SettingsError::DebounceAndThrottle {
                entity: entity.to_string(),
            });
        }
        if let Some(qos) = self.qos {
            validate_qos(entity, qos)?;
        }
        if let Some(AvailabilityOverride::Timeout { timeout: 0 }) = self.availability {
            return Err(SettingsError::InvalidValue {
                field: format!("{}.availability.timeout", entity),
                reason: "must be greater than zero".to_string(),
            });
        }
        for patterns in [&self.filtered_attributes, &self.filtered_cache, &self.filtered_optimistic] {
            AttributeFilter::compile(entity, patterns)?;
        }
        Ok(())
    }
}

/// Options for a group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
    #[serde(default)]
    pub off_state: OffState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_cache: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_optimistic: Vec<String>,
    /// Desired members: `<ieee>`, `<ieee>/<endpoint>` or a device friendly name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
}

impl GroupOptions {
    pub fn is_optimistic(&self) -> bool {
        self.optimistic.unwrap_or(true)
    }

    pub fn with_changes(&self, changes: &serde_json::Map<String, Value>) -> Result<GroupOptions, serde_json::Error> {
        let mut current = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut current {
            for (key, value) in changes {
                if value.is_null() {
                    map.remove(key);
                } else {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        serde_json::from_value(current)
    }

    fn validate(&self, entity: &str) -> Result<(), SettingsError> {
        if let Some(qos) = self.qos {
            validate_qos(entity, qos)?;
        }
        for patterns in [&self.filtered_attributes, &self.filtered_cache, &self.filtered_optimistic] {
            AttributeFilter::compile(entity, patterns)?;
        }
        Ok(())
    }
}

fn validate_qos(entity: &str, qos: u8) -> Result<(), SettingsError> {
    if qos > 2 {
        return Err(SettingsError::InvalidValue {
            field: format!("{}.qos", entity),
            reason: format!("{} is not a valid QoS level", qos),
        });
    }
    Ok(())
}

/// Check that a friendly name can be used in topics
pub fn validate_friendly_name(name: &str) -> Result<(), SettingsError> {
    let ends_with_endpoint = name
        .rsplit_once('/')
        .map(|(_, last)| !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);

    if name.is_empty()
        || name.contains('#')
        || name.contains('+')
        || name.starts_with('/')
        || name.ends_with('/')
        || ends_with_endpoint
    {
        return Err(SettingsError::InvalidFriendlyName(name.to_string()));
    }
    Ok(())
}

impl Settings {
    /// Validate the settings, failing on the first problem found
    pub fn validate(&self) -> Result<(), SettingsError> {
        let base = &self.mqtt.base_topic;
        if base.is_empty() || base.contains('#') || base.contains('+') {
            return Err(SettingsError::InvalidValue {
                field: "mqtt.base_topic".to_string(),
                reason: format!("'{}' is not a valid topic prefix", base),
            });
        }
        if self.availability.active.timeout == 0 || self.availability.passive.timeout == 0 {
            return Err(SettingsError::InvalidValue {
                field: "availability".to_string(),
                reason: "timeouts must be greater than zero".to_string(),
            });
        }
        if self.ota.update_check_interval == 0 {
            return Err(SettingsError::InvalidValue {
                field: "ota.update_check_interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        self.device_options.validate("device_options")?;

        let mut names = HashSet::new();
        for (ieee, options) in &self.devices {
            let merged = DeviceOptions::merged(&self.device_options, options);
            merged.validate(ieee)?;
            if let Some(name) = &options.friendly_name {
                validate_friendly_name(name)?;
                if !names.insert(name.clone()) {
                    return Err(SettingsError::DuplicateFriendlyName(name.clone()));
                }
            }
        }

        for (key, options) in &self.groups {
            let id = parse_group_id(key)?;
            options.validate(&format!("group {}", id))?;
            if let Some(name) = &options.friendly_name {
                validate_friendly_name(name)?;
                if !names.insert(name.clone()) {
                    return Err(SettingsError::DuplicateFriendlyName(name.clone()));
                }
            }
        }

        Ok(())
    }

    /// Effective options for a device: global defaults plus its own entry
    pub fn device_options(&self, ieee: &IeeeAddr) -> DeviceOptions {
        let specific = self
            .devices
            .iter()
            .find(|(key, _)| IeeeAddr::new(key) == *ieee)
            .map(|(_, options)| options.clone())
            .unwrap_or_default();
        DeviceOptions::merged(&self.device_options, &specific)
    }

    /// Configured groups with parsed ids; invalid keys are skipped
    /// (validation rejects them before this is used)
    pub fn configured_groups(&self) -> Vec<(GroupId, GroupOptions)> {
        self.groups
            .iter()
            .filter_map(|(key, options)| parse_group_id(key).ok().map(|id| (id, options.clone())))
            .collect()
    }
}

fn parse_group_id(key: &str) -> Result<GroupId, SettingsError> {
    key.trim()
        .parse::<u16>()
        .map(GroupId)
        .map_err(|_| SettingsError::InvalidGroupId(key.to_string()))
}

/// Compiled list of attribute key patterns
#[derive(Debug, Clone, Default)]
pub struct AttributeFilter {
    patterns: Vec<Regex>,
}

impl AttributeFilter {
    pub fn compile(entity: &str, patterns: &[String]) -> Result<Self, SettingsError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| SettingsError::InvalidFilter {
                    entity: entity.to_string(),
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(key))
    }
}
