//! Device types for nodes on the mesh network

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::settings::DeviceOptions;

/// Globally unique hardware address of a device (64-bit IEEE address)
///
/// Stored normalized as lowercase `0x`-prefixed hex so lookups are stable
/// regardless of how the radio driver formats it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IeeeAddr(String);

impl IeeeAddr {
    /// Create an address from its string form
    pub fn new(addr: &str) -> Self {
        let trimmed = addr.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        Self(format!("0x{}", hex.to_ascii_lowercase()))
    }

    /// Create an address from the raw 64-bit value
    pub fn from_u64(value: u64) -> Self {
        Self(format!("0x{:016x}", value))
    }

    /// True if the string looks like an IEEE address (used to tell addresses
    /// from friendly names in broker requests)
    pub fn looks_like(s: &str) -> bool {
        let hex = match s.strip_prefix("0x") {
            Some(hex) => hex,
            None => return false,
        };
        hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IeeeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a device in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DeviceType {
    Coordinator,
    Router,
    EndDevice,
    #[default]
    Unknown,
}

/// How the device is powered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Mains,
    Battery,
    #[default]
    Unknown,
}

/// Progress of the device interview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterviewStatus {
    /// Not interviewed yet
    #[default]
    Pending,
    Started,
    Successful,
    Failed,
}

/// Why the last-seen timestamp of a device moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LastSeenReason {
    DeviceAnnounce,
    NetworkAddress,
    DeviceJoined,
    /// A message that produced a state publish
    MessageEmitted,
    /// A message that did not produce a state publish
    MessageNonEmitted,
}

/// Last time a device was heard from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastSeen {
    pub at: DateTime<Utc>,
    pub reason: LastSeenReason,
}

/// Liveness of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Not heard from since the bridge started
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Unknown => "unknown",
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }
}

/// Access bit: property value is published in the device state
pub const ACCESS_STATE: u8 = 0b001;
/// Access bit: property can be written with a `set` command
pub const ACCESS_SET: u8 = 0b010;
/// Access bit: property can be read with a `get` command
pub const ACCESS_GET: u8 = 0b100;

/// One capability exposed by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expose {
    /// Key of the property in the state payload
    pub property: String,
    /// Combination of the `ACCESS_*` bits
    #[serde(default = "default_access")]
    pub access: u8,
    /// Endpoint the property lives on, if not the default one
    #[serde(default)]
    pub endpoint: Option<u8>,
}

fn default_access() -> u8 {
    ACCESS_STATE
}

impl Expose {
    pub fn is_settable(&self) -> bool {
        self.access & ACCESS_SET != 0
    }

    pub fn is_gettable(&self) -> bool {
        self.access & ACCESS_GET != 0
    }
}

/// Reference to one endpoint of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointRef {
    pub device: IeeeAddr,
    pub endpoint: u8,
}

impl EndpointRef {
    pub fn new(device: IeeeAddr, endpoint: u8) -> Self {
        Self { device, endpoint }
    }
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.endpoint)
    }
}

/// What the radio driver knows about a device when it first shows up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub ieee_addr: IeeeAddr,
    pub network_address: u16,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub power_source: PowerSource,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<u8>,
}

/// Result of a successful interview: the definition matched for the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub exposes: Vec<Expose>,
    #[serde(default)]
    pub supports_ota: bool,
    #[serde(default)]
    pub firmware_version: Option<u32>,
}

/// A device known to the bridge
///
/// Fields are read through accessors; mutation goes through the registry so
/// every change can be announced on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    ieee_addr: IeeeAddr,
    network_address: u16,
    device_type: DeviceType,
    power_source: PowerSource,
    friendly_name: String,
    interview: InterviewStatus,
    options: DeviceOptions,
    last_seen: Option<LastSeen>,
    exposes: Vec<Expose>,
    endpoints: BTreeSet<u8>,
    model_id: Option<String>,
    firmware_version: Option<u32>,
    supports_ota: bool,
}

impl Device {
    /// Create a device from the radio descriptor
    pub fn new(descriptor: DeviceDescriptor, friendly_name: String, options: DeviceOptions) -> Self {
        Self {
            ieee_addr: descriptor.ieee_addr,
            network_address: descriptor.network_address,
            device_type: descriptor.device_type,
            power_source: descriptor.power_source,
            friendly_name,
            interview: InterviewStatus::Pending,
            options,
            last_seen: None,
            exposes: Vec::new(),
            endpoints: descriptor.endpoints.into_iter().collect(),
            model_id: descriptor.model_id,
            firmware_version: None,
            supports_ota: false,
        }
    }

    pub fn ieee_addr(&self) -> &IeeeAddr {
        &self.ieee_addr
    }

    pub fn network_address(&self) -> u16 {
        self.network_address
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn power_source(&self) -> PowerSource {
        self.power_source
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn interview(&self) -> InterviewStatus {
        self.interview
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn last_seen(&self) -> Option<&LastSeen> {
        self.last_seen.as_ref()
    }

    pub fn exposes(&self) -> &[Expose] {
        &self.exposes
    }

    pub fn endpoints(&self) -> impl Iterator<Item = u8> + '_ {
        self.endpoints.iter().copied()
    }

    /// Endpoint used when a request does not name one
    pub fn default_endpoint(&self) -> u8 {
        self.endpoints.iter().next().copied().unwrap_or(1)
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn firmware_version(&self) -> Option<u32> {
        self.firmware_version
    }

    pub fn supports_ota(&self) -> bool {
        self.supports_ota
    }

    pub fn is_coordinator(&self) -> bool {
        self.device_type == DeviceType::Coordinator
    }

    /// Devices that are always listening can be polled for availability
    pub fn is_always_listening(&self) -> bool {
        self.device_type == DeviceType::Router || self.power_source == PowerSource::Mains
    }

    /// Look up an exposed property by its key
    pub fn expose(&self, property: &str) -> Option<&Expose> {
        self.exposes.iter().find(|e| e.property == property)
    }

    pub(crate) fn set_friendly_name(&mut self, name: String) {
        self.friendly_name = name;
    }

    pub(crate) fn set_options(&mut self, options: DeviceOptions) {
        self.options = options;
    }

    pub(crate) fn set_interview(&mut self, status: InterviewStatus) {
        self.interview = status;
    }

    pub(crate) fn set_network_address(&mut self, address: u16) {
        self.network_address = address;
    }

    pub(crate) fn set_last_seen(&mut self, last_seen: LastSeen) {
        self.last_seen = Some(last_seen);
    }

    pub(crate) fn set_exposes(&mut self, exposes: Vec<Expose>) {
        self.exposes = exposes;
    }

    pub(crate) fn set_firmware_version(&mut self, version: Option<u32>) {
        self.firmware_version = version;
    }

    pub(crate) fn apply_definition(&mut self, definition: DeviceDefinition) {
        if definition.model_id.is_some() {
            self.model_id = definition.model_id;
        }
        for endpoint in definition.exposes.iter().filter_map(|e| e.endpoint) {
            self.endpoints.insert(endpoint);
        }
        self.exposes = definition.exposes;
        self.supports_ota = definition.supports_ota;
        if definition.firmware_version.is_some() {
            self.firmware_version = definition.firmware_version;
        }
    }

    pub(crate) fn merge_descriptor(&mut self, descriptor: DeviceDescriptor) {
        self.network_address = descriptor.network_address;
        if descriptor.device_type != DeviceType::Unknown {
            self.device_type = descriptor.device_type;
        }
        if descriptor.power_source != PowerSource::Unknown {
            self.power_source = descriptor.power_source;
        }
        if descriptor.model_id.is_some() {
            self.model_id = descriptor.model_id;
        }
        self.endpoints.extend(descriptor.endpoints);
    }
}
