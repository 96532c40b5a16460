//! Firmware update states for scheduled OTA checks
//!
//! Image transfer is done by the radio driver; the bridge only tracks where
//! each device is in the check/update cycle and exposes it as the `update`
//! attribute of the device state.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// OTA state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    #[default]
    Idle,
    /// Asking the image server whether a newer image exists
    Checking,
    UpdateAvailable,
    /// Image transfer in progress
    Updating,
    /// Last update failed; only a manual update leaves this state
    Failed,
}

impl OtaState {
    /// A check or transfer is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self, OtaState::Checking | OtaState::Updating)
    }

    /// Scheduled checks only run from these states
    pub fn accepts_scheduled_check(&self) -> bool {
        matches!(self, OtaState::Idle | OtaState::UpdateAvailable)
    }

    /// Value of `update.state` in the published device state
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaState::Idle => "idle",
            OtaState::Checking => "checking",
            OtaState::UpdateAvailable => "available",
            OtaState::Updating => "updating",
            OtaState::Failed => "failed",
        }
    }
}

/// Whether the image server offers something newer than what is installed
///
/// An unknown installed version counts as outdated when the server names a
/// version; an unknown latest version trusts the server's availability flag.
pub fn is_newer(installed: Option<u32>, latest: Option<u32>, server_says_available: bool) -> bool {
    match (installed, latest) {
        (Some(installed), Some(latest)) => latest > installed,
        (None, Some(_)) => true,
        (_, None) => server_says_available,
    }
}

/// Build the `update` attribute published with the device state
pub fn update_attribute(
    state: OtaState,
    progress: Option<f32>,
    installed_version: Option<u32>,
    latest_version: Option<u32>,
) -> Value {
    let mut update = json!({
        "state": state.as_str(),
        "installed_version": installed_version,
        "latest_version": latest_version,
    });
    if let (Some(progress), Value::Object(map)) = (progress, &mut update) {
        map.insert("progress".to_string(), json!(progress));
    }
    update
}
