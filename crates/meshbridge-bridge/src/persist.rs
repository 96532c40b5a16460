//! Persisted entity state (`state.json`)
//!
//! One record per entity, keyed by stable id, with the cached attributes,
//! last seen and availability. Devices and groups are saved alongside so
//! the registry can be rebuilt before the radio reports them again.

use chrono::{DateTime, Utc};
use meshbridge_core::{Availability, Device, EntityId, Group, LastSeen, Payload};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntity {
    pub entity: EntityId,
    #[serde(default)]
    pub state: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<LastSeen>,
    #[serde(default)]
    pub availability: Availability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub entities: Vec<PersistedEntity>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl PersistedState {
    pub fn new(saved_at: DateTime<Utc>, entities: Vec<PersistedEntity>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at,
            entities,
        }
    }

    /// Load the state file; a missing file is not an error
    pub fn load(path: &Path) -> Result<Option<Self>, PersistError> {
        if !path.exists() {
            debug!(path = %path.display(), "No state file");
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let state: PersistedState = serde_json::from_str(&content)?;
        if state.version != STATE_VERSION {
            return Err(PersistError::UnsupportedVersion(state.version));
        }
        info!(path = %path.display(), entities = state.entities.len(), "Loaded state file");
        Ok(Some(state))
    }

    /// Write the file next to its final path, then move it into place
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entities = self.entities.len(), "Saved state file");
        Ok(())
    }
}
