//! Configuration loading and validation

use anyhow::{Context, Result};
use meshbridge_core::Settings;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load settings from a TOML file; a missing file means defaults
pub fn load_config(path: &Path) -> Result<Settings> {
    let settings = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings =
            toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        settings
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Settings::default()
    };

    settings
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(settings)
}

/// Default state file: `state.json` next to the configuration file
pub fn default_state_path(config: &Path) -> PathBuf {
    match config.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join("state.json"),
        _ => PathBuf::from("state.json"),
    }
}
