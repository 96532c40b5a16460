//! Error types for the bridge runtime

use meshbridge_core::{RadioError, RegistryError, SettingsError, StateError};
use thiserror::Error;

use crate::persist::PersistError;

/// Failure reported by the broker client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("broker disconnected")]
    Disconnected,
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("IO error: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("extension '{extension}' failed: {error}")]
    HandlerFailed { extension: String, error: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("radio command failed: {0}")]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("state file: {0}")]
    Persist(#[from] PersistError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
