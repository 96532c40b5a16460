//! Meshbridge Bridge - runtime that connects a mesh radio to a pub/sub broker
//!
//! This crate provides:
//! - The [`Bridge`] runtime and its single-task event loop
//! - The extension framework and the built-in extensions
//! - Collaborator traits for the radio driver and the broker client
//! - State file persistence

pub mod bridge;
pub mod collab;
pub mod core;
pub mod error;
pub mod extension;
pub mod extensions;
pub mod intake;
pub mod persist;
pub mod timers;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use collab::{Broker, Inbound, Radio, RadioEvent};
pub use self::core::{Core, OutboundPublish};
pub use error::{BridgeError, PublishError, Result};
pub use extension::{Extension, ExtensionHost};
pub use extensions::{default_extensions, BridgeRequest};
pub use persist::{PersistError, PersistedEntity, PersistedState};
pub use timers::Timers;
