//! External collaborators: the radio driver and the broker client
//!
//! The bridge only sees these through the traits below. Calls are made from
//! spawned tasks; results come back to the bridge as [`Inbound`] messages.

use async_trait::async_trait;
use meshbridge_core::{
    DeviceDefinition, DeviceDescriptor, DeviceMessage, IeeeAddr, InterviewStatus, PublishOptions, RadioCommand,
    RadioCompletion, RadioError, RadioResponse,
};
use serde::{Deserialize, Serialize};

use crate::error::PublishError;

/// Radio driver: executes commands against the mesh network
#[async_trait]
pub trait Radio: Send + Sync {
    async fn execute(&self, command: RadioCommand) -> Result<RadioResponse, RadioError>;
}

/// Broker client: publish side only; inbound messages arrive as [`Inbound::Broker`]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), PublishError>;
}

/// Raw event from the radio driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RadioEvent {
    DeviceJoined(DeviceDescriptor),
    DeviceInterview {
        ieee_addr: IeeeAddr,
        status: InterviewStatus,
        /// Present when the interview succeeded
        #[serde(default)]
        definition: Option<DeviceDefinition>,
    },
    DeviceAnnounce {
        ieee_addr: IeeeAddr,
        network_address: u16,
    },
    NetworkAddressChanged {
        ieee_addr: IeeeAddr,
        network_address: u16,
    },
    DeviceLeave {
        ieee_addr: IeeeAddr,
    },
    Message(DeviceMessage),
    OtaProgress {
        ieee_addr: IeeeAddr,
        percent: f32,
    },
}

/// Everything that enters the bridge task
#[derive(Debug)]
pub enum Inbound {
    Radio(RadioEvent),
    Broker { topic: String, payload: String },
    RadioCompleted(RadioCompletion),
    PublishCompleted {
        topic: String,
        payload: String,
        options: PublishOptions,
        result: Result<(), PublishError>,
    },
}
