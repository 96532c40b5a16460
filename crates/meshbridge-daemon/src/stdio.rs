//! JSON-lines endpoints for the radio and the broker
//!
//! Input lines carry either a radio event or a broker message:
//!
//! ```text
//! {"radio": {"event": "device_joined", "ieee_addr": "0x00124b0001020304", "network_address": 1}}
//! {"mqtt": {"topic": "meshbridge/lamp/set", "payload": {"state": "ON"}}}
//! ```
//!
//! Publishes and radio commands are written to stdout, one JSON object per
//! line. Radio commands are acknowledged immediately.

use async_trait::async_trait;
use meshbridge_bridge::{Broker, Inbound, PublishError, Radio, RadioEvent};
use meshbridge_core::{Payload, PublishOptions, RadioCommand, RadioError, RadioResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Shared line writer for everything the daemon emits
pub type Output = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub fn stdout() -> Output {
    Arc::new(Mutex::new(Box::new(tokio::io::stdout())))
}

async fn write_line(output: &Output, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    let mut out = output.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InputLine {
    Radio(RadioEvent),
    Mqtt { topic: String, payload: Value },
}

/// Parse one input line; blank lines and comments yield `None`
pub fn parse_line(line: &str) -> Result<Option<Inbound>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let inbound = match serde_json::from_str::<InputLine>(line)? {
        InputLine::Radio(event) => Inbound::Radio(event),
        InputLine::Mqtt { topic, payload } => {
            let payload = match payload {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Inbound::Broker { topic, payload }
        }
    };
    Ok(Some(inbound))
}

/// Forward input lines to the bridge until EOF; returns the number forwarded
pub async fn read_input<R>(reader: R, tx: mpsc::UnboundedSender<Inbound>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    let mut number = 0;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        match parse_line(&line) {
            Ok(Some(inbound)) => {
                if tx.send(inbound).is_err() {
                    debug!("Bridge gone, stopping input");
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(line = number, error = %e, "Skipping malformed input line"),
        }
    }
    Ok(forwarded)
}

/// Broker that writes every publish as a JSON line
pub struct LineBroker {
    output: Output,
}

impl LineBroker {
    pub fn new(output: Output) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Broker for LineBroker {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), PublishError> {
        let line = json!({
            "topic": topic,
            "payload": payload,
            "retain": options.retain,
            "qos": options.qos,
        });
        write_line(&self.output, &line)
            .await
            .map_err(|e| PublishError::Io(e.to_string()))
    }
}

/// Radio that echoes commands as JSON lines and answers them locally
pub struct EchoRadio {
    output: Output,
}

impl EchoRadio {
    pub fn new(output: Output) -> Self {
        Self { output }
    }
}

fn local_response(command: &RadioCommand) -> Result<RadioResponse, RadioError> {
    match command {
        RadioCommand::Read { .. } => Ok(RadioResponse::Read { values: Payload::new() }),
        RadioCommand::OtaCheck { .. } => Ok(RadioResponse::OtaCheck {
            update_available: false,
            latest_version: None,
        }),
        // no image source behind this endpoint
        RadioCommand::OtaUpdate { .. } => Err(RadioError::Unavailable),
        RadioCommand::NetworkMap => Ok(RadioResponse::NetworkMap {
            map: json!({"nodes": [], "links": []}),
        }),
        _ => Ok(RadioResponse::Ack),
    }
}

#[async_trait]
impl Radio for EchoRadio {
    async fn execute(&self, command: RadioCommand) -> Result<RadioResponse, RadioError> {
        let line = json!({ "radio": &command });
        if let Err(e) = write_line(&self.output, &line).await {
            warn!(error = %e, "Failed to write radio command");
            return Err(RadioError::Unavailable);
        }
        local_response(&command)
    }
}
