//! Bridge runtime
//!
//! One [`Bridge`] owns the core and the extensions and is driven by a single
//! task. Radio commands and publishes queued during a dispatch are spawned
//! as tasks once the bus has drained; their completions come back through
//! the inbound channel and are handled like any other input.

use meshbridge_core::{Event, RadioCommand, RadioCompletion, RadioError, RadioResponse, RequestId, Settings};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::collab::{Broker, Inbound, Radio};
use crate::core::{Core, OutboundPublish};
use crate::extension::{Extension, ExtensionHost};
use crate::extensions::default_extensions;
use crate::intake;

/// Retries after the first attempt of an idempotent command
const RADIO_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Current time on the tokio clock, so paused-time tests drive the bridge
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct Bridge {
    core: Core,
    host: ExtensionHost,
    radio: Arc<dyn Radio>,
    broker: Arc<dyn Broker>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    /// Shared with the IO tasks, which release their slot when the
    /// completion cannot be delivered
    in_flight: Arc<AtomicUsize>,
}

impl Bridge {
    /// A bridge running the default extensions
    pub fn new(
        settings: Settings,
        radio: Arc<dyn Radio>,
        broker: Arc<dyn Broker>,
        state_path: Option<PathBuf>,
    ) -> Self {
        Self::with_extensions(settings, radio, broker, default_extensions(state_path))
    }

    pub fn with_extensions(
        settings: Settings,
        radio: Arc<dyn Radio>,
        broker: Arc<dyn Broker>,
        extensions: Vec<Box<dyn Extension>>,
    ) -> Self {
        let mut host = ExtensionHost::new();
        for extension in extensions {
            host.register(extension);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: Core::new(settings, now(), chrono::Utc::now()),
            host,
            radio,
            broker,
            tx,
            rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sender for radio events and broker messages
    pub fn inbound(&self) -> mpsc::UnboundedSender<Inbound> {
        self.tx.clone()
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn extensions(&self) -> Vec<&'static str> {
        self.host.names()
    }

    /// Start every extension; failed ones are logged and left stopped
    pub fn start(&mut self, now: Instant) {
        self.core.advance(now);
        for (name, e) in self.host.start_all(&mut self.core) {
            error!(extension = name, error = %e, "Extension failed to start");
        }
        self.host.drain(&mut self.core);
        info!(
            extensions = ?self.host.names(),
            devices = self.core.registry.devices().count(),
            groups = self.core.registry.groups().count(),
            "Bridge started"
        );
        self.flush_io();
    }

    /// Handle one input, then run whatever it queued
    pub fn handle(&mut self, inbound: Inbound, now: Instant) {
        self.host.fire_due(&mut self.core, now);
        match inbound {
            Inbound::Radio(event) => {
                trace!(?event, "Radio event");
                if let Err(e) = intake::handle_radio_event(&mut self.core, event) {
                    warn!(error = %e, "Failed to handle radio event");
                }
            }
            Inbound::Broker { topic, payload } => {
                trace!(topic = %topic, "Broker message");
                self.core.emit(Event::MqttMessage { topic, payload });
            }
            Inbound::RadioCompleted(completion) => {
                release(&self.in_flight);
                if let Err(e) = &completion.result {
                    debug!(request = %completion.id, error = %e, "Radio command failed");
                }
                self.core.emit(Event::RadioCompleted(completion));
            }
            Inbound::PublishCompleted {
                topic,
                payload,
                options,
                result,
            } => {
                release(&self.in_flight);
                match result {
                    Ok(()) => self.core.emit(Event::MqttMessagePublished { topic, payload, options }),
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Publish failed");
                        self.core.emit(Event::PublishFailed {
                            topic,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        self.host.drain(&mut self.core);
        self.flush_io();
    }

    /// Fire expired timers and debounce windows
    pub fn fire_due(&mut self, now: Instant) {
        self.host.fire_due(&mut self.core, now);
        self.flush_io();
    }

    /// Earliest timer or debounce deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.core.store.next_deadline(), self.core.timers.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Commands and publishes still waiting for a completion
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Process inbound messages until nothing is in flight
    pub async fn settle(&mut self) {
        while self.in_flight() > 0 {
            match self.rx.recv().await {
                Some(inbound) => self.handle(inbound, now()),
                None => break,
            }
        }
    }

    /// Stop every extension in reverse order and run their last IO
    pub fn stop(&mut self, now: Instant) {
        self.core.advance(now);
        self.host.stop_all(&mut self.core);
        self.host.drain(&mut self.core);
        self.flush_io();
        info!("Bridge stopped");
    }

    /// Run until `shutdown` resolves, then stop and wait for pending IO
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.start(now());
        loop {
            let deadline = self.next_deadline();
            let wake = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);
            // queued input is handled before shutdown is considered
            tokio::select! {
                biased;
                inbound = self.rx.recv() => match inbound {
                    Some(inbound) => self.handle(inbound, now()),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => self.fire_due(now()),
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
        self.stop(now());
        self.settle().await;
    }

    fn flush_io(&mut self) {
        for (id, command) in self.core.take_radio_commands() {
            self.spawn_radio(id, command);
        }
        for publish in self.core.take_publishes() {
            self.spawn_publish(publish);
        }
    }

    fn spawn_radio(&mut self, id: RequestId, command: RadioCommand) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let radio = self.radio.clone();
        let tx = self.tx.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = execute(radio.as_ref(), &command).await;
            deliver(&tx, &in_flight, Inbound::RadioCompleted(RadioCompletion { id, command, result }));
        });
    }

    fn spawn_publish(&mut self, publish: OutboundPublish) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let broker = self.broker.clone();
        let tx = self.tx.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let OutboundPublish {
                topic,
                payload,
                options,
            } = publish;
            let result = broker.publish(&topic, &payload, options).await;
            deliver(
                &tx,
                &in_flight,
                Inbound::PublishCompleted {
                    topic,
                    payload,
                    options,
                    result,
                },
            );
        });
    }
}

/// Decrement the in-flight count, never below zero
fn release(in_flight: &AtomicUsize) {
    let _ = in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// Hand a completion back to the bridge task; one that cannot be delivered
/// releases its slot here
fn deliver(tx: &mpsc::UnboundedSender<Inbound>, in_flight: &AtomicUsize, inbound: Inbound) {
    if let Err(e) = tx.send(inbound) {
        warn!(completion = ?e.0, "Bridge input closed, dropping completion");
        release(in_flight);
    }
}

/// Execute a command, retrying idempotent ones on transient failures
async fn execute(radio: &dyn Radio, command: &RadioCommand) -> Result<RadioResponse, RadioError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match radio.execute(command.clone()).await {
            Err(e) if e.is_transient() && command.is_idempotent() && attempt < RADIO_RETRIES => {
                attempt += 1;
                debug!(?command, attempt, error = %e, "Retrying radio command");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            result => return result,
        }
    }
}
