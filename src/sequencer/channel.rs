//! Inbound control and outbound reporting.
//!
//! Control signals and data payloads travel on two separate `mpsc` channels, so a
//! state pending for `Pause`/`Resume`/`Abort` never has to look at, or put back,
//! a payload meant for Waiting. Results go out on a `broadcast` channel and are
//! mirrored into a latest-value map for late subscribers.

use super::control_loop::ManualCommand;
use super::expander::SequenceSpec;
use crate::core::ParameterMap;
use crate::error::{AppResult, SequencerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

/// Control signal sent to the running machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// Hold the next transition.
    Pause,
    /// Release a pause.
    Resume,
    /// Cancel the running actions and return to the idle state.
    Abort,
}

/// Work handed to the Waiting state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Build a control loop from these sequences and run it.
    Series(Vec<SequenceSpec>),
    /// Apply a one-shot command.
    Manual(ManualCommand),
}

/// Something the rig wants the outside world to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Report {
    /// An instrument's confirmed parameters.
    Parameters {
        /// Instrument identifier
        instrument: String,
        /// Full read-back
        parameters: ParameterMap,
    },
    /// A state failed and the machine stopped in Troubleshooting.
    Fault {
        /// State that failed
        state: String,
        /// Failing action and its error
        message: String,
    },
    /// A series ran to completion.
    SeriesComplete {
        /// Number of sequences run
        sequences: usize,
    },
    /// A manual command was applied.
    ManualComplete,
}

/// Publishing half of the outbound channel.
#[derive(Debug, Clone)]
pub struct Publisher {
    reports: broadcast::Sender<Report>,
    latest: Arc<RwLock<BTreeMap<String, ParameterMap>>>,
}

impl Publisher {
    fn new(capacity: usize) -> Self {
        let (reports, _) = broadcast::channel(capacity);
        Self {
            reports,
            latest: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Publish an instrument's parameters and remember them.
    pub fn parameters(&self, instrument: &str, parameters: ParameterMap) {
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instrument.to_string(), parameters.clone());
        self.send(Report::Parameters {
            instrument: instrument.to_string(),
            parameters,
        });
    }

    /// Broadcast `report` to every subscriber.
    pub fn send(&self, report: Report) {
        // No subscribers is not an error
        if self.reports.send(report).is_err() {
            debug!("Report dropped: no subscribers");
        }
    }

    /// Receive every report sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.reports.subscribe()
    }

    /// Last parameters published for every instrument.
    pub fn latest(&self) -> BTreeMap<String, ParameterMap> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// External side of the channels: what a GUI or script holds.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    signals: mpsc::Sender<Signal>,
    payloads: mpsc::Sender<Payload>,
    publisher: Publisher,
}

impl ControlHandle {
    /// Send a control signal.
    pub async fn signal(&self, signal: Signal) -> AppResult<()> {
        self.signals
            .send(signal)
            .await
            .map_err(|_| closed("signal"))
    }

    /// Queue work for the Waiting state.
    pub async fn submit(&self, payload: Payload) -> AppResult<()> {
        self.payloads
            .send(payload)
            .await
            .map_err(|_| closed("payload"))
    }

    /// Send [`Signal::Pause`].
    pub async fn pause(&self) -> AppResult<()> {
        self.signal(Signal::Pause).await
    }

    /// Send [`Signal::Resume`].
    pub async fn resume(&self) -> AppResult<()> {
        self.signal(Signal::Resume).await
    }

    /// Send [`Signal::Abort`].
    pub async fn abort(&self) -> AppResult<()> {
        self.signal(Signal::Abort).await
    }

    /// Receive every report sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.publisher.subscribe()
    }

    /// Last parameters published for every instrument.
    pub fn latest(&self) -> BTreeMap<String, ParameterMap> {
        self.publisher.latest()
    }
}

fn closed(channel: &str) -> SequencerError {
    SequencerError::Configuration(format!("The {} channel is closed", channel))
}

/// Machine side of the channels.
#[derive(Debug)]
pub struct ControlChannel {
    signals: Arc<Mutex<mpsc::Receiver<Signal>>>,
    payloads: Mutex<mpsc::Receiver<Payload>>,
    publisher: Publisher,
}

impl ControlChannel {
    /// Create both ends with the given capacities.
    pub fn new(
        signal_capacity: usize,
        payload_capacity: usize,
        broadcast_capacity: usize,
    ) -> (Self, ControlHandle) {
        let (signal_tx, signal_rx) = mpsc::channel(signal_capacity);
        let (payload_tx, payload_rx) = mpsc::channel(payload_capacity);
        let publisher = Publisher::new(broadcast_capacity);

        let channel = Self {
            signals: Arc::new(Mutex::new(signal_rx)),
            payloads: Mutex::new(payload_rx),
            publisher: publisher.clone(),
        };
        let handle = ControlHandle {
            signals: signal_tx,
            payloads: payload_tx,
            publisher,
        };
        (channel, handle)
    }

    /// Outbound report publisher.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub(crate) fn signals(&self) -> Arc<Mutex<mpsc::Receiver<Signal>>> {
        Arc::clone(&self.signals)
    }

    /// Wait for the next payload. `None` once every handle is dropped.
    pub async fn next_payload(&self) -> Option<Payload> {
        self.payloads.lock().await.recv().await
    }
}
