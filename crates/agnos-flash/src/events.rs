//! Observable run state
//!
//! Every change the orchestrator makes is published as a [`FlashEvent`] at the
//! point of change. Each subscriber owns an unbounded queue, so a slow reader
//! sees every event in order and never loses a step or error change. The
//! latest values are also kept so that late subscribers can read a
//! [`FlashStatus`] snapshot.

use std::sync::Arc;

use agnos_progress::{INDETERMINATE, ProgressSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, trace};

use crate::error::ErrorKind;
use crate::manager::Step;

/// Receiving end of a subscription
pub type EventReceiver = mpsc::UnboundedReceiver<FlashEvent>;

/// A single change of observable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FlashEvent {
    /// Current stage changed
    Step(Step),
    /// Status message changed
    Message(String),
    /// Overall progress in `[0, 1]`, or the indeterminate sentinel
    Progress(f64),
    /// Error flag changed
    Error(Option<ErrorKind>),
    /// Device connection changed
    Connection(bool),
    /// Device serial became known
    Serial(String),
}

/// Snapshot of observable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashStatus {
    /// Current stage
    pub step: Step,
    /// Sticky error, if any
    pub error: Option<ErrorKind>,
    /// Last status message
    pub message: String,
    /// Last progress value
    pub progress: f64,
    /// Whether a device is connected
    pub connected: bool,
    /// Device serial, once known
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Latest {
    message: String,
    progress: Option<f64>,
}

/// Publishes events and remembers the latest message and progress
#[derive(Debug, Clone)]
pub struct EventEmitter {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<FlashEvent>>>>,
    latest: Arc<Mutex<Latest>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    /// Emitter without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            latest: Arc::new(Mutex::new(Latest::default())),
        }
    }

    /// Subscribe to subsequent events.
    ///
    /// The receiver yields `None` once every clone of the emitter is dropped.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event.
    pub fn emit(&self, event: FlashEvent) {
        match &event {
            FlashEvent::Message(message) => {
                if !message.is_empty() {
                    info!("{message}");
                }
                self.latest.lock().message.clone_from(message);
            }
            FlashEvent::Progress(value) => self.latest.lock().progress = Some(*value),
            _ => {}
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            trace!("No event subscribers");
        }
    }

    /// Publish a status message.
    pub fn message(&self, message: impl Into<String>) {
        self.emit(FlashEvent::Message(message.into()));
    }

    /// Publish a progress value.
    pub fn progress(&self, value: f64) {
        self.emit(FlashEvent::Progress(value));
    }

    /// Sink publishing every value it receives as progress.
    pub fn progress_sink(&self) -> ProgressSink {
        let emitter = self.clone();
        Arc::new(move |value: f64| emitter.progress(value))
    }

    /// Last published message.
    pub fn last_message(&self) -> String {
        self.latest.lock().message.clone()
    }

    /// Last published progress, indeterminate before any.
    pub fn last_progress(&self) -> f64 {
        self.latest.lock().progress.unwrap_or(INDETERMINATE)
    }
}
