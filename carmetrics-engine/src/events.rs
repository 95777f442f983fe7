//! Change notifications for consumers.

use crate::parameter::{Parameter, Value};
use crate::series::SeriesSnapshot;
use crate::transport::ConnectionStatus;
use log::debug;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Value { parameter: Parameter, value: Value },
    Series(SeriesSnapshot),
    /// `"<code> - <description>"` entries, stored then pending then permanent
    DtcCodes(Vec<String>),
    Warnings { engine: bool, general: bool },
    Connection(ConnectionStatus),
    Logging(bool),
    /// Most recent activity log lines
    Activity(Vec<String>),
}

/// Fan-out of [`TelemetryEvent`]s to every subscriber.
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<TelemetryEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<TelemetryEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: &TelemetryEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.len() < before {
            debug!("Dropped {} closed subscribers", before - subscribers.len());
        }
    }

    /// One `Value` event per entry
    pub fn publish_values(&self, values: &[(Parameter, Value)]) {
        for (parameter, value) in values {
            self.publish(&TelemetryEvent::Value {
                parameter: *parameter,
                value: value.clone(),
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
