//! Call lifecycle sink
//!
//! The core reports start/answer/end/disposition events to whatever keeps
//! call detail records. Delivery is fire-and-forget: a failing sink is
//! logged by [`publish`] and never reaches call processing.

use crate::domain::call::CallEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Sink rejected event: {0}")]
    Rejected(String),
}

/// Consumer of call lifecycle events
#[cfg_attr(test, mockall::automock)]
pub trait CallEventSink: Send + Sync {
    fn emit(&self, event: &CallEvent) -> Result<(), SinkError>;
}

/// Hand events to a sink, swallowing its failures
pub fn publish(sink: &dyn CallEventSink, events: Vec<CallEvent>) {
    for event in events {
        if let Err(e) = sink.emit(&event) {
            warn!("Lifecycle sink dropped {} for call {}: {}", event.event_type(), event.call_id(), e);
        }
    }
}

/// Writes each event as a JSON log line
#[derive(Debug, Default)]
pub struct LogEventSink;

impl CallEventSink for LogEventSink {
    fn emit(&self, event: &CallEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event).map_err(|e| SinkError::Rejected(e.to_string()))?;
        info!(target: "cdr", "{}", json);
        Ok(())
    }
}

/// Forwards events to an async consumer over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CallEventSink for ChannelEventSink {
    fn emit(&self, event: &CallEvent) -> Result<(), SinkError> {
        self.tx.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}
