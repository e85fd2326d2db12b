//! Observable stream events.
//!
//! Background failures never surface as returned errors; subscribers learn
//! about degraded or failed streams only through this bus.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::stream::{StreamId, StreamState};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First health signal of an attempt; the stream is now `Streaming`.
    Connected { id: StreamId, source: String },
    /// An attempt failed; the stream is now `Retrying`.
    Error {
        id: StreamId,
        source: String,
        error: String,
        attempt: u32,
    },
    /// Retries exhausted; the stream was removed.
    Failed {
        id: StreamId,
        source: String,
        reason: String,
    },
    AudioAcquired { id: StreamId },
    AudioReleased { id: StreamId },
    StateChanged {
        id: StreamId,
        from: StreamState,
        to: StreamState,
    },
}

/// Broadcast bus shared by the manager, supervisors and the audio slot.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Log the event and deliver it to current subscribers, if any.
    pub fn emit(&self, event: StreamEvent) {
        match &event {
            StreamEvent::Connected { id, source } => {
                tracing::info!(stream = %id, %source, "stream connected");
            }
            StreamEvent::Error {
                id,
                source,
                error,
                attempt,
            } => {
                tracing::warn!(stream = %id, %source, attempt, %error, "stream attempt failed");
            }
            StreamEvent::Failed { id, source, reason } => {
                tracing::error!(stream = %id, %source, %reason, "stream failed");
            }
            StreamEvent::AudioAcquired { id } => {
                tracing::info!(stream = %id, "audio acquired");
            }
            StreamEvent::AudioReleased { id } => {
                tracing::info!(stream = %id, "audio released");
            }
            StreamEvent::StateChanged { .. } => {}
        }
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
