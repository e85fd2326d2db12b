//! Stream records and their state machine.
//!
//! A stream record is the authoritative state for one `(source, quality)`
//! pair. It is created by `start_stream` and destroyed by `stop_stream`,
//! by exhausting its retries, or by `stop_all_streams`.
//!
//! ## Lifecycle
//!
//! ```text
//! start_stream              -> Idle -> Connecting
//! first health signal       -> Streaming   (attempt reset to 0)
//! watchdog / connect error  -> Retrying    (attempt + 1)
//! adapter died mid-stream   -> Retrying    (attempt + 1)
//! backoff elapsed           -> Connecting  (attempt < max_retries)
//! backoff elapsed           -> Failed      (attempt >= max_retries, removed)
//! stop_stream               -> Stopped     (removed)
//! ```
//!
//! Only the stream's supervisor task writes `state` and `attempt` while it
//! runs; after it has been joined, the stopping caller is the only writer.

pub mod ports;
pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{MuxError, Result};
use crate::events::{EventBus, StreamEvent};
use crate::relay::{Framing, Relay, RelayClient};
use crate::source::{Quality, Source};

pub use ports::PortAllocator;
pub use registry::{StreamEntry, StreamRegistry};

static RECORD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Composite stream key: one record per `(source_id, quality)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId {
    pub source_id: String,
    pub quality: Quality,
}

impl StreamId {
    pub fn new(source_id: &str, quality: Quality) -> Self {
        Self {
            source_id: source_id.to_string(),
            quality,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.quality)
    }
}

/// Per-stream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Record created, supervisor not yet connecting.
    Idle,
    /// Adapter opened, waiting for its first health signal.
    Connecting,
    /// Output is flowing to the relay.
    Streaming,
    /// Waiting out the backoff before the next attempt.
    Retrying,
    /// Retries exhausted. Terminal.
    Failed,
    /// Explicitly stopped. Terminal.
    Stopped,
}

impl StreamState {
    /// Counts against the connection ceiling.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming | Self::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// States in which the record owns an open adapter.
    pub fn holds_adapter(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of a record's public fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub source_id: String,
    pub source_name: String,
    pub quality: Quality,
    pub state: StreamState,
    pub attempt: u32,
    pub port: u16,
    pub uptime_secs: u64,
    pub bytes_transferred: u64,
    pub clients_connected: usize,
    pub has_audio: bool,
}

/// Authoritative state for one `(source, quality)` pair.
///
/// The state lives in a `watch` channel so status readers never block on a
/// transition and relay clients can wait for `Connecting` to resolve.
pub struct StreamRecord {
    pub id: StreamId,
    pub source: Arc<Source>,
    /// Proxy port assigned by the [`PortAllocator`].
    pub port: u16,
    instance: u64,
    state: watch::Sender<StreamState>,
    attempt: AtomicU32,
    started_at: RwLock<Option<Instant>>,
    has_audio: AtomicBool,
    relay: Relay,
}

impl StreamRecord {
    pub fn new(source: Arc<Source>, quality: Quality, port: u16, framing: Framing) -> Self {
        let id = StreamId::new(&source.id, quality);
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            relay: Relay::new(id.clone(), framing),
            id,
            source,
            port,
            instance: RECORD_COUNTER.fetch_add(1, Ordering::SeqCst),
            state,
            attempt: AtomicU32::new(0),
            started_at: RwLock::new(None),
            has_audio: AtomicBool::new(false),
        }
    }

    /// Unique per record instance; distinguishes a replacement from the
    /// record it replaced under the same key.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Apply a transition and publish it. No event for a same-state write.
    pub(crate) fn transition(&self, to: StreamState, events: &EventBus) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::debug!(stream = %self.id, %from, %to, "state transition");
            events.emit(StreamEvent::StateChanged {
                id: self.id.clone(),
                from,
                to,
            });
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Count a failed attempt, returning the new count.
    pub(crate) fn record_failure(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_attempt(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    pub(crate) fn mark_started(&self) {
        *self.started_at.write() = Some(Instant::now());
    }

    /// Time since the current attempt started, while streaming.
    pub fn uptime(&self) -> Duration {
        if self.state() != StreamState::Streaming {
            return Duration::ZERO;
        }
        self.started_at
            .read()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio.load(Ordering::SeqCst)
    }

    pub(crate) fn set_audio(&self, active: bool) {
        self.has_audio.store(active, Ordering::SeqCst);
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Attach a relay client.
    ///
    /// A record that has not finished connecting gets up to `wait` to reach
    /// `Streaming`; any other state is refused without counting the client.
    pub async fn connect_client(&self, wait: Duration) -> Result<RelayClient> {
        let mut state_rx = self.state.subscribe();
        let pending = matches!(
            *state_rx.borrow_and_update(),
            StreamState::Idle | StreamState::Connecting
        );
        if pending {
            let _ = tokio::time::timeout(
                wait,
                state_rx.wait_for(|s| !matches!(s, StreamState::Idle | StreamState::Connecting)),
            )
            .await;
        }

        let state = self.state();
        if state != StreamState::Streaming {
            return Err(MuxError::NotAvailable(format!("{} is {state}", self.id)));
        }
        self.relay
            .subscribe()
            .ok_or_else(|| MuxError::NotAvailable(format!("{} relay is closed", self.id)))
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            source_id: self.source.id.clone(),
            source_name: self.source.name.clone(),
            quality: self.id.quality,
            state: self.state(),
            attempt: self.attempt(),
            port: self.port,
            uptime_secs: self.uptime().as_secs(),
            bytes_transferred: self.relay.bytes_transferred(),
            clients_connected: self.relay.clients_connected(),
            has_audio: self.has_audio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StreamRecord {
        let source = Arc::new(Source::new("cam1", "Door").with_low_url("rtsp://cam1/sub"));
        StreamRecord::new(source, Quality::Low, 9000, Framing::raw("video/mp2t"))
    }

    #[test]
    fn stream_id_display() {
        assert_eq!(StreamId::new("cam1", Quality::High).to_string(), "cam1:high");
    }

    #[test]
    fn state_classes() {
        assert!(StreamState::Retrying.is_active());
        assert!(!StreamState::Idle.is_active());
        assert!(StreamState::Failed.is_terminal());
        assert!(StreamState::Connecting.holds_adapter());
        assert!(!StreamState::Retrying.holds_adapter());
    }

    #[test]
    fn instances_are_unique() {
        assert_ne!(record().instance(), record().instance());
    }

    #[tokio::test]
    async fn transition_emits_state_changed_once() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let record = record();

        record.transition(StreamState::Connecting, &events);
        record.transition(StreamState::Connecting, &events);

        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::StateChanged {
                id: record.id.clone(),
                from: StreamState::Idle,
                to: StreamState::Connecting,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failure_counter() {
        let record = record();
        assert_eq!(record.record_failure(), 1);
        assert_eq!(record.record_failure(), 2);
        record.reset_attempt();
        assert_eq!(record.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_only_while_streaming() {
        let events = EventBus::new();
        let record = record();
        record.mark_started();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(record.uptime(), Duration::ZERO);

        record.transition(StreamState::Streaming, &events);
        assert_eq!(record.status().uptime_secs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_refused_while_retrying() {
        let events = EventBus::new();
        let record = record();
        record.transition(StreamState::Retrying, &events);

        let err = record
            .connect_client(Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MuxError::NotAvailable(_)));
        assert_eq!(record.relay().clients_connected(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_waits_for_connecting_stream() {
        let events = EventBus::new();
        let record = Arc::new(record());
        record.transition(StreamState::Connecting, &events);

        let promoter = {
            let record = record.clone();
            let events = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                record.relay().open();
                record.transition(StreamState::Streaming, &events);
            })
        };

        let client = record.connect_client(Duration::from_secs(1)).await;
        assert!(client.is_ok());
        assert_eq!(record.relay().clients_connected(), 1);
        promoter.await.unwrap();
    }
}
