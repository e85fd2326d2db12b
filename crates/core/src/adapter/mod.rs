//! Source adapters: the pluggable byte producers behind each stream.
//!
//! An adapter turns a source locator and a quality profile into a stream of
//! [`AdapterEvent`]s. The manager only ever sees the narrow contract:
//!
//! - **Open**: [`SourceAdapter::open`] returns an [`AdapterHandle`], or a
//!   connect error when nothing could be started.
//! - **Health**: the handle yields exactly one [`AdapterEvent::Connected`]
//!   the first time output is confirmed flowing, then data chunks and zero
//!   or more [`AdapterEvent::Error`]s. Channel end means the adapter exited.
//! - **Close**: [`AdapterHandle::close`] is idempotent and bounded; an
//!   adapter that ignores cancellation past its grace period is aborted.
//!
//! | Adapter | Module | Framing |
//! |---------|--------|---------|
//! | ffmpeg subprocess | [`ffmpeg`] | raw MPEG-TS |
//! | placeholder frames | [`synthetic`] | multipart SVG |

pub mod ffmpeg;
pub mod synthetic;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AdapterKind, ManagerConfig, QualityProfile};
use crate::error::Result;
use crate::relay::Framing;
use crate::source::Quality;
use crate::stream::StreamId;

pub use ffmpeg::FfmpegAdapter;
pub use synthetic::SyntheticAdapter;

const ADAPTER_EVENT_BUFFER: usize = 64;

/// Extra time past the grace period before a closing adapter task is aborted.
const CLOSE_MARGIN: Duration = Duration::from_millis(500);

/// Everything an adapter needs to open one stream.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub id: StreamId,
    pub source_name: String,
    pub locator: String,
    pub quality: Quality,
    pub profile: QualityProfile,
    /// Whether the stream held the audio channel when this attempt started.
    pub audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Connected,
    Data(Bytes),
    Error(String),
}

/// Byte-producing capability selected by configuration.
#[async_trait]
pub trait SourceAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Framing for streams produced by this adapter.
    fn framing(&self) -> Framing;

    async fn open(&self, request: OpenRequest) -> Result<AdapterHandle>;
}

/// Build the adapter named by `config.adapter`.
pub fn from_config(config: &ManagerConfig) -> Arc<dyn SourceAdapter> {
    match config.adapter {
        AdapterKind::Ffmpeg => Arc::new(FfmpegAdapter::new(
            &config.ffmpeg_path,
            config.grace_period(),
        )),
        AdapterKind::Synthetic => Arc::new(SyntheticAdapter::new(
            config.synthetic_warmup(),
            config.grace_period(),
        )),
    }
}

/// Sending half given to an adapter task.
pub struct EventSink {
    tx: mpsc::Sender<AdapterEvent>,
}

impl EventSink {
    /// Each method returns `false` once the handle is gone; the adapter
    /// task should stop producing.
    pub async fn connected(&self) -> bool {
        self.send(AdapterEvent::Connected).await
    }

    pub async fn data(&self, chunk: Bytes) -> bool {
        self.send(AdapterEvent::Data(chunk)).await
    }

    pub async fn error(&self, message: impl Into<String>) -> bool {
        self.send(AdapterEvent::Error(message.into())).await
    }

    async fn send(&self, event: AdapterEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Exclusive ownership of one running adapter instance.
///
/// Dropping the handle cancels and aborts the adapter task.
pub struct AdapterHandle {
    events: mpsc::Receiver<AdapterEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    grace: Duration,
    connected: bool,
    pending: Option<Bytes>,
}

impl AdapterHandle {
    /// Run `adapter` as a task feeding this handle.
    ///
    /// The task should return promptly after `cancel` fires, finishing any
    /// graceful shutdown of its own resources within `grace`.
    pub fn spawn<F, Fut>(grace: Duration, adapter: F) -> Self
    where
        F: FnOnce(EventSink, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, events) = mpsc::channel(ADAPTER_EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(adapter(EventSink { tx }, cancel.clone()));
        Self {
            events,
            cancel,
            task: Some(task),
            grace,
            connected: false,
            pending: None,
        }
    }

    /// Next adapter event, `None` once the adapter has exited.
    ///
    /// `Connected` is delivered at most once, and always before the first
    /// data chunk even if the adapter never sent it explicitly.
    pub async fn next_event(&mut self) -> Option<AdapterEvent> {
        if let Some(chunk) = self.pending.take() {
            return Some(AdapterEvent::Data(chunk));
        }
        loop {
            match self.events.recv().await? {
                AdapterEvent::Connected if self.connected => continue,
                AdapterEvent::Connected => {
                    self.connected = true;
                    return Some(AdapterEvent::Connected);
                }
                AdapterEvent::Data(chunk) if !self.connected => {
                    self.connected = true;
                    self.pending = Some(chunk);
                    return Some(AdapterEvent::Connected);
                }
                other => return Some(other),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop the adapter and wait for it, aborting after the grace period.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(self.grace + CLOSE_MARGIN, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(
                grace_ms = self.grace.as_millis() as u64,
                "adapter ignored shutdown, aborting"
            );
            task.abort();
        }
    }
}

impl Drop for AdapterHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
