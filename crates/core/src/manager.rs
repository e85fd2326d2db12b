use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::adapter::{self, SourceAdapter};
use crate::audio::AudioSlot;
use crate::config::ManagerConfig;
use crate::error::{MuxError, Result};
use crate::events::{EventBus, StreamEvent};
use crate::relay::RelayClient;
use crate::source::{Quality, Source};
use crate::stream::{
    PortAllocator, StreamEntry, StreamId, StreamRecord, StreamRegistry, StreamStatus,
};
use crate::supervisor::StreamContext;

/// The stream lifecycle manager.
///
/// Cloning is cheap; every clone drives the same set of streams.
///
/// # Example
///
/// ```no_run
/// use rtspmux::{ManagerConfig, Quality, Source, StreamManager};
///
/// # async fn run() -> rtspmux::Result<()> {
/// let manager = StreamManager::new(ManagerConfig::default())?;
/// let door = Source::new("cam1", "Front door").with_low_url("rtsp://10.0.0.9/sub");
/// let id = manager.start_stream(door, Quality::Low, false).await?;
/// println!("{:?}", manager.status());
/// manager.stop_stream(&id).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StreamManager {
    ctx: StreamContext,
    ports: Arc<PortAllocator>,
}

impl StreamManager {
    /// Create a manager using the adapter named in `config`.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let adapter = adapter::from_config(&config);
        Self::with_adapter(config, adapter)
    }

    pub fn with_adapter(config: ManagerConfig, adapter: Arc<dyn SourceAdapter>) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            adapter = adapter.name(),
            max_connections = config.max_connections,
            max_retries = config.max_retries,
            retry_interval_ms = config.retry_interval_ms,
            "stream manager ready"
        );
        Ok(Self {
            ports: Arc::new(PortAllocator::new(config.base_port)),
            ctx: StreamContext {
                registry: StreamRegistry::new(),
                audio: AudioSlot::new(),
                events: EventBus::new(),
                adapter,
                config: Arc::new(config),
            },
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.ctx.events.subscribe()
    }

    /// Start streaming `source` at `quality`.
    ///
    /// A stream already registered under the same key is stopped and
    /// replaced. Fails with `CapacityExceeded` when the ceiling is reached and
    /// `InvalidSource` when the source has no locator; in both cases nothing
    /// is created. Connecting proceeds in the background.
    ///
    /// Replacing the previous record and launching the new one run on their
    /// own task, so dropping this future never strands a record in `Idle`.
    pub async fn start_stream(
        &self,
        source: Source,
        quality: Quality,
        want_audio: bool,
    ) -> Result<StreamId> {
        source.locator(quality)?;
        let id = StreamId::new(&source.id, quality);
        let max = self.ctx.config.max_connections;
        let source = Arc::new(source);
        let framing = self.ctx.adapter.framing();

        let (entry, previous) = self
            .ctx
            .registry
            .admit(&id, max, |in_use| {
                StreamRecord::new(source, quality, self.ports.allocate_free(in_use), framing)
            })
            .inspect_err(|e| tracing::warn!(stream = %id, error = %e, "stream rejected"))?;

        tracing::info!(
            stream = %id,
            port = entry.record.port,
            audio = want_audio,
            "stream started"
        );

        let ctx = self.ctx.clone();
        let launch = tokio::spawn(async move {
            if let Some(previous) = previous {
                tracing::debug!(stream = %entry.record.id, "replacing existing stream");
                previous.shutdown(&ctx).await;
            }
            entry.launch(&ctx, want_audio);
        });
        join(launch).await;
        Ok(id)
    }

    /// Stop a stream. Returns `false` if it did not exist.
    ///
    /// Teardown runs on its own task and completes even if this future is
    /// dropped.
    pub async fn stop_stream(&self, id: &StreamId) -> bool {
        let Some(entry) = self.ctx.registry.remove(id) else {
            return false;
        };
        join(self.teardown(entry)).await;
        true
    }

    /// Stop every stream concurrently and reset the port allocator.
    pub async fn stop_all_streams(&self) {
        let entries = self.ctx.registry.drain();
        let count = entries.len();
        let teardowns: Vec<_> = entries.into_iter().map(|entry| self.teardown(entry)).collect();
        let ports = self.ports.clone();
        let stopped = tokio::spawn(async move {
            futures::future::join_all(teardowns).await;
            ports.reset();
            tracing::info!(count, "all streams stopped");
        });
        join(stopped).await;
    }

    fn teardown(&self, entry: Arc<StreamEntry>) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move { entry.shutdown(&ctx).await })
    }

    /// Give the audio channel to the stream, or take it back if it holds it.
    ///
    /// Returns whether the stream holds audio afterwards.
    pub fn toggle_audio(&self, source_id: &str, quality: Quality) -> Result<bool> {
        let id = StreamId::new(source_id, quality);
        let record = self.lookup(&id)?;
        let active = self.ctx.audio.toggle(&record, &self.ctx.events);
        if active && !self.ctx.registry.is_current(&record) {
            self.ctx.audio.release(&record, &self.ctx.events);
            return Err(MuxError::StreamNotFound(id.to_string()));
        }
        Ok(active)
    }

    pub fn audio_owner(&self) -> Option<StreamId> {
        self.ctx.audio.owner()
    }

    /// Point-in-time status of every registered stream, keyed by stream id.
    pub fn status(&self) -> BTreeMap<String, StreamStatus> {
        self.ctx
            .registry
            .records()
            .into_iter()
            .map(|record| (record.id.to_string(), record.status()))
            .collect()
    }

    pub fn record(&self, id: &StreamId) -> Option<Arc<StreamRecord>> {
        self.ctx.registry.get(id)
    }

    pub fn record_by_port(&self, port: u16) -> Option<Arc<StreamRecord>> {
        self.ctx.registry.by_port(port)
    }

    /// Attach a relay client to a stream.
    pub async fn connect_client(&self, id: &StreamId) -> Result<RelayClient> {
        let record = self.lookup(id)?;
        record.connect_client(self.ctx.config.client_wait()).await
    }

    /// Attach a relay client to the stream assigned `port`.
    pub async fn connect_client_by_port(&self, port: u16) -> Result<RelayClient> {
        let record = self
            .record_by_port(port)
            .ok_or_else(|| MuxError::StreamNotFound(format!("port {port}")))?;
        record.connect_client(self.ctx.config.client_wait()).await
    }

    fn lookup(&self, id: &StreamId) -> Result<Arc<StreamRecord>> {
        self.ctx
            .registry
            .get(id)
            .ok_or_else(|| MuxError::StreamNotFound(id.to_string()))
    }
}

async fn join(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        tracing::error!(error = %e, "stream lifecycle task failed");
    }
}
