//! Per-stream supervisor task.
//!
//! Each stream record is driven by exactly one supervisor. The supervisor
//! owns the adapter handle, the connection watchdog and the retry timer,
//! all inside one `select!` loop, so only one of them is ever pending and
//! cancelling the stream's token stops every one of them at once.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterEvent, AdapterHandle, OpenRequest, SourceAdapter};
use crate::audio::AudioSlot;
use crate::config::ManagerConfig;
use crate::error::{MuxError, Result};
use crate::events::{EventBus, StreamEvent};
use crate::stream::{StreamRecord, StreamRegistry, StreamState};

/// Shared handles every supervisor needs.
#[derive(Clone)]
pub struct StreamContext {
    pub registry: StreamRegistry,
    pub audio: AudioSlot,
    pub events: EventBus,
    pub adapter: Arc<dyn SourceAdapter>,
    pub config: Arc<ManagerConfig>,
}

enum Outcome {
    Cancelled,
    Failed(MuxError),
}

pub(crate) struct Supervisor {
    record: Arc<StreamRecord>,
    ctx: StreamContext,
    cancel: CancellationToken,
}

impl Supervisor {
    pub(crate) fn spawn(
        record: Arc<StreamRecord>,
        ctx: StreamContext,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = Self {
            record,
            ctx,
            cancel,
        };
        tokio::spawn(supervisor.run())
    }

    async fn run(self) {
        let max_retries = self.ctx.config.max_retries;
        loop {
            let error = match self.attempt().await {
                Outcome::Cancelled => return,
                Outcome::Failed(error) => error,
            };

            let attempt = self.record.record_failure();
            self.record.transition(StreamState::Retrying, &self.ctx.events);
            self.ctx.events.emit(StreamEvent::Error {
                id: self.record.id.clone(),
                source: self.record.source.name.clone(),
                error: error.to_string(),
                attempt,
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.ctx.config.retry_interval()) => {}
            }

            if !self.ctx.registry.is_current(&self.record) {
                tracing::debug!(stream = %self.record.id, "record replaced, dropping retry");
                return;
            }
            if attempt >= max_retries {
                self.fail(attempt);
                return;
            }
            tracing::debug!(stream = %self.record.id, attempt, max_retries, "retrying");
        }
    }

    /// One connection attempt, from `Connecting` until cancellation or failure.
    ///
    /// The adapter is closed before this returns, so the record never holds
    /// an adapter outside `Connecting` and `Streaming`.
    async fn attempt(&self) -> Outcome {
        self.record.transition(StreamState::Connecting, &self.ctx.events);
        self.record.mark_started();
        let deadline = Instant::now() + self.ctx.config.connection_timeout();

        let request = match self.request() {
            Ok(request) => request,
            Err(e) => return Outcome::Failed(e),
        };

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Err(self.watchdog_error()),
            opened = self.ctx.adapter.open(request) => opened,
        };
        let mut handle = match opened {
            Ok(handle) => handle,
            Err(e) => return Outcome::Failed(e),
        };

        let outcome = self.pump(&mut handle, deadline).await;
        self.record.relay().close();
        handle.close().await;
        outcome
    }

    async fn pump(&self, handle: &mut AdapterHandle, deadline: Instant) -> Outcome {
        let watchdog = tokio::time::sleep_until(deadline);
        tokio::pin!(watchdog);
        let mut streaming = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = &mut watchdog, if !streaming => {
                    return Outcome::Failed(self.watchdog_error());
                }
                event = handle.next_event() => match event {
                    Some(AdapterEvent::Connected) => {
                        streaming = true;
                        self.on_connected();
                    }
                    Some(AdapterEvent::Data(chunk)) => {
                        self.record.relay().publish(chunk);
                    }
                    Some(AdapterEvent::Error(message)) if streaming => {
                        return Outcome::Failed(MuxError::Runtime(message));
                    }
                    Some(AdapterEvent::Error(message)) => {
                        return Outcome::Failed(MuxError::Connect(message));
                    }
                    None if streaming => {
                        return Outcome::Failed(MuxError::Runtime("adapter exited".to_string()));
                    }
                    None => {
                        return Outcome::Failed(MuxError::Connect(
                            "adapter exited before producing output".to_string(),
                        ));
                    }
                },
            }
        }
    }

    fn on_connected(&self) {
        let record = &self.record;
        record.reset_attempt();
        record.mark_started();
        record.relay().open();
        record.transition(StreamState::Streaming, &self.ctx.events);
        self.ctx.events.emit(StreamEvent::Connected {
            id: record.id.clone(),
            source: record.source.name.clone(),
        });
    }

    /// Retries exhausted: tear the record down for good.
    fn fail(&self, attempts: u32) {
        let record = &self.record;
        let events = &self.ctx.events;
        let error = MuxError::TerminalFailure {
            id: record.id.to_string(),
            attempts,
        };

        record.transition(StreamState::Failed, events);
        self.ctx.audio.release(record, events);
        record.relay().close();
        self.ctx.registry.remove_if_current(record);
        events.emit(StreamEvent::Failed {
            id: record.id.clone(),
            source: record.source.name.clone(),
            reason: error.to_string(),
        });
    }

    fn request(&self) -> Result<OpenRequest> {
        let record = &self.record;
        let quality = record.id.quality;
        Ok(OpenRequest {
            id: record.id.clone(),
            source_name: record.source.name.clone(),
            locator: record.source.locator(quality)?.to_string(),
            quality,
            profile: self.ctx.config.profiles.get(quality),
            audio: record.has_audio(),
        })
    }

    fn watchdog_error(&self) -> MuxError {
        MuxError::Connect(format!(
            "no output within {} ms",
            self.ctx.config.connection_timeout_ms
        ))
    }
}
