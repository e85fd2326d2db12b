//! Shared fixtures: a scripted adapter and polling helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rtspmux::{
    AdapterHandle, Framing, ManagerConfig, MuxError, OpenRequest, Quality, Result, Source,
    SourceAdapter, StreamEvent, StreamId, StreamManager, StreamState,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Connects at once and sends a chunk every 100 ms until closed.
    Healthy,
    /// Every open fails with a connect error.
    FailConnect,
    /// The first `n` opens fail, later ones are healthy.
    FailTimes(u32),
    /// Opens but never produces anything.
    Hang,
    /// Connects, sends `n` chunks, then reports an error.
    DieAfter(usize),
}

pub struct ScriptedAdapter {
    script: Script,
    opens: AtomicU32,
    requests: Mutex<Vec<OpenRequest>>,
}

impl ScriptedAdapter {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            opens: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OpenRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn framing(&self) -> Framing {
        Framing::raw("application/octet-stream")
    }

    async fn open(&self, request: OpenRequest) -> Result<AdapterHandle> {
        let opened = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request);

        let script = self.script;
        match script {
            Script::FailConnect => return Err(MuxError::Connect("connection refused".into())),
            Script::FailTimes(n) if opened <= n => {
                return Err(MuxError::Connect("connection refused".into()));
            }
            _ => {}
        }

        Ok(AdapterHandle::spawn(Duration::from_secs(1), move |sink, cancel| async move {
            match script {
                Script::Hang => cancel.cancelled().await,
                Script::DieAfter(chunks) => {
                    sink.connected().await;
                    for _ in 0..chunks {
                        sink.data(Bytes::from_static(b"chunk")).await;
                    }
                    sink.error("decoder crashed").await;
                }
                _ => {
                    sink.connected().await;
                    let mut ticker = tokio::time::interval(Duration::from_millis(100));
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = ticker.tick() => {
                                if !sink.data(Bytes::from_static(b"chunk")).await {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }))
    }
}

pub fn manager(script: Script, max_connections: usize) -> (StreamManager, Arc<ScriptedAdapter>) {
    let adapter = ScriptedAdapter::new(script);
    let config = ManagerConfig {
        max_connections,
        ..Default::default()
    };
    let manager = StreamManager::with_adapter(config, adapter.clone()).unwrap();
    (manager, adapter)
}

pub fn camera(id: &str) -> Source {
    Source::new(id, &format!("Camera {id}"))
        .with_low_url(&format!("rtsp://{id}.local/sub"))
        .with_high_url(&format!("rtsp://{id}.local/main"))
}

pub fn low(id: &str) -> StreamId {
    StreamId::new(id, Quality::Low)
}

/// Poll until the stream reaches `state`, panicking after ten virtual seconds.
pub async fn wait_for_state(manager: &StreamManager, id: &StreamId, state: StreamState) {
    for _ in 0..1000 {
        if manager.record(id).map(|r| r.state()) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} never reached {state}");
}

pub fn drain(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// States entered by `id`, in order, from `StateChanged` events.
pub fn states(events: &[StreamEvent], id: &StreamId) -> Vec<StreamState> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::StateChanged { id: changed, to, .. } if changed == id => Some(*to),
            _ => None,
        })
        .collect()
}
