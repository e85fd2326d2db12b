use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MuxError, Result};
use crate::supervisor::{StreamContext, Supervisor};

use super::{StreamId, StreamRecord, StreamState};

/// Extra time past the adapter grace period before a supervisor is aborted.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(1);

/// A registered record together with the task that drives it.
pub struct StreamEntry {
    pub record: Arc<StreamRecord>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamEntry {
    fn new(record: Arc<StreamRecord>) -> Self {
        Self {
            record,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the supervisor. No-op once shutdown has begun.
    pub(crate) fn launch(&self, ctx: &StreamContext, want_audio: bool) {
        let mut task = self.task.lock();
        if self.cancel.is_cancelled() || task.is_some() {
            return;
        }
        if want_audio {
            ctx.audio.acquire(&self.record, &ctx.events);
        }
        *task = Some(Supervisor::spawn(
            self.record.clone(),
            ctx.clone(),
            self.cancel.clone(),
        ));
    }

    /// Stop the supervisor and release everything the record holds.
    ///
    /// Cancellation comes first so no pending retry can reopen the adapter.
    pub(crate) async fn shutdown(&self, ctx: &StreamContext) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            let bound = ctx.config.grace_period() + SHUTDOWN_MARGIN;
            if tokio::time::timeout(bound, &mut task).await.is_err() {
                tracing::warn!(stream = %self.record.id, "supervisor did not exit, aborting");
                task.abort();
            }
        }

        self.record.relay().close();
        ctx.audio.release(&self.record, &ctx.events);
        if !self.record.state().is_terminal() {
            self.record.transition(StreamState::Stopped, &ctx.events);
        }
        tracing::info!(stream = %self.record.id, port = self.record.port, "stream stopped");
    }
}

/// Thread-safe collection of stream entries, keyed by [`StreamId`].
///
/// Every method holds the lock only for map access; adapter I/O and
/// teardown happen on the returned entries after the lock is released.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    entries: Arc<Mutex<HashMap<StreamId, Arc<StreamEntry>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record for `id` if the ceiling allows it.
    ///
    /// Any previous entry under the same key is taken out of the map and
    /// returned for the caller to shut down. Records that are not terminal
    /// count against `max`, including ones whose supervisor has not started.
    /// `build` runs only on success, inside the critical section, and is
    /// given the ports still held by registered records.
    pub(crate) fn admit<F>(
        &self,
        id: &StreamId,
        max: usize,
        build: F,
    ) -> Result<(Arc<StreamEntry>, Option<Arc<StreamEntry>>)>
    where
        F: FnOnce(&HashSet<u16>) -> StreamRecord,
    {
        let mut entries = self.entries.lock();
        let previous = entries.remove(id);
        let active = entries
            .values()
            .filter(|entry| !entry.record.state().is_terminal())
            .count();
        if active >= max {
            if let Some(previous) = previous {
                entries.insert(id.clone(), previous);
            }
            return Err(MuxError::CapacityExceeded { max });
        }

        let in_use: HashSet<u16> = entries.values().map(|entry| entry.record.port).collect();
        let entry = Arc::new(StreamEntry::new(Arc::new(build(&in_use))));
        entries.insert(id.clone(), entry.clone());
        Ok((entry, previous))
    }

    pub fn get(&self, id: &StreamId) -> Option<Arc<StreamRecord>> {
        self.entries.lock().get(id).map(|entry| entry.record.clone())
    }

    pub fn by_port(&self, port: u16) -> Option<Arc<StreamRecord>> {
        self.entries
            .lock()
            .values()
            .find(|entry| entry.record.port == port)
            .map(|entry| entry.record.clone())
    }

    pub(crate) fn remove(&self, id: &StreamId) -> Option<Arc<StreamEntry>> {
        self.entries.lock().remove(id)
    }

    /// Whether `record` is still the instance registered under its key.
    pub fn is_current(&self, record: &StreamRecord) -> bool {
        self.entries
            .lock()
            .get(&record.id)
            .is_some_and(|entry| entry.record.instance() == record.instance())
    }

    /// Remove `record` only if it was not already replaced.
    pub(crate) fn remove_if_current(&self, record: &StreamRecord) -> bool {
        let mut entries = self.entries.lock();
        let current = entries
            .get(&record.id)
            .is_some_and(|entry| entry.record.instance() == record.instance());
        if current {
            entries.remove(&record.id);
        }
        current
    }

    pub(crate) fn drain(&self) -> Vec<Arc<StreamEntry>> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }

    pub fn records(&self) -> Vec<Arc<StreamRecord>> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::relay::Framing;
    use crate::source::{Quality, Source};

    fn build(id: &str, port: u16) -> impl FnOnce(&HashSet<u16>) -> StreamRecord {
        let source = Arc::new(Source::new(id, id).with_low_url("rtsp://cam/sub"));
        move |_| StreamRecord::new(source, Quality::Low, port, Framing::raw("video/mp2t"))
    }

    #[test]
    fn admit_enforces_ceiling() {
        let registry = StreamRegistry::new();
        let a = StreamId::new("a", Quality::Low);
        let b = StreamId::new("b", Quality::Low);
        let c = StreamId::new("c", Quality::Low);

        registry.admit(&a, 2, build("a", 9000)).unwrap();
        registry.admit(&b, 2, build("b", 9001)).unwrap();
        let err = registry.admit(&c, 2, build("c", 9002)).err().unwrap();
        assert!(matches!(err, MuxError::CapacityExceeded { max: 2 }));
        assert!(registry.get(&c).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn admit_same_key_returns_previous() {
        let registry = StreamRegistry::new();
        let a = StreamId::new("a", Quality::Low);

        let (first, _) = registry.admit(&a, 1, build("a", 9000)).unwrap();
        let (second, previous) = registry.admit(&a, 1, build("a", 9001)).unwrap();
        let previous = previous.unwrap();

        assert_eq!(previous.record.instance(), first.record.instance());
        assert!(registry.is_current(&second.record));
        assert!(!registry.is_current(&first.record));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn admit_reports_ports_in_use() {
        let registry = StreamRegistry::new();
        let a = StreamId::new("a", Quality::Low);
        let b = StreamId::new("b", Quality::Low);
        let source = Arc::new(Source::new("b", "b").with_low_url("rtsp://cam/sub"));

        registry.admit(&a, 4, build("a", 9000)).unwrap();
        let (entry, _) = registry
            .admit(&b, 4, |in_use| {
                assert!(in_use.contains(&9000));
                StreamRecord::new(source, Quality::Low, 9001, Framing::raw("video/mp2t"))
            })
            .unwrap();
        assert_eq!(entry.record.port, 9001);
    }

    #[test]
    fn terminal_records_do_not_count() {
        let registry = StreamRegistry::new();
        let events = EventBus::new();
        let a = StreamId::new("a", Quality::Low);
        let b = StreamId::new("b", Quality::Low);

        let (entry, _) = registry.admit(&a, 1, build("a", 9000)).unwrap();
        entry.record.transition(StreamState::Failed, &events);
        assert!(registry.admit(&b, 1, build("b", 9001)).is_ok());
    }

    #[test]
    fn remove_if_current_ignores_replaced() {
        let registry = StreamRegistry::new();
        let a = StreamId::new("a", Quality::Low);

        let (old, _) = registry.admit(&a, 4, build("a", 9000)).unwrap();
        registry.admit(&a, 4, build("a", 9001)).unwrap();

        assert!(!registry.remove_if_current(&old.record));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_port(9001).map(|r| r.port), Some(9001));
        assert!(registry.by_port(9000).is_none());
    }
}
