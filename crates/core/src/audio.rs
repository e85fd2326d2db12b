use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::{EventBus, StreamEvent};
use crate::stream::{StreamId, StreamRecord};

/// The single exclusive audio channel.
///
/// Every hand-off happens under one lock: the previous owner's flag is
/// cleared and `AudioReleased` emitted before the new owner's flag is set
/// and `AudioAcquired` emitted. No two records ever report audio at once.
#[derive(Clone, Default)]
pub struct AudioSlot {
    owner: Arc<Mutex<Option<Arc<StreamRecord>>>>,
}

impl AudioSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<StreamId> {
        self.owner.lock().as_ref().map(|record| record.id.clone())
    }

    /// Give the channel to `record`, evicting the current holder first.
    pub fn acquire(&self, record: &Arc<StreamRecord>, events: &EventBus) {
        let mut owner = self.owner.lock();
        if owner.as_ref().is_some_and(|held| Arc::ptr_eq(held, record)) {
            return;
        }
        Self::release_locked(&mut owner, events);
        record.set_audio(true);
        *owner = Some(record.clone());
        events.emit(StreamEvent::AudioAcquired {
            id: record.id.clone(),
        });
    }

    /// Release the channel if `record` holds it. Returns whether it did.
    pub fn release(&self, record: &Arc<StreamRecord>, events: &EventBus) -> bool {
        let mut owner = self.owner.lock();
        if !owner.as_ref().is_some_and(|held| Arc::ptr_eq(held, record)) {
            return false;
        }
        Self::release_locked(&mut owner, events);
        true
    }

    /// Flip ownership for `record`. Returns whether it now holds audio.
    pub fn toggle(&self, record: &Arc<StreamRecord>, events: &EventBus) -> bool {
        let mut owner = self.owner.lock();
        let holds = owner.as_ref().is_some_and(|held| Arc::ptr_eq(held, record));
        Self::release_locked(&mut owner, events);
        if holds {
            return false;
        }
        record.set_audio(true);
        *owner = Some(record.clone());
        events.emit(StreamEvent::AudioAcquired {
            id: record.id.clone(),
        });
        true
    }

    fn release_locked(owner: &mut Option<Arc<StreamRecord>>, events: &EventBus) {
        if let Some(previous) = owner.take() {
            previous.set_audio(false);
            events.emit(StreamEvent::AudioReleased {
                id: previous.id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Framing;
    use crate::source::{Quality, Source};

    fn record(id: &str) -> Arc<StreamRecord> {
        let source = Arc::new(Source::new(id, id).with_low_url("rtsp://cam/sub"));
        Arc::new(StreamRecord::new(
            source,
            Quality::Low,
            9000,
            Framing::raw("video/mp2t"),
        ))
    }

    #[test]
    fn hand_off_releases_before_acquiring() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let slot = AudioSlot::new();
        let a = record("a");
        let b = record("b");

        assert!(slot.toggle(&a, &events));
        assert!(slot.toggle(&b, &events));

        assert!(!a.has_audio());
        assert!(b.has_audio());
        assert_eq!(slot.owner(), Some(b.id.clone()));

        let order: Vec<StreamEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            order,
            vec![
                StreamEvent::AudioAcquired { id: a.id.clone() },
                StreamEvent::AudioReleased { id: a.id.clone() },
                StreamEvent::AudioAcquired { id: b.id.clone() },
            ]
        );
    }

    #[test]
    fn toggle_owner_releases() {
        let events = EventBus::new();
        let slot = AudioSlot::new();
        let a = record("a");

        assert!(slot.toggle(&a, &events));
        assert!(!slot.toggle(&a, &events));
        assert!(!a.has_audio());
        assert!(slot.owner().is_none());
    }

    #[test]
    fn release_by_non_owner_is_noop() {
        let events = EventBus::new();
        let slot = AudioSlot::new();
        let a = record("a");
        let b = record("b");

        slot.acquire(&a, &events);
        assert!(!slot.release(&b, &events));
        assert!(a.has_audio());
        assert!(slot.release(&a, &events));
        assert!(!slot.release(&a, &events));
    }

    #[test]
    fn acquire_by_owner_is_idempotent() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let slot = AudioSlot::new();
        let a = record("a");

        slot.acquire(&a, &events);
        slot.acquire(&a, &events);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
