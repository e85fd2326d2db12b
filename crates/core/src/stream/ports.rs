use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

const PORT_MAX: u64 = u16::MAX as u64;

/// Process-wide proxy port allocator.
///
/// Ports are handed out from a monotonic counter starting at `base`, one per
/// created stream record. Past `u16::MAX` it wraps back to `base`, and
/// [`allocate_free`](Self::allocate_free) skips ports a live record still
/// holds. Only [`reset`](Self::reset) (full shutdown) rewinds it.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: AtomicU64,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            next: AtomicU64::new(u64::from(base)),
        }
    }

    pub fn allocate(&self) -> u16 {
        let port = self.next.fetch_add(1, Ordering::SeqCst);

        if port > PORT_MAX {
            tracing::warn!(port, base = self.base, "port range exhausted, wrapping");
            self.next.store(u64::from(self.base), Ordering::SeqCst);
            let port = self.next.fetch_add(1, Ordering::SeqCst);
            return port as u16;
        }

        tracing::trace!(port, "allocated proxy port");
        port as u16
    }

    /// Next port not in `in_use`.
    ///
    /// Gives up after one full pass over the range and returns the next port
    /// regardless.
    pub fn allocate_free(&self, in_use: &HashSet<u16>) -> u16 {
        let span = PORT_MAX - u64::from(self.base) + 1;
        for _ in 0..span {
            let port = self.allocate();
            if !in_use.contains(&port) {
                return port;
            }
            tracing::debug!(port, "proxy port still held, skipping");
        }
        tracing::warn!(base = self.base, "every proxy port is held");
        self.allocate()
    }

    /// Rewind to `base`.
    pub fn reset(&self) {
        self.next.store(u64::from(self.base), Ordering::SeqCst);
        tracing::debug!(base = self.base, "port allocator reset");
    }

    /// The port the next [`allocate`](Self::allocate) would return.
    pub fn peek(&self) -> u16 {
        let next = self.next.load(Ordering::SeqCst);
        if next > PORT_MAX { self.base } else { next as u16 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_monotonically() {
        let ports = PortAllocator::new(9000);
        assert_eq!(ports.allocate(), 9000);
        assert_eq!(ports.allocate(), 9001);
        assert_eq!(ports.peek(), 9002);
    }

    #[test]
    fn reset_rewinds_to_base() {
        let ports = PortAllocator::new(9000);
        ports.allocate();
        ports.allocate();
        ports.reset();
        assert_eq!(ports.allocate(), 9000);
    }

    #[test]
    fn wraps_past_u16_max() {
        let ports = PortAllocator::new(65534);
        assert_eq!(ports.allocate(), 65534);
        assert_eq!(ports.allocate(), 65535);
        assert_eq!(ports.allocate(), 65534);
    }

    #[test]
    fn wrapped_allocation_skips_held_ports() {
        let ports = PortAllocator::new(65533);
        assert_eq!(ports.allocate(), 65533);
        assert_eq!(ports.allocate(), 65534);
        assert_eq!(ports.allocate(), 65535);

        let held = HashSet::from([65533, 65534]);
        assert_eq!(ports.allocate_free(&held), 65535);
        assert_eq!(ports.allocate_free(&held), 65535);
    }

    #[test]
    fn allocate_free_without_conflicts_is_monotonic() {
        let ports = PortAllocator::new(9000);
        assert_eq!(ports.allocate_free(&HashSet::new()), 9000);
        assert_eq!(ports.allocate_free(&HashSet::from([9000])), 9001);
    }
}
