//! Message deduplication for at-least-once delivery.
//!
//! A bounded set of envelope ids with FIFO eviction. Consumers behind an
//! at-least-once channel call [`Deduplicator::is_duplicate`] before acting;
//! the first sighting of an id returns `false` and records it, every later
//! sighting returns `true` until the id ages out of the window.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

/// Default number of remembered ids.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

struct DedupInner {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

/// Bounded FIFO-evicted set of envelope ids.
pub struct Deduplicator {
    capacity: usize,
    inner: Mutex<DedupInner>,
}

impl Deduplicator {
    /// Create a deduplicator remembering [`DEFAULT_DEDUP_CAPACITY`] ids.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    /// Create a deduplicator remembering at most `capacity` ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(DedupInner {
                seen: HashSet::with_capacity(capacity.min(1024)),
                order: VecDeque::with_capacity(capacity.min(1024)),
            }),
        }
    }

    /// Returns true if `id` was already seen; otherwise records it and
    /// returns false. Check-and-insert is atomic.
    pub fn is_duplicate(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.seen.contains(&id) {
            return true;
        }
        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        inner.seen.insert(id);
        inner.order.push_back(id);
        false
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).order.len()
    }

    /// True when nothing has been seen.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_is_not_duplicate() {
        let dedup = Deduplicator::new();
        let id = Uuid::new_v4();
        assert!(!dedup.is_duplicate(id));
        assert!(dedup.is_duplicate(id));
        assert!(dedup.is_duplicate(id));
    }

    #[test]
    fn test_at_most_one_false_per_id() {
        let dedup = Deduplicator::new();
        let ids: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();

        let mut falses = 0;
        for _ in 0..3 {
            for id in &ids {
                if !dedup.is_duplicate(*id) {
                    falses += 1;
                }
            }
        }
        assert_eq!(falses, ids.len());
    }

    #[test]
    fn test_fifo_eviction_on_overflow() {
        let dedup = Deduplicator::with_capacity(3);
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            assert!(!dedup.is_duplicate(*id));
        }
        assert_eq!(dedup.len(), 3);

        // The oldest id was evicted and reads as fresh again.
        assert!(!dedup.is_duplicate(ids[0]));
        // The newest three at that point: ids[2], ids[3], ids[0]; ids[1] is out.
        assert!(dedup.is_duplicate(ids[2]));
        assert!(dedup.is_duplicate(ids[3]));
        assert!(!dedup.is_duplicate(ids[1]));
    }

    #[test]
    fn test_len_tracks_inserts() {
        let dedup = Deduplicator::with_capacity(10);
        assert!(dedup.is_empty());
        for _ in 0..5 {
            dedup.is_duplicate(Uuid::new_v4());
        }
        assert_eq!(dedup.len(), 5);
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;

        let dedup = Arc::new(Deduplicator::new());
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || !dedup.is_duplicate(id) as usize)
            })
            .collect();

        let fresh: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fresh, 1);
    }
}
