use std::collections::HashMap;

use parking_lot::Mutex;

/// In-memory per-hostname byte counters for the current accounting period.
///
/// Incremented concurrently by every file follower; drained exclusively by
/// the flusher. The mutex makes `increment` and `snapshot_and_reset`
/// mutually exclusive, so no increment can fall between the read and the
/// reset.
#[derive(Debug, Default)]
pub struct HostByteAggregator {
    totals: Mutex<HashMap<String, u64>>,
}

impl HostByteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `byte_count` to the running total for `hostname`, creating the
    /// entry if absent. Saturates rather than wraps.
    pub fn increment(&self, hostname: &str, byte_count: u64) {
        let mut totals = self.totals.lock();
        match totals.get_mut(hostname) {
            Some(total) => *total = total.saturating_add(byte_count),
            None => {
                totals.insert(hostname.to_owned(), byte_count);
            }
        }
    }

    /// Atomically returns the current totals and clears all entries.
    pub fn snapshot_and_reset(&self) -> HashMap<String, u64> {
        std::mem::take(&mut *self.totals.lock())
    }

    /// Returns a copy of the current totals without resetting them.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.totals.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_increment_sums_per_host() {
        let agg = HostByteAggregator::new();
        agg.increment("a", 10);
        agg.increment("b", 5);
        agg.increment("a", 20);

        let totals = agg.snapshot_and_reset();
        assert_eq!(totals.get("a"), Some(&30));
        assert_eq!(totals.get("b"), Some(&5));
    }

    #[test]
    fn test_snapshot_and_reset_clears_state() {
        let agg = HostByteAggregator::new();
        agg.increment("a", 1);

        assert_eq!(agg.snapshot_and_reset().len(), 1);
        assert!(agg.snapshot_and_reset().is_empty());
        assert!(agg.is_empty());
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let agg = HostByteAggregator::new();
        agg.increment("a", 7);

        assert_eq!(agg.snapshot().get("a"), Some(&7));
        assert_eq!(agg.snapshot().get("a"), Some(&7));
    }

    #[test]
    fn test_increment_saturates() {
        let agg = HostByteAggregator::new();
        agg.increment("a", u64::MAX);
        agg.increment("a", 1);

        assert_eq!(agg.snapshot().get("a"), Some(&u64::MAX));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let agg = Arc::new(HostByteAggregator::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        agg.increment("shared", 1);
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().expect("incrementing thread panicked");
        }

        assert_eq!(agg.snapshot_and_reset().get("shared"), Some(&8000));
    }
}
