//! Aggregate usage counters.
//!
//! Every counter is its own atomic on its own cache line. Individual values
//! are always exact, but a [`Stats::snapshot`] taken while other threads are
//! allocating may mix values from before and after a given call.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct Counter(CachePadded<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self(CachePadded::new(AtomicUsize::new(0)))
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the new value
    #[inline]
    pub fn add(&self, val: usize) -> usize {
        self.0.fetch_add(val, Ordering::AcqRel).wrapping_add(val)
    }

    /// Subtract, stopping at zero. A counter can legitimately be asked to go
    /// below zero after [`Stats::reset`], when blocks from before the reset
    /// are freed.
    #[inline]
    pub fn sub_saturating(&self, val: usize) {
        // the closure always returns `Some`, so this can't fail
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(val))
            });
    }

    #[inline]
    pub fn raise_to(&self, val: usize) {
        self.0.fetch_max(val, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// A plain copy of the allocator counters at some point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Sum of the requested sizes of every block that is still allocated
    pub bytes_live: usize,
    /// The most `bytes_live` has ever been (since the last reset)
    pub high_water_mark: usize,
    /// Every successful allocation, ever
    pub allocations_total: usize,
    /// Blocks currently allocated
    pub allocations_live: usize,
    /// Every successful reallocation, ever
    pub reallocations_total: usize,
}

impl StatsSnapshot {
    pub const fn has_leaks(&self) -> bool {
        self.bytes_live != 0 || self.allocations_live != 0
    }
}

#[derive(Default)]
pub struct Stats {
    bytes_live: Counter,
    high_water_mark: Counter,
    allocations_total: Counter,
    allocations_live: Counter,
    reallocations_total: Counter,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn grow_live_bytes(&self, size: usize) {
        let now = self.bytes_live.add(size);
        self.high_water_mark.raise_to(now);
    }

    pub fn record_alloc(&self, size: usize) {
        self.allocations_total.add(1);
        self.allocations_live.add(1);
        self.grow_live_bytes(size);
    }

    pub fn record_realloc(&self, old_size: usize, new_size: usize) {
        self.reallocations_total.add(1);
        if new_size >= old_size {
            self.grow_live_bytes(new_size - old_size);
        } else {
            self.bytes_live.sub_saturating(old_size - new_size);
        }
    }

    pub fn record_free(&self, size: usize) {
        self.bytes_live.sub_saturating(size);
        self.allocations_live.sub_saturating(1);
    }

    /// Start a new measurement window. Outstanding blocks are not touched, so
    /// this doesn't free anything, it just forgets about it.
    pub fn reset(&self) {
        self.bytes_live.clear();
        self.high_water_mark.clear();
        self.allocations_live.clear();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_live: self.bytes_live.get(),
            high_water_mark: self.high_water_mark.get(),
            allocations_total: self.allocations_total.get(),
            allocations_live: self.allocations_live.get(),
            reallocations_total: self.reallocations_total.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_follows_the_peak() {
        let stats = Stats::new();
        stats.record_alloc(100);
        stats.record_alloc(50);
        stats.record_free(100);
        stats.record_alloc(20);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_live, 70);
        assert_eq!(snap.high_water_mark, 150);
        assert_eq!(snap.allocations_total, 3);
        assert_eq!(snap.allocations_live, 2);
    }

    #[test]
    fn realloc_moves_bytes_both_ways() {
        let stats = Stats::new();
        stats.record_alloc(10);
        stats.record_realloc(10, 40);
        assert_eq!(stats.snapshot().bytes_live, 40);
        assert_eq!(stats.snapshot().high_water_mark, 40);
        stats.record_realloc(40, 5);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_live, 5);
        assert_eq!(snap.high_water_mark, 40);
        assert_eq!(snap.reallocations_total, 2);
        assert_eq!(snap.allocations_total, 1);
    }

    #[test]
    fn reset_keeps_totals_and_never_underflows() {
        let stats = Stats::new();
        stats.record_alloc(64);
        stats.reset();
        let snap = stats.snapshot();
        assert!(!snap.has_leaks());
        assert_eq!(snap.high_water_mark, 0);
        assert_eq!(snap.allocations_total, 1);

        stats.record_free(64);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_live, 0);
        assert_eq!(snap.allocations_live, 0);
    }
}
