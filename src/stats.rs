//! Process-wide allocation counters, logged but never consulted for any
//! correctness decision. Mirrors the teacher's `StatCount`/`_stat_update`
//! pattern in its own `stats.rs`: a handful of atomics updated with
//! `Relaxed` ordering, since nothing downstream synchronizes on these
//! values — they only ever feed a `log::trace!` line or a diagnostic
//! snapshot. `fetch_max` is used directly here instead of the
//! load-compare-compare_and_swap dance the teacher's version falls back to,
//! since that stabilized after the teacher's pinned dependency era.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

struct Counter {
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl Counter {
    const fn new() -> Self {
        Counter {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    fn increase(&self, amount: usize) {
        let current = self.current.fetch_add(amount as i64, Ordering::Relaxed) + amount as i64;
        self.peak.fetch_max(current, Ordering::Relaxed);
        self.allocated.fetch_add(amount, Ordering::Relaxed);
    }

    fn decrease(&self, amount: usize) {
        self.current.fetch_sub(amount as i64, Ordering::Relaxed);
        self.freed.fetch_add(amount, Ordering::Relaxed);
    }
}

static BYTES: Counter = Counter::new();

/// `size` must be the number of bytes actually committed for the
/// allocation (a size class's `slot_size`, or a huge block's page-rounded
/// byte count) — the same unit [`record_free`] is given on release — so
/// `current` returns to its pre-call value after a matching free instead of
/// drifting by whatever rounding slop the caller's raw request carried.
pub fn record_alloc(size: usize) {
    BYTES.increase(size);
    log::trace!(
        "hoard: +{} bytes (current {})",
        size,
        BYTES.current.load(Ordering::Relaxed)
    );
}

pub fn record_free(size: usize) {
    BYTES.decrease(size);
    log::trace!(
        "hoard: -{} bytes (current {})",
        size,
        BYTES.current.load(Ordering::Relaxed)
    );
}

/// `(current, peak, total allocated, total freed)`, all in bytes, for
/// diagnostics only.
pub fn snapshot() -> (i64, i64, usize, usize) {
    (
        BYTES.current.load(Ordering::Relaxed),
        BYTES.peak.load(Ordering::Relaxed),
        BYTES.allocated.load(Ordering::Relaxed),
        BYTES.freed.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // `BYTES` is process-wide, and so is shared with every other test in
    // this binary; assert on deltas rather than absolute values so this
    // stays correct under `cargo test`'s default parallelism.
    #[test]
    fn tracks_current_and_peak_deltas() {
        let (before_current, _, before_allocated, before_freed) = snapshot();
        record_alloc(100);
        record_alloc(50);
        record_free(30);
        let (current, peak, allocated, freed) = snapshot();
        assert_eq!(current - before_current, 120);
        assert_eq!(allocated - before_allocated, 150);
        assert_eq!(freed - before_freed, 30);
        assert!(peak >= current);
    }
}
