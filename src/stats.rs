//! Allocator event counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide allocator event counters.
///
/// All counters are relaxed: they feed diagnostics and tests, never
/// control flow.
#[derive(Debug, Default)]
pub struct Stats {
    arenas_registered: AtomicU64,
    blocks_claimed: AtomicU64,
    blocks_freed: AtomicU64,
    os_allocs: AtomicU64,
    os_commits: AtomicU64,
    os_decommits: AtomicU64,
    os_resets: AtomicU64,
    purges_scheduled: AtomicU64,
    invalid_frees: AtomicU64,
    double_frees: AtomicU64,
}

impl Stats {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_arena_registered(&self) {
        self.arenas_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocks_claimed(&self, count: usize) {
        self.blocks_claimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_blocks_freed(&self, count: usize) {
        self.blocks_freed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_os_alloc(&self) {
        self.os_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_os_commit(&self) {
        self.os_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_os_decommit(&self) {
        self.os_decommits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_os_reset(&self) {
        self.os_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_purge_scheduled(&self) {
        self.purges_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_free(&self) {
        self.invalid_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_double_free(&self) {
        self.double_frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            arenas_registered: self.arenas_registered.load(Ordering::Relaxed),
            blocks_claimed: self.blocks_claimed.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            os_allocs: self.os_allocs.load(Ordering::Relaxed),
            os_commits: self.os_commits.load(Ordering::Relaxed),
            os_decommits: self.os_decommits.load(Ordering::Relaxed),
            os_resets: self.os_resets.load(Ordering::Relaxed),
            purges_scheduled: self.purges_scheduled.load(Ordering::Relaxed),
            invalid_frees: self.invalid_frees.load(Ordering::Relaxed),
            double_frees: self.double_frees.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Arenas added to the registry.
    pub arenas_registered: u64,
    /// Blocks claimed from arenas.
    pub blocks_claimed: u64,
    /// Blocks released back to arenas.
    pub blocks_freed: u64,
    /// Direct OS allocations (fallbacks and arena reservations).
    pub os_allocs: u64,
    /// OS commit calls issued.
    pub os_commits: u64,
    /// OS decommit calls issued.
    pub os_decommits: u64,
    /// OS reset calls issued.
    pub os_resets: u64,
    /// Purge scheduling events.
    pub purges_scheduled: u64,
    /// Frees rejected because the memid was malformed.
    pub invalid_frees: u64,
    /// Frees that found some blocks already free.
    pub double_frees: u64,
}

impl StatsSnapshot {
    /// Blocks currently claimed across all arenas.
    pub fn blocks_live(&self) -> u64 {
        self.blocks_claimed.saturating_sub(self.blocks_freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();

        stats.record_blocks_claimed(3);
        stats.record_blocks_claimed(2);
        stats.record_blocks_freed(2);
        stats.record_double_free();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.blocks_claimed, 5);
        assert_eq!(snapshot.blocks_freed, 2);
        assert_eq!(snapshot.blocks_live(), 3);
        assert_eq!(snapshot.double_frees, 1);
        assert_eq!(snapshot.os_decommits, 0);
    }
}
