//! Deferred purging of freed blocks.
//!
//! Freeing a run parks its bits in `blocks_purge` with an expiry instead
//! of decommitting right away, so short-lived frees can be recycled
//! without syscalls. The purge engine later walks the parked bits,
//! shields each run from allocators by re-claiming its inuse bits,
//! re-reads the purge set under that shield, and only then talks to the
//! OS. A process-wide guard admits one purging thread at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::bitmap::{BitIndex, FIELD_BITS};

use super::{Arena, Manager, BLOCK_SIZE};

/// RAII try-lock for the single-purger discipline.
struct PurgeGuard<'a>(&'a AtomicBool);

impl<'a> PurgeGuard<'a> {
    fn try_acquire(lock: &'a AtomicBool) -> Option<Self> {
        lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| Self(lock))
    }
}

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Manager {
    /// Schedule `count` freed blocks for purging, or purge immediately
    /// when deferral is disabled.
    pub(crate) fn schedule_purge(&self, arena: &Arena, idx: BitIndex, count: usize) {
        debug_assert!(arena.allow_decommit);
        let delay = self.config.purge_delay_ms;
        if self.os.is_preloading() || delay == 0 {
            self.purge_now(arena, idx, count);
            return;
        }

        let expire = arena.purge_expire.load(Ordering::Relaxed);
        if expire != 0 {
            // coalesce bursts of frees into one later purge
            arena.purge_expire.fetch_add(delay / 10, Ordering::AcqRel);
        } else {
            arena
                .purge_expire
                .store(self.os.now_ms() + delay, Ordering::Release);
        }
        if let Some(purge) = &arena.blocks_purge {
            purge.claim(idx, count);
        }
        self.stats.record_purge_scheduled();
    }

    /// Decommit or reset a run right now, updating the bitmaps only when
    /// the OS accepted. Reset leaves the committed bits set: the memory
    /// stays committed, only its contents may be discarded.
    fn purge_now(&self, arena: &Arena, idx: BitIndex, count: usize) {
        let ptr = arena.block_ptr(idx.bit());
        let size = count * BLOCK_SIZE;

        let decommitted = if self.config.reset_decommits && !self.os.is_preloading() {
            let ok = self.os.decommit(ptr, size);
            if ok {
                self.stats.record_os_decommit();
            }
            ok
        } else {
            if self.os.reset(ptr, size) {
                self.stats.record_os_reset();
            }
            false
        };

        if decommitted {
            if let Some(committed) = &arena.blocks_committed {
                committed.unclaim(idx, count);
            }
            if let Some(purge) = &arena.blocks_purge {
                purge.unclaim(idx, count);
            }
        }
    }

    /// Purge every run of set bits in `mask` within `[start, start+len)`
    /// of `field`. `mask` is the purge field re-read under the
    /// protective inuse claim.
    fn purge_range(&self, arena: &Arena, field: usize, start: usize, len: usize, mask: usize) {
        let end = start + len;
        let mut bit = start;
        while bit < end {
            let mut run = 0;
            while bit + run < end && mask & (1 << (bit + run)) != 0 {
                run += 1;
            }
            if run > 0 {
                self.purge_now(arena, BitIndex::new(field, bit), run);
            }
            bit += run + 1;
        }
    }

    /// Purge an arena's pending runs if their expiry has passed (or
    /// unconditionally with `force`). Returns whether anything ran.
    fn try_purge(&self, arena: &Arena, now: u64, force: bool) -> bool {
        if !arena.allow_decommit {
            return false;
        }
        let Some(purge) = &arena.blocks_purge else {
            return false;
        };

        let expire = arena.purge_expire.load(Ordering::Relaxed);
        if expire == 0 {
            return false;
        }
        if arena
            .purge_expire
            .compare_exchange(expire, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        if !force && expire > now {
            // not due yet; put the expiry back
            arena.purge_expire.store(expire, Ordering::Release);
            return false;
        }

        let mut any_purged = false;
        for field in 0..arena.field_count {
            let map = purge.load_field(field, Ordering::Relaxed);
            if map == 0 {
                continue;
            }
            let mut bit = 0;
            while bit < FIELD_BITS {
                if map & (1 << bit) == 0 {
                    bit += 1;
                    continue;
                }
                let mut len = 1;
                while bit + len < FIELD_BITS && map & (1 << (bit + len)) != 0 {
                    len += 1;
                }

                // shield the run from allocators by taking its inuse
                // bits; shrink until the claim succeeds. Blocks an
                // allocator re-acquired in the meantime must not be
                // decommitted under it.
                let idx = BitIndex::new(field, bit);
                let mut claimed = len;
                while claimed > 0 && !arena.blocks_inuse.try_claim(idx, claimed) {
                    claimed -= 1;
                }
                if claimed == 0 {
                    bit += 1;
                    continue;
                }

                // an allocator that won the race cleared purge bits under
                // its claim before we shielded the run; honor that
                let fresh = purge.load_field(field, Ordering::Acquire);
                self.purge_range(arena, field, bit, claimed, fresh);
                arena.blocks_inuse.unclaim(idx, claimed);
                any_purged = true;
                bit += claimed;
            }
        }
        any_purged
    }

    /// Run pending purges across all arenas.
    ///
    /// Best-effort and non-blocking: at most one thread purges at a
    /// time, concurrent callers return immediately. With `visit_all`
    /// false the walk stops after the first arena that did useful work,
    /// bounding per-call latency while many calls still make progress.
    pub fn try_purge_all(&self, force: bool, visit_all: bool) -> bool {
        if self.os.is_preloading() || self.config.purge_delay_ms == 0 {
            return false; // nothing is ever scheduled
        }
        let max_arena = self.arena_count();
        if max_arena == 0 {
            return false;
        }

        let Some(_guard) = PurgeGuard::try_acquire(&self.purge_lock) else {
            return false;
        };

        let now = self.os.now_ms();
        let mut budget = if visit_all { max_arena } else { 1 };
        let mut any_purged = false;
        for arena in self.registry.iter() {
            if self.try_purge(arena, now, force) {
                any_purged = true;
                if budget <= 1 {
                    break;
                }
                budget -= 1;
            }
        }
        any_purged
    }
}
