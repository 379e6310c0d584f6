//! The arena manager: allocation engine and free path.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bitmap::{BitIndex, FIELD_BITS};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memid::{ArenaId, MemId};
use crate::os::OsMemory;
use crate::stats::Stats;
use crate::util::CachePadded;

use super::{
    align_up_blocks, block_count_of, Arena, Registry, BLOCK_SIZE, MAX_ARENAS, MIN_OBJ_SIZE,
    SEGMENT_ALIGN,
};

/// Parameters of an allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// Requested size in bytes; rounded up to whole blocks.
    pub size: usize,
    /// Required alignment; at most [`SEGMENT_ALIGN`] for arena placement.
    pub alignment: usize,
    /// Offset at which the alignment applies; nonzero skips arenas.
    pub align_offset: usize,
    /// Ask for the run to be committed on return.
    pub commit: bool,
    /// Allow placement on large/huge OS pages.
    pub allow_large: bool,
    /// Restrict the request to one arena.
    pub arena_id: Option<ArenaId>,
}

impl AllocRequest {
    /// A committed, block-aligned request for `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            alignment: BLOCK_SIZE,
            align_offset: 0,
            commit: true,
            allow_large: false,
            arena_id: None,
        }
    }
}

/// A successful allocation.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// Start of the run.
    pub ptr: NonNull<u8>,
    /// Origin token; pass it back to [`Manager::free`].
    pub memid: MemId,
    /// The run is fully committed.
    pub committed: bool,
    /// The run sits on large/huge OS pages.
    pub is_large: bool,
    /// The run can never be decommitted or moved.
    pub is_pinned: bool,
    /// Every byte of the run is known to be zero.
    pub is_zero: bool,
}

// SAFETY: a plain data record; ownership of the run moves with it.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Process-wide arena manager.
///
/// Partitions registered OS regions into [`BLOCK_SIZE`] blocks and hands
/// out contiguous runs concurrently. Any thread may allocate or free at
/// any time; all synchronisation is atomic, no path blocks on a lock.
#[derive(Debug)]
pub struct Manager {
    pub(crate) os: Arc<dyn OsMemory>,
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) purge_lock: CachePadded<AtomicBool>,
    pub(crate) stats: Stats,
}

impl Manager {
    /// Create a manager driving the given OS collaborator.
    pub fn new(config: Config, os: Arc<dyn OsMemory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            os,
            config,
            registry: Registry::new(),
            purge_lock: CachePadded::new(AtomicBool::new(false)),
            stats: Stats::new(),
        })
    }

    /// Create a manager backed by the real OS.
    #[cfg(unix)]
    pub fn with_system(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(crate::os::SystemMemory::new()))
    }

    /// The options this manager runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Event counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of registered arenas.
    pub fn arena_count(&self) -> usize {
        self.registry.count()
    }

    /// Region start and byte size of a registered arena.
    pub fn arena_area(&self, id: ArenaId) -> Option<(*mut u8, usize)> {
        let arena = self.registry.get(id.index())?;
        Some((arena.start, arena.size()))
    }

    /// [`Manager::alloc_aligned`] with the default block alignment.
    pub fn alloc(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
        arena_id: Option<ArenaId>,
    ) -> Result<Allocation> {
        self.alloc_aligned(AllocRequest {
            size,
            alignment: BLOCK_SIZE,
            align_offset: 0,
            commit,
            allow_large,
            arena_id,
        })
    }

    /// Allocate a contiguous run of blocks.
    ///
    /// Arenas are tried NUMA-local first, then remote; when nothing fits
    /// and the registry has room, a fresh arena of `arena_reserve` bytes
    /// is reserved and retried. Requests too small, over-aligned, or
    /// offset-aligned bypass arenas entirely. The OS fallback is skipped
    /// when `limit_os_alloc` is set or a specific arena was named.
    pub fn alloc_aligned(&self, req: AllocRequest) -> Result<Allocation> {
        if req.size == 0 {
            return Err(Error::OutOfMemory(0));
        }
        let numa_node = self.os.current_numa_node();

        if req.size >= MIN_OBJ_SIZE && req.alignment <= SEGMENT_ALIGN && req.align_offset == 0 {
            if let Some(allocation) = self.alloc_from_arenas(numa_node, &req) {
                return Ok(allocation);
            }

            // eagerly reserve a fresh arena and retry before falling
            // back to a one-off OS region
            let eager = align_up_blocks(self.config.arena_reserve);
            if eager > 0
                && eager >= req.size
                && req.arena_id.is_none()
                && self.arena_count() < 3 * (MAX_ARENAS / 4)
            {
                if let Ok(id) = self.reserve_os_memory(eager, false, req.allow_large, false) {
                    if let Some(allocation) = self.alloc_in(id, numa_node, &req) {
                        return Ok(allocation);
                    }
                }
            }
        }

        if self.config.limit_os_alloc || req.arena_id.is_some() {
            return Err(Error::OutOfMemory(req.size));
        }
        let os_alloc = self
            .os
            .alloc_aligned(req.size, req.alignment, req.commit, req.allow_large)
            .ok_or(Error::OutOfMemory(req.size))?;
        self.stats.record_os_alloc();
        Ok(Allocation {
            ptr: NonNull::new(os_alloc.ptr).ok_or(Error::OutOfMemory(req.size))?,
            memid: MemId::OS,
            committed: req.commit || os_alloc.is_large,
            is_large: os_alloc.is_large,
            is_pinned: os_alloc.is_large,
            is_zero: true,
        })
    }

    /// Walk the registry: a specific arena if one was named, otherwise
    /// NUMA-local arenas first and foreign nodes second.
    fn alloc_from_arenas(&self, numa_node: i32, req: &AllocRequest) -> Option<Allocation> {
        let bcount = block_count_of(req.size);

        if let Some(id) = req.arena_id {
            let arena = self.registry.get(id.index())?;
            if arena.numa_node >= 0 && arena.numa_node != numa_node {
                return None;
            }
            if arena.is_large && !req.allow_large {
                return None;
            }
            return self.alloc_from(arena, bcount, req);
        }

        for arena in self.registry.iter() {
            if arena.numa_node >= 0 && arena.numa_node != numa_node {
                continue;
            }
            if arena.is_large && !req.allow_large {
                continue;
            }
            if let Some(allocation) = self.alloc_from(arena, bcount, req) {
                return Some(allocation);
            }
        }
        for arena in self.registry.iter() {
            if !(arena.numa_node >= 0 && arena.numa_node != numa_node) {
                continue;
            }
            if arena.is_large && !req.allow_large {
                continue;
            }
            if let Some(allocation) = self.alloc_from(arena, bcount, req) {
                return Some(allocation);
            }
        }
        None
    }

    /// Try one specific arena (after an eager reservation).
    fn alloc_in(&self, id: ArenaId, numa_node: i32, req: &AllocRequest) -> Option<Allocation> {
        let arena = self.registry.get(id.index())?;
        if arena.numa_node >= 0 && arena.numa_node != numa_node {
            return None;
        }
        if arena.is_large && !req.allow_large {
            return None;
        }
        self.alloc_from(arena, block_count_of(req.size), req)
    }

    /// Claim `bcount` blocks from one arena and apply the side effects
    /// of the claim in order: search hint, purge shielding, dirty
    /// tracking, then commit policy.
    fn alloc_from(&self, arena: &Arena, bcount: usize, req: &AllocRequest) -> Option<Allocation> {
        if !arena.is_suitable(req.arena_id) {
            return None;
        }

        let hint = arena.search_idx.load(Ordering::Acquire) / FIELD_BITS;
        let claim = arena.blocks_inuse.try_find_from_claim(hint, bcount)?;
        arena.search_idx.store(claim.bit(), Ordering::Release);

        let block = claim.bit();
        let ptr = arena.block_ptr(block);

        // a freshly claimed run must not be purged under us; the purge
        // engine only touches runs whose inuse bits it can take, and ours
        // are already set
        if let Some(purge) = &arena.blocks_purge {
            purge.unclaim(claim, bcount);
        }

        // the run is zero only if no block was ever written
        let dirty = arena.blocks_dirty.claim(claim, bcount);
        let mut is_zero = dirty.all_zero;

        let committed = match &arena.blocks_committed {
            // always-committed arena
            None => true,
            Some(map) if req.commit => {
                let prior = map.claim(claim, bcount);
                if prior.any_zero {
                    match self.os.commit(ptr, bcount * BLOCK_SIZE) {
                        Some(info) => {
                            self.stats.record_os_commit();
                            if info.zeroed {
                                is_zero = true;
                            }
                        }
                        None => {
                            log::warn!(
                                "commit of {} bytes at {ptr:p} failed; continuing uncommitted",
                                bcount * BLOCK_SIZE
                            );
                        }
                    }
                }
                true
            }
            // no commit requested: report whether the run already is
            Some(map) => map.is_claimed(claim, bcount),
        };

        self.stats.record_blocks_claimed(bcount);

        Some(Allocation {
            ptr: NonNull::new(ptr)?,
            memid: MemId::from_arena(arena.id, arena.exclusive, block),
            committed,
            is_large: arena.is_large,
            is_pinned: arena.is_large || !arena.allow_decommit,
            is_zero,
        })
    }

    /// Release an allocation.
    ///
    /// Invalid or doubled frees are logged and counted, never fatal; the
    /// bits that can be cleared are still cleared.
    pub fn free(
        &self,
        ptr: *mut u8,
        size: usize,
        alignment: usize,
        align_offset: usize,
        memid: MemId,
        all_committed: bool,
    ) {
        if let Err(err) = self.try_free(ptr, size, alignment, align_offset, memid, all_committed) {
            log::warn!("{err}");
        }
    }

    fn try_free(
        &self,
        ptr: *mut u8,
        size: usize,
        alignment: usize,
        align_offset: usize,
        memid: MemId,
        all_committed: bool,
    ) -> Result<()> {
        if ptr.is_null() || size == 0 {
            return Ok(());
        }

        let Some((id, _exclusive, block)) = memid.decode() else {
            self.os
                .free_aligned(ptr, size, alignment, align_offset, all_committed);
            return Ok(());
        };

        let bcount = block_count_of(size);
        let invalid = || {
            self.stats.record_invalid_free();
            Error::InvalidFree {
                ptr: ptr as usize,
                memid: memid.raw(),
            }
        };
        let arena = self.registry.get(id.index()).ok_or_else(invalid)?;
        let idx = BitIndex::from_bit(block);
        if idx.field() >= arena.field_count || block + bcount > arena.block_count {
            return Err(invalid());
        }

        // park the purge bits while our inuse bits still shield the run;
        // the purge engine only sees them once inuse drops
        if arena.allow_decommit {
            self.schedule_purge(arena, idx, bcount);
        }

        let all_inuse = arena.blocks_inuse.unclaim(idx, bcount);
        self.stats.record_blocks_freed(bcount);
        if !all_inuse {
            self.stats.record_double_free();
            return Err(Error::DoubleFree {
                ptr: ptr as usize,
                size,
            });
        }
        Ok(())
    }
}
