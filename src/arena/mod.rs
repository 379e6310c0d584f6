//! Arena descriptors and the process-wide registry.
//!
//! An arena is a contiguous OS region carved into [`BLOCK_SIZE`] blocks,
//! tracked by parallel atomic bitmaps: `blocks_inuse` is authoritative
//! for ownership, `blocks_dirty` records which blocks were ever written,
//! and decommittable arenas add `blocks_committed` and `blocks_purge`.
//! A descriptor's layout is immutable once it is published in the
//! registry; only bitmaps and control words mutate afterwards.

pub mod manager;
mod purge;
mod reserve;

pub use manager::{AllocRequest, Allocation, Manager};

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::bitmap::{BitIndex, Bitmap, FIELD_BITS};
use crate::error::{Error, Result};
use crate::memid::{id_is_suitable, ArenaId};
use crate::util::CachePadded;

/// Alignment of segments handed to the upper allocator layers.
pub const SEGMENT_ALIGN: usize = 8 * 1024 * 1024;

/// Size of one arena block.
pub const BLOCK_SIZE: usize = 4 * SEGMENT_ALIGN;

/// Smallest request served from an arena; anything below goes straight
/// to the OS.
pub const MIN_OBJ_SIZE: usize = BLOCK_SIZE / 2;

/// Capacity of the arena registry.
pub const MAX_ARENAS: usize = 64;

/// Number of blocks needed to hold `size` bytes.
pub(crate) fn block_count_of(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE)
}

/// Round `size` up to a whole number of blocks.
pub(crate) fn align_up_blocks(size: usize) -> usize {
    block_count_of(size) * BLOCK_SIZE
}

/// Descriptor of one registered arena.
pub(crate) struct Arena {
    /// Assigned by the registry; stable for the life of the process.
    pub(crate) id: ArenaId,
    /// Only requests naming this arena may allocate here.
    pub(crate) exclusive: bool,
    pub(crate) start: *mut u8,
    pub(crate) block_count: usize,
    pub(crate) field_count: usize,
    /// `-1` means any node.
    pub(crate) numa_node: i32,
    /// Large/huge OS pages; always committed, never decommitted.
    pub(crate) is_large: bool,
    pub(crate) allow_decommit: bool,
    /// Block index of the last claim; searches start near it.
    pub(crate) search_idx: AtomicUsize,
    /// Earliest time pending purges may run; `0` when none are pending.
    pub(crate) purge_expire: AtomicU64,
    pub(crate) blocks_inuse: Bitmap,
    pub(crate) blocks_dirty: Bitmap,
    pub(crate) blocks_committed: Option<Bitmap>,
    pub(crate) blocks_purge: Option<Bitmap>,
}

// SAFETY: the region pointer is never dereferenced by the arena itself;
// all shared mutation goes through the atomic bitmaps and control words.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn new(
        start: *mut u8,
        block_count: usize,
        numa_node: i32,
        is_zero_init: bool,
        is_large: bool,
        allow_decommit: bool,
        exclusive: bool,
    ) -> Arena {
        let field_count = block_count.div_ceil(FIELD_BITS);

        let blocks_inuse = Bitmap::new(field_count);
        // permanently claim the tail of the last field so searches can
        // never hand out blocks past the region
        let post = field_count * FIELD_BITS - block_count;
        if post > 0 {
            blocks_inuse.claim(BitIndex::new(field_count - 1, FIELD_BITS - post), post);
        }

        // a region of unknown content must never report zero blocks
        let blocks_dirty = Bitmap::new(field_count);
        if !is_zero_init {
            blocks_dirty.set_all();
        }

        Arena {
            id: ArenaId::from_index(0), // reassigned when the registry publishes the slot
            exclusive,
            start,
            block_count,
            field_count,
            numa_node,
            is_large,
            allow_decommit,
            search_idx: AtomicUsize::new(0),
            purge_expire: AtomicU64::new(0),
            blocks_inuse,
            blocks_dirty,
            blocks_committed: allow_decommit.then(|| Bitmap::new(field_count)),
            blocks_purge: allow_decommit.then(|| Bitmap::new(field_count)),
        }
    }

    /// Address of block `block`.
    pub(crate) fn block_ptr(&self, block: usize) -> *mut u8 {
        self.start.wrapping_add(block * BLOCK_SIZE)
    }

    /// Region size in bytes.
    pub(crate) fn size(&self) -> usize {
        self.block_count * BLOCK_SIZE
    }

    pub(crate) fn is_suitable(&self, req: Option<ArenaId>) -> bool {
        id_is_suitable(self.id, self.exclusive, req)
    }
}

/// Bounded, append-only array of arena descriptors.
///
/// Registration publishes a slot with a release store; readers acquire
/// the pointer. A null slot below the count means the publisher is not
/// visible yet and is treated as end-of-list. Slots are never replaced.
pub(crate) struct Registry {
    slots: [AtomicPtr<Arena>; MAX_ARENAS],
    count: CachePadded<AtomicUsize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            count: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a slot, assign the id, and publish the descriptor.
    pub(crate) fn add(&self, mut arena: Box<Arena>) -> Result<ArenaId> {
        let index = self.count.fetch_add(1, Ordering::AcqRel);
        if index >= MAX_ARENAS {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::RegistryFull);
        }
        let id = ArenaId::from_index(index);
        arena.id = id;
        self.slots[index].store(Box::into_raw(arena), Ordering::Release);
        Ok(id)
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Arena> {
        if index >= MAX_ARENAS {
            return None;
        }
        let ptr = self.slots[index].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: published descriptors are never removed while the
            // registry is alive, and `&self` borrows the registry.
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed).min(MAX_ARENAS)
    }

    /// Walk published arenas in registration order, stopping at the
    /// first slot whose publisher is not yet visible.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arena> + '_ {
        (0..self.count()).map_while(move |index| self.get(index))
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                // SAFETY: each non-null slot owns exactly one descriptor
                // installed by `add`; the backing regions belong to the
                // OS layer and are not touched here.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("count", &self.count())
            .finish()
    }
}
