//! Reservation façade: turning OS regions into registered arenas.

use crate::error::{Error, Result};
use crate::memid::ArenaId;

use super::{align_up_blocks, Arena, Manager, BLOCK_SIZE, SEGMENT_ALIGN};

/// Size of one huge OS page.
const HUGE_PAGE_SIZE: usize = 1 << 30;

impl Manager {
    /// Register a caller-provided OS region as an arena.
    ///
    /// The region is truncated to whole blocks. Large-page regions are
    /// treated as committed; only regions handed over uncommitted may be
    /// decommitted later.
    pub fn manage_os_memory(
        &self,
        start: *mut u8,
        size: usize,
        is_committed: bool,
        is_large: bool,
        is_zero: bool,
        numa_node: i32,
        exclusive: bool,
    ) -> Result<ArenaId> {
        if size < BLOCK_SIZE {
            return Err(Error::config("arena region smaller than one block"));
        }
        let is_committed = is_committed || is_large;
        let allow_decommit = !is_large && !is_committed;
        let block_count = size / BLOCK_SIZE;

        let arena = Arena::new(
            start,
            block_count,
            numa_node,
            is_zero,
            is_large,
            allow_decommit,
            exclusive,
        );
        let id = self.registry.add(Box::new(arena))?;
        self.stats.record_arena_registered();
        log::debug!(
            "registered arena {}: {block_count} blocks at {start:p}{}{}",
            id.get(),
            if is_large { ", large pages" } else { "" },
            if exclusive { ", exclusive" } else { "" },
        );
        Ok(id)
    }

    /// Reserve a fresh OS region and register it as an arena. The region
    /// is released if registration fails.
    pub fn reserve_os_memory(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
        exclusive: bool,
    ) -> Result<ArenaId> {
        let size = align_up_blocks(size);
        let os_alloc = self
            .os
            .alloc_aligned(size, SEGMENT_ALIGN, commit, allow_large)
            .ok_or(Error::OutOfMemory(size))?;
        self.stats.record_os_alloc();
        let committed = commit || os_alloc.is_large;

        match self.manage_os_memory(
            os_alloc.ptr,
            size,
            committed,
            os_alloc.is_large,
            true,
            -1,
            exclusive,
        ) {
            Ok(id) => {
                log::debug!(
                    "reserved {} KiB arena{}",
                    size / 1024,
                    if os_alloc.is_large {
                        " on large OS pages"
                    } else {
                        ""
                    }
                );
                Ok(id)
            }
            Err(err) => {
                self.os
                    .free_aligned(os_alloc.ptr, size, SEGMENT_ALIGN, 0, committed);
                log::warn!("failed to reserve {} KiB arena: {err}", size / 1024);
                Err(err)
            }
        }
    }

    /// Reserve huge OS pages on one NUMA node and register them as an
    /// always-committed large-page arena.
    ///
    /// A reservation that times out registers whatever arrived, so the
    /// resulting arena may be smaller than requested. `Ok(None)` for a
    /// zero-page request.
    pub fn reserve_huge_pages_at(
        &self,
        pages: usize,
        numa_node: i32,
        timeout_ms: u64,
        exclusive: bool,
    ) -> Result<Option<ArenaId>> {
        if pages == 0 {
            return Ok(None);
        }
        let numa_node = if numa_node < 0 {
            -1
        } else {
            numa_node % self.os.numa_node_count().max(1) as i32
        };

        let huge = self
            .os
            .alloc_huge_pages(pages, numa_node, timeout_ms)
            .filter(|h| h.pages > 0)
            .ok_or_else(|| {
                log::warn!("failed to reserve {pages} GiB of huge pages");
                Error::OutOfMemory(pages * HUGE_PAGE_SIZE)
            })?;
        log::debug!(
            "numa node {numa_node}: reserved {} GiB of huge pages (of the {pages} GiB requested)",
            huge.pages
        );

        match self.manage_os_memory(huge.ptr, huge.size, true, true, true, numa_node, exclusive) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                self.os.free_huge_pages(huge.ptr, huge.size);
                Err(err)
            }
        }
    }

    /// Spread a huge-page reservation evenly across NUMA nodes; the
    /// first `pages % nodes` nodes take one extra page, and each node
    /// gets a proportional slice of the timeout.
    pub fn reserve_huge_pages_interleave(
        &self,
        pages: usize,
        numa_count: usize,
        timeout_ms: u64,
    ) -> Result<()> {
        if pages == 0 {
            return Ok(());
        }
        let numa_count = if numa_count > 0 {
            numa_count
        } else {
            self.os.numa_node_count()
        }
        .max(1);

        let pages_per = pages / numa_count;
        let pages_mod = pages % numa_count;
        let timeout_per = if timeout_ms == 0 {
            0
        } else {
            timeout_ms / numa_count as u64 + 50
        };

        let mut remaining = pages;
        for node in 0..numa_count {
            if remaining == 0 {
                break;
            }
            let node_pages = pages_per + usize::from(node < pages_mod);
            self.reserve_huge_pages_at(node_pages, node as i32, timeout_per, false)?;
            remaining = remaining.saturating_sub(node_pages);
        }
        Ok(())
    }
}
