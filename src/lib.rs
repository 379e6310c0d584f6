//! Strata - concurrent arena management for large-block allocation.
//!
//! Partitions big, pre-reserved OS regions ("arenas") into 32 MiB blocks
//! and hands out contiguous multi-block runs to higher-level allocators,
//! concurrently from any number of threads. Per-block state lives in
//! atomic bitmaps, so allocation and free never take a lock; freed runs
//! are decommitted lazily by a deferred purge engine.
//!
//! # Quick Start
//!
//! ```no_run
//! use strata_rs::prelude::*;
//!
//! let manager = Manager::with_system(Config::default()).unwrap();
//!
//! // Hand the manager a 256 MiB backing region, then carve runs from it.
//! manager
//!     .reserve_os_memory(256 * 1024 * 1024, false, false, false)
//!     .unwrap();
//!
//! let run = manager.alloc(64 * 1024 * 1024, true, false, None).unwrap();
//! assert!(run.committed);
//!
//! manager.free(
//!     run.ptr.as_ptr(),
//!     64 * 1024 * 1024,
//!     strata_rs::BLOCK_SIZE,
//!     0,
//!     run.memid,
//!     run.committed,
//! );
//! ```
//!
//! # Design
//!
//! - **Arenas** are registered once and live for the process; their
//!   descriptors are published through an append-only registry.
//! - **Claims** use a cross-field atomic bitmap: fields are taken in
//!   index order with CAS and undone in reverse on conflict.
//! - **NUMA**: arenas may be pinned to a node; allocation prefers the
//!   caller's node and falls back to foreign nodes.
//! - **Purging** is deferred and coalesced; a process-wide guard admits
//!   a single purging thread, which shields each run from concurrent
//!   allocators before touching the OS.

// Lint configuration
#![warn(missing_docs, missing_debug_implementations)]

pub mod bitmap;
pub mod config;
pub mod error;
pub mod memid;
pub mod os;
pub mod prelude;
pub mod stats;
pub mod util;

mod arena;

// Re-export key types at crate root
pub use arena::{
    AllocRequest, Allocation, Manager, BLOCK_SIZE, MAX_ARENAS, MIN_OBJ_SIZE, SEGMENT_ALIGN,
};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use memid::{ArenaId, MemId};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::MockMemory;
    use std::sync::Arc;

    const MIB: usize = 1024 * 1024;

    fn test_manager() -> (Manager, Arc<MockMemory>) {
        let os = Arc::new(MockMemory::new());
        let config = Config::builder()
            .arena_reserve(0)
            .purge_delay_ms(100)
            .reset_decommits(true)
            .build()
            .unwrap();
        let manager = Manager::new(config, os.clone()).unwrap();
        (manager, os)
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let (manager, _os) = test_manager();
        let id = manager
            .reserve_os_memory(256 * MIB, false, false, false)
            .unwrap();
        let (start, size) = manager.arena_area(id).unwrap();
        assert_eq!(size, 256 * MIB);

        let run = manager.alloc(32 * MIB, true, false, None).unwrap();
        assert_eq!(run.ptr.as_ptr(), start);
        assert!(run.committed);

        manager.free(run.ptr.as_ptr(), 32 * MIB, BLOCK_SIZE, 0, run.memid, true);
        assert_eq!(manager.stats().snapshot().blocks_live(), 0);
    }

    #[test]
    fn test_small_requests_bypass_arenas() {
        let (manager, _os) = test_manager();
        manager
            .reserve_os_memory(256 * MIB, false, false, false)
            .unwrap();

        let run = manager.alloc(MIN_OBJ_SIZE - 1, true, false, None).unwrap();
        assert!(run.memid.is_os());
        assert!(run.is_zero);
    }

    #[test]
    fn test_exhausted_without_fallback() {
        let os = Arc::new(MockMemory::new());
        let config = Config::builder()
            .arena_reserve(0)
            .limit_os_alloc(true)
            .build()
            .unwrap();
        let manager = Manager::new(config, os).unwrap();

        let result = manager.alloc(32 * MIB, true, false, None);
        assert!(matches!(result, Err(Error::OutOfMemory(_))));
    }
}
