use std::sync::Arc;

use strata_rs::os::{MockMemory, OsCall, OsMemory};
use strata_rs::prelude::*;
use strata_rs::{BLOCK_SIZE, MIN_OBJ_SIZE, SEGMENT_ALIGN};

const MIB: usize = 1024 * 1024;

fn test_config() -> Config {
    Config::builder()
        .arena_reserve(0)
        .purge_delay_ms(100)
        .reset_decommits(true)
        .build()
        .unwrap()
}

fn manager_with(config: Config) -> (Manager, Arc<MockMemory>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let os = Arc::new(MockMemory::new());
    let manager = Manager::new(config, os.clone()).unwrap();
    (manager, os)
}

#[test]
fn test_first_allocation_starts_at_arena_base() {
    let (manager, os) = manager_with(test_config());
    let id = manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();
    let (start, size) = manager.arena_area(id).unwrap();
    assert_eq!(size, 256 * MIB);

    let run = manager.alloc(32 * MIB, true, false, None).unwrap();
    assert_eq!(run.ptr.as_ptr(), start);

    let (got_id, exclusive, block) = run.memid.decode().unwrap();
    assert_eq!(got_id.index(), 0);
    assert!(!exclusive);
    assert_eq!(block, 0);

    assert!(run.committed);
    assert!(run.is_zero, "first use of unwritten blocks must be zero");
    assert!(!run.is_pinned);
    assert_eq!(os.commit_count(), 1);
}

#[test]
fn test_second_allocation_follows_the_first() {
    let (manager, _os) = manager_with(test_config());
    let id = manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();
    let (start, _) = manager.arena_area(id).unwrap();

    let first = manager.alloc(32 * MIB, true, false, None).unwrap();
    let second = manager.alloc(64 * MIB, true, false, None).unwrap();

    assert_eq!(first.ptr.as_ptr(), start);
    assert_eq!(second.ptr.as_ptr() as usize, start as usize + 32 * MIB);
    let (_, _, block) = second.memid.decode().unwrap();
    assert_eq!(block, 1);
}

#[test]
fn test_freed_run_is_recycled_without_decommit() {
    let (manager, os) = manager_with(test_config());
    manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();

    let _keep = manager.alloc(32 * MIB, true, false, None).unwrap();
    let run = manager.alloc(64 * MIB, true, false, None).unwrap();
    let addr = run.ptr.as_ptr();
    manager.free(addr, 64 * MIB, BLOCK_SIZE, 0, run.memid, true);

    // the purge is parked, not executed; reallocating immediately must
    // return the same blocks and must not touch the OS at all
    os.clear_calls();
    let again = manager.alloc(64 * MIB, true, false, None).unwrap();
    assert_eq!(again.ptr.as_ptr(), addr);
    assert!(os.decommits().is_empty());
    assert_eq!(os.commit_count(), 0, "blocks were still committed");
    assert!(!again.is_zero, "recycled blocks are dirty");
}

#[test]
fn test_purge_decommits_after_expiry() {
    let (manager, os) = manager_with(test_config());
    manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();

    let _keep = manager.alloc(32 * MIB, true, false, None).unwrap();
    let run = manager.alloc(64 * MIB, true, false, None).unwrap();
    let addr = run.ptr.as_ptr() as usize;
    manager.free(run.ptr.as_ptr(), 64 * MIB, BLOCK_SIZE, 0, run.memid, true);

    // before the expiry nothing may happen
    assert!(!manager.try_purge_all(false, true));
    assert!(os.decommits().is_empty());

    os.advance_clock(100);
    assert!(manager.try_purge_all(false, true));
    assert_eq!(os.decommits(), vec![(addr, 64 * MIB)]);

    // everything drained: a second pass finds nothing pending
    assert!(!manager.try_purge_all(false, true));

    // the run decommitted, so allocating it again must commit again
    os.clear_calls();
    let again = manager.alloc(64 * MIB, true, false, None).unwrap();
    assert_eq!(again.ptr.as_ptr() as usize, addr);
    assert_eq!(os.commit_count(), 1);
}

#[test]
fn test_force_purge_ignores_expiry() {
    let (manager, os) = manager_with(test_config());
    manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();

    let run = manager.alloc(32 * MIB, true, false, None).unwrap();
    manager.free(run.ptr.as_ptr(), 32 * MIB, BLOCK_SIZE, 0, run.memid, true);

    assert!(manager.try_purge_all(true, true));
    assert_eq!(os.decommits().len(), 1);
}

#[test]
fn test_numa_local_arena_is_tried_first() {
    let (manager, os) = manager_with(test_config());
    os.set_numa_nodes(2);

    let region0 = os.alloc_aligned(64 * MIB, SEGMENT_ALIGN, false, false).unwrap();
    let region1 = os.alloc_aligned(64 * MIB, SEGMENT_ALIGN, false, false).unwrap();
    manager
        .manage_os_memory(region0.ptr, 64 * MIB, false, false, true, 0, false)
        .unwrap();
    manager
        .manage_os_memory(region1.ptr, 64 * MIB, false, false, true, 1, false)
        .unwrap();

    os.set_current_node(1);
    let node1_base = region1.ptr as usize;
    let node0_base = region0.ptr as usize;

    // both blocks of the node-1 arena go first
    let a = manager.alloc(32 * MIB, false, false, None).unwrap();
    let b = manager.alloc(32 * MIB, false, false, None).unwrap();
    for run in [&a, &b] {
        let addr = run.ptr.as_ptr() as usize;
        assert!((node1_base..node1_base + 64 * MIB).contains(&addr));
    }

    // node 1 is full; the foreign arena serves the next request
    let c = manager.alloc(32 * MIB, false, false, None).unwrap();
    let addr = c.ptr.as_ptr() as usize;
    assert!((node0_base..node0_base + 64 * MIB).contains(&addr));
}

#[test]
fn test_eager_reserve_skipped_at_registry_pressure() {
    let config = Config::builder()
        .arena_reserve(64 * MIB)
        .purge_delay_ms(100)
        .build()
        .unwrap();
    let (manager, os) = manager_with(config);

    // fill ¾ of the registry with single-block arenas, all of them full
    for _ in 0..48 {
        let region = os.alloc_aligned(32 * MIB, SEGMENT_ALIGN, false, false).unwrap();
        manager
            .manage_os_memory(region.ptr, 32 * MIB, false, false, true, -1, false)
            .unwrap();
        manager.alloc(32 * MIB, false, false, None).unwrap();
    }
    assert_eq!(manager.arena_count(), 48);

    os.clear_calls();
    let run = manager.alloc(32 * MIB, false, false, None).unwrap();

    // above the threshold no new arena may be reserved; the request
    // falls through to the OS
    assert!(run.memid.is_os());
    assert_eq!(manager.arena_count(), 48);
    let allocs: Vec<_> = os
        .calls()
        .iter()
        .filter(|c| matches!(c, OsCall::Alloc { .. }))
        .cloned()
        .collect();
    assert_eq!(
        allocs,
        vec![OsCall::Alloc {
            size: 32 * MIB,
            commit: false
        }]
    );
}

#[test]
fn test_eager_reserve_below_threshold() {
    let config = Config::builder()
        .arena_reserve(128 * MIB)
        .purge_delay_ms(100)
        .build()
        .unwrap();
    let (manager, os) = manager_with(config);

    let run = manager.alloc(32 * MIB, true, false, None).unwrap();
    assert!(!run.memid.is_os(), "should come from the eager arena");
    assert_eq!(manager.arena_count(), 1);

    // the eager reservation is uncommitted and rounded to whole blocks
    assert!(os.calls().contains(&OsCall::Alloc {
        size: 128 * MIB,
        commit: false
    }));
}

#[test]
fn test_exclusive_arena_requires_naming_it() {
    let (manager, _os) = manager_with(test_config());
    let id = manager
        .reserve_os_memory(64 * MIB, false, false, true)
        .unwrap();

    // unspecific requests may not land in the exclusive arena
    let anon = manager.alloc(32 * MIB, false, false, None).unwrap();
    assert!(anon.memid.is_os());

    let named = manager.alloc(32 * MIB, false, false, Some(id)).unwrap();
    let (got_id, exclusive, _) = named.memid.decode().unwrap();
    assert_eq!(got_id, id);
    assert!(exclusive);
}

#[test]
fn test_specific_arena_exhaustion_fails_without_fallback() {
    let (manager, _os) = manager_with(test_config());
    let id = manager
        .reserve_os_memory(32 * MIB, false, false, false)
        .unwrap();

    manager.alloc(32 * MIB, false, false, Some(id)).unwrap();
    let result = manager.alloc(32 * MIB, false, false, Some(id));
    assert!(matches!(result, Err(Error::OutOfMemory(_))));
}

#[test]
fn test_large_page_arena_needs_large_request() {
    let (manager, os) = manager_with(test_config());
    let region = os.alloc_aligned(64 * MIB, SEGMENT_ALIGN, true, false).unwrap();
    manager
        .manage_os_memory(region.ptr, 64 * MIB, true, true, true, -1, false)
        .unwrap();

    let small_pages = manager.alloc(32 * MIB, true, false, None).unwrap();
    assert!(small_pages.memid.is_os());

    let large = manager.alloc(32 * MIB, true, true, None).unwrap();
    assert!(!large.memid.is_os());
    assert!(large.is_large);
    assert!(large.is_pinned);
    assert!(large.committed, "large-page arenas are always committed");
}

#[test]
fn test_min_object_size_boundary() {
    let (manager, _os) = manager_with(test_config());
    manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();

    let below = manager.alloc(MIN_OBJ_SIZE - 1, true, false, None).unwrap();
    assert!(below.memid.is_os());

    let at = manager.alloc(MIN_OBJ_SIZE, true, false, None).unwrap();
    assert!(!at.memid.is_os());
}

#[test]
fn test_overaligned_request_bypasses_arenas() {
    let (manager, _os) = manager_with(test_config());
    manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();

    let run = manager
        .alloc_aligned(AllocRequest {
            alignment: 2 * SEGMENT_ALIGN,
            ..AllocRequest::new(32 * MIB)
        })
        .unwrap();
    assert!(run.memid.is_os());

    let offset = manager
        .alloc_aligned(AllocRequest {
            align_offset: 4096,
            ..AllocRequest::new(32 * MIB)
        })
        .unwrap();
    assert!(offset.memid.is_os());
}

#[test]
fn test_run_spanning_bitmap_fields() {
    let (manager, os) = manager_with(test_config());
    // 65 blocks: the inuse bitmap needs two fields
    let id = manager
        .reserve_os_memory(65 * 32 * MIB, false, false, false)
        .unwrap();
    let (start, _) = manager.arena_area(id).unwrap();

    let mut singles = Vec::new();
    for _ in 0..63 {
        singles.push(manager.alloc(32 * MIB, false, false, None).unwrap());
    }

    // blocks 63 and 64 straddle the field boundary
    let straddle = manager.alloc(64 * MIB, false, false, None).unwrap();
    assert_eq!(
        straddle.ptr.as_ptr() as usize,
        start as usize + 63 * 32 * MIB
    );

    manager.free(
        straddle.ptr.as_ptr(),
        64 * MIB,
        BLOCK_SIZE,
        0,
        straddle.memid,
        false,
    );
    os.clear_calls();
    manager.try_purge_all(true, true);

    // the purge engine scans per field, so the straddling run is
    // decommitted in two pieces that cover it exactly
    let mut decommits = os.decommits();
    decommits.sort();
    assert_eq!(
        decommits,
        vec![
            (start as usize + 63 * 32 * MIB, 32 * MIB),
            (start as usize + 64 * 32 * MIB, 32 * MIB),
        ]
    );
}

#[test]
fn test_double_free_is_reported_and_survived() {
    let (manager, _os) = manager_with(test_config());
    manager
        .reserve_os_memory(256 * MIB, false, false, false)
        .unwrap();

    let run = manager.alloc(64 * MIB, true, false, None).unwrap();
    manager.free(run.ptr.as_ptr(), 64 * MIB, BLOCK_SIZE, 0, run.memid, true);
    manager.free(run.ptr.as_ptr(), 64 * MIB, BLOCK_SIZE, 0, run.memid, true);

    assert_eq!(manager.stats().snapshot().double_frees, 1);

    // the arena remains usable
    let again = manager.alloc(64 * MIB, true, false, None).unwrap();
    assert_eq!(again.ptr.as_ptr(), run.ptr.as_ptr());
}

#[test]
fn test_invalid_free_is_a_no_op() {
    let (manager, os) = manager_with(test_config());
    manager
        .reserve_os_memory(64 * MIB, false, false, false)
        .unwrap();

    // memid naming an arena that was never registered
    let bogus = MemId::from_raw(50);
    manager.free(0x1000 as *mut u8, 32 * MIB, BLOCK_SIZE, 0, bogus, true);
    assert_eq!(manager.stats().snapshot().invalid_frees, 1);

    // a run that would extend past the arena's last block
    let run = manager.alloc(64 * MIB, false, false, None).unwrap();
    manager.free(run.ptr.as_ptr(), 96 * MIB, BLOCK_SIZE, 0, run.memid, true);
    assert_eq!(manager.stats().snapshot().invalid_frees, 2);
    assert!(os.decommits().is_empty());
}

#[test]
fn test_os_memid_free_goes_to_os() {
    let (manager, os) = manager_with(test_config());
    let run = manager.alloc(MIN_OBJ_SIZE - 1, true, false, None).unwrap();
    assert!(run.memid.is_os());

    manager.free(
        run.ptr.as_ptr(),
        MIN_OBJ_SIZE - 1,
        BLOCK_SIZE,
        0,
        run.memid,
        true,
    );
    assert!(os
        .calls()
        .iter()
        .any(|c| matches!(c, OsCall::Free { .. })));
}

#[test]
fn test_zero_purge_delay_purges_on_free() {
    let config = Config::builder()
        .arena_reserve(0)
        .purge_delay_ms(0)
        .reset_decommits(true)
        .build()
        .unwrap();
    let (manager, os) = manager_with(config);
    manager
        .reserve_os_memory(64 * MIB, false, false, false)
        .unwrap();

    let run = manager.alloc(32 * MIB, true, false, None).unwrap();
    let addr = run.ptr.as_ptr() as usize;
    manager.free(run.ptr.as_ptr(), 32 * MIB, BLOCK_SIZE, 0, run.memid, true);

    assert_eq!(os.decommits(), vec![(addr, 32 * MIB)]);
}

#[test]
fn test_preloading_resets_instead_of_decommitting() {
    let (manager, os) = manager_with(test_config());
    manager
        .reserve_os_memory(64 * MIB, false, false, false)
        .unwrap();
    let run = manager.alloc(32 * MIB, true, false, None).unwrap();

    os.set_preloading(true);
    manager.free(run.ptr.as_ptr(), 32 * MIB, BLOCK_SIZE, 0, run.memid, true);

    assert!(os.decommits().is_empty());
    assert_eq!(os.resets().len(), 1);
    assert!(!manager.try_purge_all(true, true));
}

#[test]
fn test_reset_purge_keeps_blocks_committed() {
    // without reset_decommits the purge resets; recommit is unnecessary
    let config = Config::builder()
        .arena_reserve(0)
        .purge_delay_ms(100)
        .reset_decommits(false)
        .build()
        .unwrap();
    let (manager, os) = manager_with(config);
    manager
        .reserve_os_memory(64 * MIB, false, false, false)
        .unwrap();

    let run = manager.alloc(32 * MIB, true, false, None).unwrap();
    manager.free(run.ptr.as_ptr(), 32 * MIB, BLOCK_SIZE, 0, run.memid, true);
    os.advance_clock(100);
    assert!(manager.try_purge_all(false, true));
    assert!(os.decommits().is_empty());
    assert_eq!(os.resets().len(), 1);

    os.clear_calls();
    let again = manager.alloc(32 * MIB, true, false, None).unwrap();
    assert_eq!(os.commit_count(), 0, "reset memory stays committed");
    assert!(!again.is_zero, "reset contents are undefined, not zero");
}

#[test]
fn test_uncommitted_allocation_reports_commit_state() {
    let (manager, os) = manager_with(test_config());
    manager
        .reserve_os_memory(64 * MIB, false, false, false)
        .unwrap();

    let run = manager.alloc(32 * MIB, false, false, None).unwrap();
    assert!(!run.committed);
    assert_eq!(os.commit_count(), 0);

    manager.free(run.ptr.as_ptr(), 32 * MIB, BLOCK_SIZE, 0, run.memid, false);
    let committed = manager.alloc(32 * MIB, true, false, None).unwrap();
    assert!(committed.committed);
    assert_eq!(os.commit_count(), 1);
}

#[test]
fn test_partial_huge_page_reservation_registers() {
    let (manager, os) = manager_with(test_config());
    os.set_huge_page_limit(4);

    let id = manager
        .reserve_huge_pages_at(8, -1, 500, false)
        .unwrap()
        .expect("partial reservation still yields an arena");
    let (_, size) = manager.arena_area(id).unwrap();
    assert_eq!(size, 4 << 30);

    let run = manager.alloc(32 * MIB, true, true, None).unwrap();
    assert!(run.is_large && run.is_pinned && run.committed);
}

#[test]
fn test_zero_huge_pages_is_a_no_op() {
    let (manager, os) = manager_with(test_config());
    assert!(manager
        .reserve_huge_pages_at(0, 0, 100, false)
        .unwrap()
        .is_none());
    assert!(os.calls().is_empty());
}

#[test]
fn test_huge_page_interleave_splits_pages_and_timeout() {
    let (manager, os) = manager_with(test_config());
    os.set_numa_nodes(3);

    manager.reserve_huge_pages_interleave(8, 3, 300).unwrap();

    let huge_calls: Vec<_> = os
        .calls()
        .iter()
        .filter_map(|c| match c {
            OsCall::HugeAlloc {
                pages,
                numa_node,
                timeout_ms,
            } => Some((*pages, *numa_node, *timeout_ms)),
            _ => None,
        })
        .collect();
    // 8 pages over 3 nodes: the first two nodes take one extra
    assert_eq!(huge_calls, vec![(3, 0, 150), (3, 1, 150), (2, 2, 150)]);
    assert_eq!(manager.arena_count(), 3);
}

#[test]
fn test_registry_rejects_arena_beyond_capacity() {
    let (manager, os) = manager_with(test_config());
    for _ in 0..strata_rs::MAX_ARENAS {
        manager
            .reserve_os_memory(32 * MIB, false, false, false)
            .unwrap();
    }

    os.clear_calls();
    let result = manager.reserve_os_memory(32 * MIB, false, false, false);
    assert!(matches!(result, Err(Error::RegistryFull)));
    // the backing region must be handed back
    assert!(os.calls().iter().any(|c| matches!(c, OsCall::Free { .. })));
    assert_eq!(manager.arena_count(), strata_rs::MAX_ARENAS);
}
