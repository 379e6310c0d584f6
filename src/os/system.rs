//! mmap-backed OS memory (Unix).

use std::ptr;
use std::sync::OnceLock;
use std::time::Instant;

use super::{CommitInfo, HugeAlloc, OsAlloc, OsMemory};

#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: usize = 1 << 30;

#[cfg(target_os = "linux")]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const MAP_NORESERVE: libc::c_int = 0;

/// Production [`OsMemory`] backed by `mmap`/`mprotect`/`madvise`.
///
/// Reservations are `PROT_NONE` mappings; commit is an `mprotect` to
/// read-write, decommit drops the pages with `MADV_DONTNEED` and protects
/// the range again. Commit conservatively reports the range as not
/// zeroed; the dirty bitmap upstream carries the zero tracking.
#[derive(Debug, Default)]
pub struct SystemMemory;

impl SystemMemory {
    /// The OS collaborator for this process.
    pub fn new() -> Self {
        Self
    }

    fn mmap(addr: *mut u8, size: usize, prot: libc::c_int, flags: libc::c_int) -> Option<*mut u8> {
        let p = unsafe {
            libc::mmap(
                addr.cast(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            None
        } else {
            Some(p.cast())
        }
    }

    /// Map an aligned region by over-allocating and unmapping the edges.
    fn mmap_aligned(
        size: usize,
        align: usize,
        prot: libc::c_int,
        flags: libc::c_int,
    ) -> Option<*mut u8> {
        let base = Self::mmap(ptr::null_mut(), size + align, prot, flags)?;
        let addr = base as usize;
        let aligned = (addr + align - 1) & !(align - 1);
        let lead = aligned - addr;
        let trail = align - lead;
        unsafe {
            if lead > 0 {
                libc::munmap(base.cast(), lead);
            }
            if trail > 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, trail);
            }
        }
        Some(aligned as *mut u8)
    }

    #[cfg(target_os = "linux")]
    fn bind_to_node(ptr: *mut u8, size: usize, node: i32) {
        const MPOL_PREFERRED: libc::c_long = 1;
        let nodemask: libc::c_ulong = 1 << node;
        let maxnode = 8 * std::mem::size_of::<libc::c_ulong>() as libc::c_ulong;
        // best effort; the pages still work without the affinity
        unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr as usize,
                size,
                MPOL_PREFERRED,
                &nodemask as *const libc::c_ulong,
                maxnode,
                0usize,
            );
        }
    }
}

fn monotonic_epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

#[cfg(target_os = "linux")]
fn detect_numa_nodes() -> usize {
    // sysfs lists one nodeN directory per NUMA node
    if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
        let count = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|s| s.starts_with("node") && s[4..].chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
            .count();
        if count > 0 {
            return count;
        }
    }
    1
}

#[cfg(not(target_os = "linux"))]
fn detect_numa_nodes() -> usize {
    1
}

impl OsMemory for SystemMemory {
    fn alloc_aligned(
        &self,
        size: usize,
        align: usize,
        commit: bool,
        allow_large: bool,
    ) -> Option<OsAlloc> {
        let prot = if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };

        #[cfg(target_os = "linux")]
        if allow_large && commit {
            let flags = libc::MAP_HUGETLB | libc::MAP_HUGE_2MB;
            if let Some(ptr) = Self::mmap_aligned(size, align, prot, flags) {
                return Some(OsAlloc {
                    ptr,
                    is_large: true,
                });
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = allow_large;

        let flags = if commit { 0 } else { MAP_NORESERVE };
        Some(OsAlloc {
            ptr: Self::mmap_aligned(size, align, prot, flags)?,
            is_large: false,
        })
    }

    fn free_aligned(
        &self,
        ptr: *mut u8,
        size: usize,
        _align: usize,
        _align_offset: usize,
        _committed: bool,
    ) {
        unsafe {
            libc::munmap(ptr.cast(), size);
        }
    }

    fn commit(&self, ptr: *mut u8, size: usize) -> Option<CommitInfo> {
        let rc = unsafe { libc::mprotect(ptr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
        (rc == 0).then_some(CommitInfo { zeroed: false })
    }

    fn decommit(&self, ptr: *mut u8, size: usize) -> bool {
        let rc = unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
        if rc != 0 {
            return false;
        }
        unsafe {
            libc::mprotect(ptr.cast(), size, libc::PROT_NONE);
        }
        true
    }

    fn reset(&self, ptr: *mut u8, size: usize) -> bool {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if unsafe { libc::madvise(ptr.cast(), size, libc::MADV_FREE) } == 0 {
                return true;
            }
        }
        unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) == 0 }
    }

    #[cfg(target_os = "linux")]
    fn alloc_huge_pages(&self, pages: usize, numa_node: i32, timeout_ms: u64) -> Option<HugeAlloc> {
        // carve contiguous address space first, then fault in 1 GiB pages
        // one at a time so a timeout can stop early with a partial region
        let total = pages.checked_mul(HUGE_PAGE_SIZE)?;
        let base = Self::mmap_aligned(total, HUGE_PAGE_SIZE, libc::PROT_NONE, MAP_NORESERVE)?;
        let start = Instant::now();
        let mut reserved = 0;

        while reserved < pages {
            let addr = (base as usize + reserved * HUGE_PAGE_SIZE) as *mut u8;
            let flags = libc::MAP_FIXED | libc::MAP_HUGETLB | libc::MAP_HUGE_1GB;
            let page = Self::mmap(
                addr,
                HUGE_PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
            );
            match page {
                Some(p) => {
                    if numa_node >= 0 {
                        Self::bind_to_node(p, HUGE_PAGE_SIZE, numa_node);
                    }
                    reserved += 1;
                }
                None => break,
            }
            if timeout_ms > 0 && start.elapsed().as_millis() as u64 >= timeout_ms {
                break;
            }
        }

        if reserved == 0 {
            unsafe {
                libc::munmap(base.cast(), total);
            }
            return None;
        }
        if reserved < pages {
            // give back the address space we will not fill
            let tail = (base as usize + reserved * HUGE_PAGE_SIZE) as *mut libc::c_void;
            unsafe {
                libc::munmap(tail, (pages - reserved) * HUGE_PAGE_SIZE);
            }
        }
        Some(HugeAlloc {
            ptr: base,
            pages: reserved,
            size: reserved * HUGE_PAGE_SIZE,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn alloc_huge_pages(
        &self,
        _pages: usize,
        _numa_node: i32,
        _timeout_ms: u64,
    ) -> Option<HugeAlloc> {
        None
    }

    fn free_huge_pages(&self, ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr.cast(), size);
        }
    }

    fn numa_node_count(&self) -> usize {
        static NODES: OnceLock<usize> = OnceLock::new();
        *NODES.get_or_init(detect_numa_nodes)
    }

    #[cfg(target_os = "linux")]
    fn current_numa_node(&self) -> i32 {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == 0 {
            node as i32
        } else {
            0
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn current_numa_node(&self) -> i32 {
        0
    }

    fn now_ms(&self) -> u64 {
        monotonic_epoch().elapsed().as_millis() as u64
    }
}
