//! Shared memory pools carved out of the virtual address window.
//!
//! A pool is a power-of-two subrange of the group's address window, backed
//! by one sparse file on the RAM disk. The creating process maps the file
//! at the window's fixed address with no access rights — a reservation —
//! and an external arena allocator commits and releases ranges inside it
//! through the [`ExtentHooks`] capability the pool implements.
//!
//! The allocator itself stays outside this crate: anything implementing
//! [`ArenaAllocator`] can be bound to a pool, after which
//! [`ShmPool::malloc`] and [`ShmPool::free`] forward to it. Each pool owns
//! exactly one arena index and releases it on destruction.

use crate::error::{Error, Result};
use crate::group;
use crate::vaw::{VirtualAddressWindow, VA_START};
use rustix::fd::OwnedFd;
use rustix::fs::{FallocateFlags, Mode, OFlags};
use rustix::mm::{Advice, MapFlags, MprotectFlags, ProtFlags};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Granularity of extent accounting inside a pool: 2 MiB.
pub const CHUNK_SIZE: u64 = 0x20_0000;

/// Base page size used for commit/decommit alignment checks.
const PAGE_SIZE: u64 = 4096;

/// Extent management callbacks a pool offers to an arena allocator.
///
/// Addresses are absolute virtual addresses inside the pool's reserved
/// subrange. Every call carries the pool context through `self`; no global
/// state is involved.
pub trait ExtentHooks: Send + Sync {
    /// Back `[new_addr, new_addr + size)` with shared memory.
    ///
    /// With `new_addr` set, exactly that range is backed (refused when it
    /// is taken, misaligned, or leaves the pool). Without it, the pool
    /// picks a free range honoring `alignment`. Returns the address of the
    /// backed range, which is zero-filled on first touch.
    fn alloc(&self, new_addr: Option<u64>, size: u64, alignment: u64) -> Result<u64>;

    /// Release the backing of `[addr, addr + size)`.
    ///
    /// The address range stays reserved inside the pool and can be handed
    /// out by a later [`alloc`](Self::alloc).
    fn dalloc(&self, addr: u64, size: u64) -> Result<()>;

    /// Permanently release backing. Best-effort; used on arena teardown.
    fn destroy(&self, addr: u64, size: u64);

    /// Make `[addr, addr + size)` accessible without changing ownership.
    fn commit(&self, addr: u64, size: u64) -> Result<()>;

    /// Drop the backing pages of `[addr, addr + size)` while keeping the
    /// range reserved.
    fn decommit(&self, addr: u64, size: u64) -> Result<()>;

    /// Hint the OS that the pages in the range are no longer needed.
    fn purge_lazy(&self, addr: u64, size: u64) -> Result<()>;

    /// Force the pages in the range to be dropped.
    fn purge_forced(&self, addr: u64, size: u64) -> Result<()>;

    /// Split one backed region into two. Always safe inside one pool —
    /// both halves keep the same backing file.
    fn split(&self, addr: u64, size: u64, size_a: u64, size_b: u64) -> Result<()>;

    /// Merge two adjacent backed regions. Allowed iff they are contiguous
    /// and share this pool's backing.
    fn merge(&self, addr_a: u64, size_a: u64, addr_b: u64, size_b: u64) -> Result<()>;
}

/// An external arena-based allocator the pool binds to.
///
/// The allocator is a black box: it receives the pool's [`ExtentHooks`]
/// when an arena is created and is expected to route all backing requests
/// for that arena through them.
pub trait ArenaAllocator: Send + Sync {
    /// Create an arena wired to the given extent hooks; returns its index.
    fn create_arena(&self, hooks: Arc<dyn ExtentHooks>) -> Result<u32>;

    /// Tear down an arena and release its index.
    fn destroy_arena(&self, arena: u32) -> Result<()>;

    /// Allocate `size` bytes from an arena.
    fn malloc(&self, arena: u32, size: usize) -> Result<NonNull<u8>>;

    /// Return memory obtained from [`malloc`](Self::malloc).
    fn free(&self, arena: u32, ptr: NonNull<u8>) -> Result<()>;
}

/// Chunk-granular occupancy map of a pool's reserved range.
struct ChunkMap {
    words: Vec<u64>,
    nchunks: usize,
}

impl ChunkMap {
    fn new(nchunks: usize) -> Self {
        Self {
            words: vec![0; nchunks.div_ceil(64)],
            nchunks,
        }
    }

    fn is_used(&self, idx: usize) -> bool {
        (self.words[idx / 64] >> (idx % 64)) & 1 != 0
    }

    fn run_is_free(&self, start: usize, n: usize) -> bool {
        (start..start + n).all(|i| !self.is_used(i))
    }

    fn set_run(&mut self, start: usize, n: usize, used: bool) {
        for i in start..start + n {
            if used {
                self.words[i / 64] |= 1 << (i % 64);
            } else {
                self.words[i / 64] &= !(1 << (i % 64));
            }
        }
    }

    /// First-fit search for `n` free chunks starting at a multiple of
    /// `align` chunks.
    fn find_free_run(&self, n: usize, align: usize) -> Option<usize> {
        let mut start = 0;
        while start + n <= self.nchunks {
            match (start..start + n).find(|&i| self.is_used(i)) {
                None => return Some(start),
                Some(used) => {
                    // Jump past the used chunk to the next aligned start.
                    start = (used + 1).div_ceil(align) * align;
                }
            }
        }
        None
    }
}

/// Pool state shared between the handle and the hooks it hands out.
struct PoolShared {
    /// Group owning the pool.
    group: String,
    /// Offset of the pool inside the window.
    offset: u64,
    /// Pool size in bytes. Power of two.
    capacity: u64,
    /// Absolute starting address: `VA_START + offset`.
    base: u64,
    /// Backing file on the RAM disk.
    fd: OwnedFd,
    path: PathBuf,
    /// Occupancy of the reserved range, in chunks.
    chunks: Mutex<ChunkMap>,
}

impl PoolShared {
    /// Check `[addr, addr + size)` against the pool bounds.
    fn bounds(&self, addr: u64, size: u64) -> Result<()> {
        if size == 0
            || addr < self.base
            || addr.checked_add(size).is_none()
            || addr + size > self.base + self.capacity
        {
            return Err(Error::InvalidArgument(format!(
                "range [{addr:#x}, +{size:#x}) leaves pool [{:#x}, +{:#x})",
                self.base, self.capacity
            )));
        }
        Ok(())
    }

    /// Check bounds plus page alignment (commit/decommit/purge paths).
    fn page_range(&self, addr: u64, size: u64) -> Result<()> {
        self.bounds(addr, size)?;
        if addr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "range [{addr:#x}, +{size:#x}) is not page aligned"
            )));
        }
        Ok(())
    }

    fn protect(&self, addr: u64, size: u64, flags: MprotectFlags) -> Result<()> {
        unsafe { rustix::mm::mprotect(addr as *mut _, size as usize, flags)? };
        Ok(())
    }

    /// Punch a hole in the backing file under `[addr, addr + size)`.
    fn punch(&self, addr: u64, size: u64) -> Result<()> {
        rustix::fs::fallocate(
            &self.fd,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            addr - self.base,
            size,
        )?;
        Ok(())
    }
}

impl ExtentHooks for PoolShared {
    fn alloc(&self, new_addr: Option<u64>, size: u64, alignment: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized extent".to_string()));
        }
        let align = alignment.max(CHUNK_SIZE);
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "extent alignment {alignment} is not a power of two"
            )));
        }

        let nchunks = size.div_ceil(CHUNK_SIZE) as usize;
        let mut chunks = self.chunks.lock().unwrap();

        let start = match new_addr {
            Some(addr) => {
                self.bounds(addr, size)?;
                if addr % align != 0 || (addr - self.base) % CHUNK_SIZE != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "extent address {addr:#x} is not aligned to {align:#x}"
                    )));
                }
                let start = ((addr - self.base) / CHUNK_SIZE) as usize;
                if !chunks.run_is_free(start, nchunks) {
                    return Err(Error::InvalidArgument(format!(
                        "extent at {addr:#x} overlaps a live extent"
                    )));
                }
                start
            }
            None => {
                let align_chunks = (align / CHUNK_SIZE) as usize;
                chunks.find_free_run(nchunks, align_chunks).ok_or_else(|| {
                    Error::OutOfMemory(format!(
                        "pool at {:#x} has no free extent of {size} bytes",
                        self.base
                    ))
                })?
            }
        };

        let addr = self.base + start as u64 * CHUNK_SIZE;
        let len = nchunks as u64 * CHUNK_SIZE;
        self.protect(addr, len, MprotectFlags::READ | MprotectFlags::WRITE)?;
        chunks.set_run(start, nchunks, true);

        debug!(addr, size, alignment, "extent backed");
        Ok(addr)
    }

    fn dalloc(&self, addr: u64, size: u64) -> Result<()> {
        self.bounds(addr, size)?;
        if (addr - self.base) % CHUNK_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "extent address {addr:#x} is not chunk aligned"
            )));
        }
        let start = ((addr - self.base) / CHUNK_SIZE) as usize;
        let nchunks = size.div_ceil(CHUNK_SIZE) as usize;
        let len = nchunks as u64 * CHUNK_SIZE;

        let mut chunks = self.chunks.lock().unwrap();
        self.protect(addr, len, MprotectFlags::empty())?;
        self.punch(addr, len)?;
        chunks.set_run(start, nchunks, false);

        debug!(addr, size, "extent released");
        Ok(())
    }

    fn destroy(&self, addr: u64, size: u64) {
        if let Err(e) = self.dalloc(addr, size) {
            warn!(addr, size, error = %e, "extent destroy failed");
        }
    }

    fn commit(&self, addr: u64, size: u64) -> Result<()> {
        self.page_range(addr, size)?;
        self.protect(addr, size, MprotectFlags::READ | MprotectFlags::WRITE)
    }

    fn decommit(&self, addr: u64, size: u64) -> Result<()> {
        self.page_range(addr, size)?;
        self.protect(addr, size, MprotectFlags::empty())?;
        self.punch(addr, size)
    }

    fn purge_lazy(&self, addr: u64, size: u64) -> Result<()> {
        self.page_range(addr, size)?;
        unsafe {
            rustix::mm::madvise(addr as *mut _, size as usize, Advice::LinuxDontNeed)?;
        }
        Ok(())
    }

    fn purge_forced(&self, addr: u64, size: u64) -> Result<()> {
        self.page_range(addr, size)?;
        self.punch(addr, size)
    }

    fn split(&self, addr: u64, size: u64, size_a: u64, size_b: u64) -> Result<()> {
        self.bounds(addr, size)?;
        if size_a + size_b != size {
            return Err(Error::InvalidArgument(format!(
                "split sizes {size_a} + {size_b} do not cover {size}"
            )));
        }
        // Both halves keep the same backing file.
        Ok(())
    }

    fn merge(&self, addr_a: u64, size_a: u64, addr_b: u64, size_b: u64) -> Result<()> {
        self.bounds(addr_a, size_a)?;
        self.bounds(addr_b, size_b)?;
        if addr_a + size_a != addr_b {
            return Err(Error::InvalidArgument(format!(
                "extents [{addr_a:#x}, +{size_a:#x}) and [{addr_b:#x}, +{size_b:#x}) are not adjacent"
            )));
        }
        // Same pool, same backing file: merging is a bookkeeping no-op.
        Ok(())
    }
}

/// A shared memory pool owned by the creating process.
///
/// Dropping the pool releases its arena index, unmaps the reservation,
/// deletes the backing file, and returns the address range to the window.
pub struct ShmPool {
    shared: Arc<PoolShared>,
    vaw: Arc<VirtualAddressWindow>,
    arena: Option<(Arc<dyn ArenaAllocator>, u32)>,
}

impl ShmPool {
    /// Create a pool of `capacity` bytes inside the current window.
    ///
    /// `capacity` must be a power of two in `[MIN_POOL_SIZE, VA_SIZE]`.
    /// The window must have been initialized in this process.
    pub fn create(capacity: u64) -> Result<Self> {
        let vaw = VirtualAddressWindow::current()?;
        let offset = vaw.allocate(capacity)?;

        match Self::map_backing(&vaw, offset, capacity) {
            Ok(shared) => Ok(Self {
                shared: Arc::new(shared),
                vaw,
                arena: None,
            }),
            Err(e) => {
                if let Err(free_err) = vaw.free(offset) {
                    warn!(offset, error = %free_err, "failed to roll back pool reservation");
                }
                Err(e)
            }
        }
    }

    /// Create the backing file and the fixed-address reservation mapping.
    fn map_backing(
        vaw: &VirtualAddressWindow,
        offset: u64,
        capacity: u64,
    ) -> Result<PoolShared> {
        let path = group::pool_path(vaw.group(), offset)?;
        let fd = rustix::fs::open(
            &path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
            Mode::from_raw_mode(0o600),
        )?;
        if let Err(e) = rustix::fs::ftruncate(&fd, capacity) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        let base = VA_START + offset;
        let mapped = unsafe {
            rustix::mm::mmap(
                base as *mut _,
                capacity as usize,
                ProtFlags::empty(),
                MapFlags::SHARED | MapFlags::FIXED_NOREPLACE,
                &fd,
                0,
            )
        };
        if let Err(e) = mapped {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        debug!(
            group = vaw.group(),
            offset, capacity, base, "pool reservation mapped"
        );
        Ok(PoolShared {
            group: vaw.group().to_string(),
            offset,
            capacity,
            base,
            fd,
            path,
            chunks: Mutex::new(ChunkMap::new((capacity / CHUNK_SIZE) as usize)),
        })
    }

    /// Pool size in bytes.
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Offset of the pool inside the window.
    pub fn offset(&self) -> u64 {
        self.shared.offset
    }

    /// Starting virtual address of the pool: `VA_START + offset`.
    pub fn vaddr(&self) -> u64 {
        self.shared.base
    }

    /// Group this pool belongs to.
    pub fn group(&self) -> &str {
        &self.shared.group
    }

    /// The extent-hook capability of this pool.
    ///
    /// Hand this to an arena allocator so it can back address ranges
    /// inside the pool.
    pub fn extents(&self) -> Arc<dyn ExtentHooks> {
        Arc::clone(&self.shared) as Arc<dyn ExtentHooks>
    }

    /// Bind an arena allocator to this pool.
    ///
    /// Creates one arena wired to the pool's extent hooks. A pool holds at
    /// most one arena at a time.
    pub fn bind_allocator(&mut self, allocator: Arc<dyn ArenaAllocator>) -> Result<()> {
        if self.arena.is_some() {
            return Err(Error::AlreadyInitialized("pool arena"));
        }
        let arena = allocator.create_arena(self.extents())?;
        debug!(offset = self.shared.offset, arena, "arena bound to pool");
        self.arena = Some((allocator, arena));
        Ok(())
    }

    /// Allocate from the bound arena.
    ///
    /// # Errors
    ///
    /// `NotFound` when no allocator is bound.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        let (allocator, arena) = self
            .arena
            .as_ref()
            .ok_or_else(|| Error::NotFound("no arena bound to pool".to_string()))?;
        allocator.malloc(*arena, size)
    }

    /// Return memory to the bound arena.
    ///
    /// # Errors
    ///
    /// `NotFound` when no allocator is bound.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let (allocator, arena) = self
            .arena
            .as_ref()
            .ok_or_else(|| Error::NotFound("no arena bound to pool".to_string()))?;
        allocator.free(*arena, ptr)
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        if let Some((allocator, arena)) = self.arena.take() {
            if let Err(e) = allocator.destroy_arena(arena) {
                warn!(arena, error = %e, "failed to destroy pool arena");
            }
        }
        unsafe {
            let _ = rustix::mm::munmap(
                self.shared.base as *mut _,
                self.shared.capacity as usize,
            );
        }
        let _ = std::fs::remove_file(&self.shared.path);
        if let Err(e) = self.vaw.free(self.shared.offset) {
            warn!(offset = self.shared.offset, error = %e, "failed to release pool range");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_map_first_fit() {
        let mut map = ChunkMap::new(16);
        assert_eq!(map.find_free_run(4, 1), Some(0));
        map.set_run(0, 4, true);
        assert_eq!(map.find_free_run(4, 1), Some(4));
        // Aligned search skips the occupied prefix.
        map.set_run(4, 1, true);
        assert_eq!(map.find_free_run(4, 4), Some(8));
        map.set_run(0, 5, false);
        assert_eq!(map.find_free_run(16, 1), Some(0));
        assert_eq!(map.find_free_run(17, 1), None);
    }

    #[test]
    fn test_chunk_map_release_reuse() {
        let mut map = ChunkMap::new(8);
        map.set_run(0, 8, true);
        assert_eq!(map.find_free_run(1, 1), None);
        map.set_run(2, 2, false);
        assert_eq!(map.find_free_run(2, 1), Some(2));
        assert!(map.run_is_free(2, 2));
        assert!(!map.run_is_free(0, 3));
    }
}
