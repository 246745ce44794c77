//! Virtual address window shared by the processes of a group.
//!
//! Every member of a group reserves pool ranges out of the same 16 TiB
//! window of virtual addresses. Which ranges are taken is recorded in a
//! [`BuddyTree`] whose state array is a file mapping of the group's
//! `buddies` file, so all members see one tree.
//!
//! Mutations follow a two-level locking discipline: a process-local mutex
//! serializes the threads of this process, and an advisory `flock` on the
//! mapped file serializes across processes. `allocate` and `free` take the
//! file lock exclusively; `query` takes it shared so concurrent readers in
//! different processes proceed in parallel.

use crate::buddy::BuddyTree;
use crate::error::{Error, Result};
use crate::group;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{FlockOperation, Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// First virtual address of the reserved window.
pub const VA_START: u64 = 0x2000_0000_0000;

/// Size of the reserved window: 16 TiB.
pub const VA_SIZE: u64 = 1 << VA_SIZE_EXP;

/// Smallest pool that can be carved out of the window: 4 GiB.
pub const MIN_POOL_SIZE: u64 = 1 << MIN_POOL_EXP;

const VA_SIZE_EXP: u32 = 44;
const MIN_POOL_EXP: u32 = 32;

/// The process-wide window singleton.
static SINGLETON: Mutex<Option<Arc<VirtualAddressWindow>>> = Mutex::new(None);

/// Handle onto the group's shared virtual address window.
///
/// Obtained from [`VirtualAddressWindow::initialize`] /
/// [`VirtualAddressWindow::current`]; there is at most one per process.
/// The window only reserves address ranges — mapping memory into them is
/// the pool's concern.
pub struct VirtualAddressWindow {
    /// Group this window belongs to.
    group: String,
    /// Open descriptor of the mapped `buddies` file; also the flock target.
    fd: OwnedFd,
    /// The shared mapping of the buddy-tree state.
    map_ptr: NonNull<u8>,
    map_len: usize,
    /// Buddy tree over the mapping, behind the process-local mutex.
    tree: Mutex<BuddyTree>,
}

// SAFETY: the mapping is shared memory owned by this value for its whole
// lifetime; all tree access goes through the interior mutex, and the raw
// pointer is only dereferenced by the tree.
unsafe impl Send for VirtualAddressWindow {}
unsafe impl Sync for VirtualAddressWindow {}

impl VirtualAddressWindow {
    /// Map the group's `buddies` file and wrap it in a buddy tree.
    fn open(group: &str, init: bool) -> Result<Self> {
        let path = group::buddies_path(group)?;
        let tree_size = BuddyTree::calc_tree_size(VA_SIZE, MIN_POOL_SIZE) as usize;

        let fd = rustix::fs::open(&path, OFlags::RDWR, Mode::empty())?;
        let stat = rustix::fs::fstat(&fd)?;
        if (stat.st_size as u64) < tree_size as u64 {
            return Err(Error::InvalidArgument(format!(
                "buddy state file {} holds {} bytes, expected at least {tree_size}",
                path.display(),
                stat.st_size
            )));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                tree_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let map_ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidArgument("mmap returned null".to_string()))?;

        let tree = unsafe {
            BuddyTree::from_raw(VA_SIZE_EXP, MIN_POOL_EXP, init, map_ptr.cast::<i64>())
        };
        let tree = match tree {
            Ok(tree) => tree,
            Err(e) => {
                unsafe {
                    let _ = rustix::mm::munmap(map_ptr.as_ptr().cast(), tree_size);
                }
                return Err(e);
            }
        };

        debug!(group, init, "mapped buddy state file");
        Ok(Self {
            group: group.to_string(),
            fd,
            map_ptr,
            map_len: tree_size,
            tree: Mutex::new(tree),
        })
    }

    /// Create the on-disk metadata of a new group.
    ///
    /// Creates the group directory and a zero-initialized `buddies` file of
    /// the full tree size, then stamps the initial root state through a
    /// throwaway window.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the group directory is already present.
    pub fn create(group: &str) -> Result<()> {
        let dir = group::group_dir(group)?;
        std::fs::create_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::AlreadyExists(group.to_string())
            } else {
                Error::Io(e)
            }
        })?;

        // Roll the directory back if the state file cannot be set up.
        let populate = || -> Result<()> {
            let path = group::buddies_path(group)?;
            let fd = rustix::fs::open(
                &path,
                OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
                Mode::from_raw_mode(0o644),
            )?;
            rustix::fs::ftruncate(&fd, BuddyTree::calc_tree_size(VA_SIZE, MIN_POOL_SIZE))?;
            drop(fd);

            // Stamp the root state, then drop the throwaway mapping.
            Self::open(group, true)?;
            Ok(())
        };
        if let Err(e) = populate() {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }
        info!(group, "created shared memory group");
        Ok(())
    }

    /// Remove the on-disk metadata of a group.
    ///
    /// Tears down the whole group directory. The caller is responsible for
    /// making sure no process still uses the group.
    pub fn remove(group: &str) -> Result<()> {
        let dir = group::group_dir(group)?;
        std::fs::remove_dir_all(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(group.to_string())
            } else {
                Error::Io(e)
            }
        })?;
        info!(group, "removed shared memory group");
        Ok(())
    }

    /// Initialize this process as a member of `group`.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` when the process already holds a window.
    pub fn initialize(group: &str) -> Result<()> {
        let mut slot = SINGLETON.lock().unwrap();
        if slot.is_some() {
            return Err(Error::AlreadyInitialized("virtual address window"));
        }
        let window = Self::open(group, false)?;
        info!(group, "virtual address window initialized");
        *slot = Some(Arc::new(window));
        Ok(())
    }

    /// The window of the current process.
    ///
    /// # Errors
    ///
    /// `NotFound` before [`initialize`](Self::initialize) or after
    /// [`uninitialize`](Self::uninitialize).
    pub fn current() -> Result<Arc<Self>> {
        SINGLETON
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::NotFound("virtual address window".to_string()))
    }

    /// Drop the process's window singleton.
    ///
    /// Outstanding [`current`](Self::current) handles keep the mapping
    /// alive until they are dropped; the singleton slot is cleared either
    /// way.
    pub fn uninitialize() {
        let window = SINGLETON.lock().unwrap().take();
        if let Some(window) = window {
            debug!(group = %window.group, "virtual address window uninitialized");
        }
    }

    /// Group this window belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Window capacity in bytes.
    pub fn capacity(&self) -> u64 {
        VA_SIZE
    }

    /// Smallest pool size in bytes.
    pub fn unit_size(&self) -> u64 {
        MIN_POOL_SIZE
    }

    /// Reserve a pool range of `pool_size` bytes.
    ///
    /// `pool_size` must be a power of two in `[MIN_POOL_SIZE, VA_SIZE]`.
    /// Returns the offset of the range within the window.
    pub fn allocate(&self, pool_size: u64) -> Result<u64> {
        if !pool_size.is_power_of_two()
            || pool_size < MIN_POOL_SIZE
            || pool_size > VA_SIZE
        {
            return Err(Error::InvalidArgument(format!(
                "pool size {pool_size} is not a power of two in [{MIN_POOL_SIZE}, {VA_SIZE}]"
            )));
        }

        let mut tree = self.tree.lock().unwrap();
        let lock = FileLockGuard::exclusive(self.fd.as_fd())?;
        let offset = tree.allocate(pool_size)?;
        lock.unlock()?;

        debug!(group = %self.group, offset, pool_size, "reserved pool range");
        Ok(offset)
    }

    /// Return a pool range to the window.
    ///
    /// `pool_offset` must be the exact start of a live reservation.
    pub fn free(&self, pool_offset: u64) -> Result<()> {
        if pool_offset % MIN_POOL_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "pool offset {pool_offset} is not a multiple of {MIN_POOL_SIZE}"
            )));
        }
        if pool_offset >= VA_SIZE {
            return Err(Error::InvalidArgument(format!(
                "pool offset {pool_offset} is beyond the window capacity {VA_SIZE}"
            )));
        }

        let mut tree = self.tree.lock().unwrap();
        let lock = FileLockGuard::exclusive(self.fd.as_fd())?;
        tree.free(pool_offset)?;
        lock.unlock()?;

        debug!(group = %self.group, offset = pool_offset, "released pool range");
        Ok(())
    }

    /// Find the pool reservation containing `va_offset`.
    ///
    /// Returns the reservation's starting offset and size. Runs under a
    /// shared file lock, so queries from different processes proceed in
    /// parallel.
    pub fn query(&self, va_offset: u64) -> Result<(u64, u64)> {
        let tree = self.tree.lock().unwrap();
        let lock = FileLockGuard::shared(self.fd.as_fd())?;
        let found = tree.query(va_offset)?;
        lock.unlock()?;
        Ok(found)
    }
}

impl Drop for VirtualAddressWindow {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.map_ptr.as_ptr().cast(), self.map_len);
        }
        // fd closes when OwnedFd drops.
    }
}

/// Scoped advisory file lock.
///
/// Locks on construction and unlocks on every exit path. The success path
/// should consume the guard through [`unlock`](Self::unlock) so that an
/// unlock failure is reported instead of swallowed; when the guard is
/// dropped by an early error return, the unlock is best-effort and the
/// original error propagates unmasked.
struct FileLockGuard<'fd> {
    fd: BorrowedFd<'fd>,
    armed: bool,
}

impl<'fd> FileLockGuard<'fd> {
    /// Take the exclusive lock, blocking until it is granted.
    fn exclusive(fd: BorrowedFd<'fd>) -> Result<Self> {
        rustix::fs::flock(fd, FlockOperation::LockExclusive)?;
        Ok(Self { fd, armed: true })
    }

    /// Take the shared lock, blocking until it is granted.
    fn shared(fd: BorrowedFd<'fd>) -> Result<Self> {
        rustix::fs::flock(fd, FlockOperation::LockShared)?;
        Ok(Self { fd, armed: true })
    }

    /// Release the lock, surfacing any unlock error.
    fn unlock(mut self) -> Result<()> {
        self.armed = false;
        rustix::fs::flock(self.fd, FlockOperation::Unlock)?;
        Ok(())
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = rustix::fs::flock(self.fd, FlockOperation::Unlock);
        }
    }
}
