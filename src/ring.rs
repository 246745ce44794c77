//! Lock-free ring buffer over a System-V shared memory segment.
//!
//! The segment starts with a 4 KiB header (immutable attributes plus the
//! `head`/`tail` cursors and two optional spinlocks, each on its own cache
//! line) followed by `capacity` fixed-size entry slots. Producers and
//! consumers in any process attach by key and busy-poll; there are no
//! syscalls on the data path.
//!
//! With a single producer and a single consumer the buffer is fully
//! lock-free: the payload copy is published by a release store of the
//! cursor and observed through an acquire load on the other side. The
//! `multiple_producer` / `multiple_consumer` attributes each arm one CAS
//! spinlock that serializes that side only; when an attribute is false the
//! corresponding lock is never touched.

use crate::error::{Error, Result};
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Maximum description length stored in the segment header, including the
/// NUL terminator.
pub const DESCRIPTION_LEN: usize = 256;

/// Huge-page encoding shifted into `shmget` flags, from
/// `asm-generic/hugetlb_encode.h`.
const SHM_HUGE_SHIFT: i32 = 26;
const SHM_HUGE_2MB: i32 = 21 << SHM_HUGE_SHIFT;
const SHM_HUGE_1GB: i32 = 30 << SHM_HUGE_SHIFT;

/// Page size backing a ring buffer segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageSize {
    /// Base 4 KiB pages.
    #[default]
    Default,
    /// 2 MiB huge pages.
    Huge2M,
    /// 1 GiB huge pages.
    Huge1G,
}

impl PageSize {
    /// Page size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            PageSize::Default => 1 << 12,
            PageSize::Huge2M => 1 << 21,
            PageSize::Huge1G => 1 << 30,
        }
    }

    fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            0x1000 => Some(PageSize::Default),
            0x20_0000 => Some(PageSize::Huge2M),
            0x4000_0000 => Some(PageSize::Huge1G),
            _ => None,
        }
    }

    /// Extra `shmget` flags selecting this page size.
    fn shm_flags(self) -> i32 {
        match self {
            PageSize::Default => 0,
            PageSize::Huge2M => libc::SHM_HUGETLB | SHM_HUGE_2MB,
            PageSize::Huge1G => libc::SHM_HUGETLB | SHM_HUGE_1GB,
        }
    }
}

/// Attributes of a ring buffer.
///
/// Immutable once the segment is created; [`RingBuffer::attribute`] reads
/// them back from the shared header.
#[derive(Debug, Clone)]
pub struct RingBufferAttr {
    /// System-V key. Zero requests a private segment; the key assigned by
    /// the kernel is returned from [`RingBuffer::create`].
    pub key: i32,
    /// Segment id, assigned at creation.
    pub id: i32,
    /// Page size backing the segment.
    pub page_size: PageSize,
    /// Number of entry slots. Non-zero power of two.
    pub capacity: u32,
    /// Size of one entry slot in bytes. Non-zero power of two.
    pub entry_size: u16,
    /// Arm the producer spinlock for concurrent producers.
    pub multiple_producer: bool,
    /// Arm the consumer spinlock for concurrent consumers.
    pub multiple_consumer: bool,
    /// Free-form description, at most 255 bytes.
    pub description: String,
}

impl Default for RingBufferAttr {
    fn default() -> Self {
        Self {
            key: 0,
            id: 0,
            page_size: PageSize::Default,
            capacity: 4096,
            entry_size: 64,
            multiple_producer: false,
            multiple_consumer: false,
            description: String::new(),
        }
    }
}

/// Attribute block as stored in the shared header.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawAttribute {
    key: i32,
    id: i32,
    page_size: u32,
    capacity: u32,
    entry_size: u16,
    multiple_producer: u8,
    multiple_consumer: u8,
    description: [u8; DESCRIPTION_LEN],
}

/// Shared segment header. Each mutable field sits on its own cache line;
/// the whole header is padded to one base page so the entry slots start
/// page aligned.
#[repr(C, align(4096))]
struct RingBufferHeader {
    attribute: RawAttribute,
    /// Consumer cursor, free-running.
    head: CachePadded<AtomicU32>,
    /// Producer cursor, free-running.
    tail: CachePadded<AtomicU32>,
    /// Producer serialization, armed only in multiple-producer mode.
    producer_lock: CachePadded<AtomicBool>,
    /// Consumer serialization, armed only in multiple-consumer mode.
    consumer_lock: CachePadded<AtomicBool>,
}

const _: () = assert!(std::mem::size_of::<RingBufferHeader>() == 4096);

/// Scoped CAS spinlock over a shared `AtomicBool` cell.
struct SpinGuard<'a> {
    cell: &'a AtomicBool,
}

impl<'a> SpinGuard<'a> {
    fn lock(cell: &'a AtomicBool) -> Self {
        while cell
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        Self { cell }
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.cell.store(false, Ordering::Release);
    }
}

/// Handle onto a ring buffer segment.
///
/// Obtained from [`RingBuffer::attach`]; dropping the handle detaches the
/// segment but leaves it alive for other processes.
pub struct RingBuffer {
    header: NonNull<RingBufferHeader>,
}

// SAFETY: the shared header is only mutated through atomics; payload slots
// are published by the release/acquire cursor protocol. Concurrent
// producers (or consumers) must arm the corresponding attribute, which
// serializes them through the header spinlock — the same contract every
// process attached to the segment follows.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a new ring buffer segment and return its key.
    ///
    /// The segment is created exclusively, pinned in memory, and its
    /// header initialized from `attr` with the kernel-assigned key and id
    /// filled in. The creating process does not stay attached.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a malformed attribute; `System` when the
    /// segment cannot be created, pinned, or mapped.
    pub fn create(attr: &RingBufferAttr) -> Result<i32> {
        if attr.entry_size == 0 || !attr.entry_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "entry size {} is not a non-zero power of two",
                attr.entry_size
            )));
        }
        if attr.capacity == 0 || !attr.capacity.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "capacity {} is not a non-zero power of two",
                attr.capacity
            )));
        }
        if attr.description.len() >= DESCRIPTION_LEN {
            return Err(Error::InvalidArgument(format!(
                "description of {} bytes exceeds the {} byte limit",
                attr.description.len(),
                DESCRIPTION_LEN - 1
            )));
        }

        let region_size = std::mem::size_of::<RingBufferHeader>()
            + attr.capacity as usize * attr.entry_size as usize;
        let shmflg = libc::IPC_CREAT | libc::IPC_EXCL | attr.page_size.shm_flags() | 0o600;

        let id = unsafe { libc::shmget(attr.key, region_size, shmflg) };
        if id == -1 {
            return Err(Error::last_os());
        }

        // From here on the segment exists; remove it again on any failure.
        let init = || -> Result<i32> {
            if unsafe { libc::shmctl(id, libc::SHM_LOCK, std::ptr::null_mut()) } == -1 {
                return Err(Error::last_os());
            }

            let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
            if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } == -1 {
                return Err(Error::last_os());
            }
            let assigned_key = ds.shm_perm.__key;

            let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
            if ptr as isize == -1 {
                return Err(Error::last_os());
            }

            let mut raw = RawAttribute {
                key: assigned_key,
                id,
                page_size: attr.page_size.bytes(),
                capacity: attr.capacity,
                entry_size: attr.entry_size,
                multiple_producer: attr.multiple_producer.into(),
                multiple_consumer: attr.multiple_consumer.into(),
                description: [0; DESCRIPTION_LEN],
            };
            raw.description[..attr.description.len()]
                .copy_from_slice(attr.description.as_bytes());

            unsafe {
                ptr.cast::<RingBufferHeader>().write(RingBufferHeader {
                    attribute: raw,
                    head: CachePadded::new(AtomicU32::new(0)),
                    tail: CachePadded::new(AtomicU32::new(0)),
                    producer_lock: CachePadded::new(AtomicBool::new(false)),
                    consumer_lock: CachePadded::new(AtomicBool::new(false)),
                });
            }

            if unsafe { libc::shmdt(ptr) } == -1 {
                return Err(Error::last_os());
            }
            Ok(assigned_key)
        };

        match init() {
            Ok(key) => {
                info!(
                    key,
                    id,
                    capacity = attr.capacity,
                    entry_size = attr.entry_size,
                    "ring buffer created"
                );
                Ok(key)
            }
            Err(e) => {
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
                Err(e)
            }
        }
    }

    /// Remove the segment identified by `key`.
    ///
    /// Attached processes are not detected; the caller is responsible for
    /// quiescing them first.
    pub fn delete(key: i32) -> Result<()> {
        let id = lookup(key)?;
        if unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            return Err(Error::last_os());
        }
        info!(key, id, "ring buffer deleted");
        Ok(())
    }

    /// Attach to the segment identified by `key`.
    pub fn attach(key: i32) -> Result<Self> {
        let id = lookup(key)?;
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(Error::last_os());
        }
        let header = NonNull::new(ptr.cast::<RingBufferHeader>())
            .ok_or_else(|| Error::InvalidArgument("shmat returned a null mapping".to_string()))?;
        debug!(key, id, "ring buffer attached");
        Ok(Self { header })
    }

    fn header(&self) -> &RingBufferHeader {
        unsafe { self.header.as_ref() }
    }

    /// Pointer to the slot a cursor value maps to.
    fn slot_ptr(&self, cursor: u32) -> *mut u8 {
        let attr = &self.header().attribute;
        let index = cursor & (attr.capacity - 1);
        unsafe {
            self.header
                .as_ptr()
                .cast::<u8>()
                .add(std::mem::size_of::<RingBufferHeader>())
                .add(index as usize * attr.entry_size as usize)
        }
    }

    /// The attributes the segment was created with.
    pub fn attribute(&self) -> RingBufferAttr {
        let raw = &self.header().attribute;
        let len = raw
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DESCRIPTION_LEN - 1);
        RingBufferAttr {
            key: raw.key,
            id: raw.id,
            page_size: PageSize::from_bytes(raw.page_size).unwrap_or_default(),
            capacity: raw.capacity,
            entry_size: raw.entry_size,
            multiple_producer: raw.multiple_producer != 0,
            multiple_consumer: raw.multiple_consumer != 0,
            description: String::from_utf8_lossy(&raw.description[..len]).into_owned(),
        }
    }

    /// Number of entries currently queued.
    ///
    /// Best-effort: concurrent producers and consumers may move the
    /// cursors while this reads them.
    pub fn len(&self) -> u32 {
        let h = self.header();
        let head = h.head.load(Ordering::Acquire);
        let tail = h.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & (h.attribute.capacity - 1)
    }

    /// Whether the buffer currently holds no entries. Best-effort, like
    /// [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `payload` into the next free slot.
    ///
    /// Busy-polls until a slot frees up or `timeout` elapses; a zero
    /// timeout attempts exactly once. In multiple-producer mode the
    /// producer spinlock is held for the duration of the call.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `payload` is empty or larger than the entry
    /// size; `Timeout` when the deadline passes with the buffer full.
    pub fn produce(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        let h = self.header();
        let attr = &h.attribute;
        if payload.is_empty() || payload.len() > attr.entry_size as usize {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes does not fit an entry of {} bytes",
                payload.len(),
                attr.entry_size
            )));
        }

        let _serialize = (attr.multiple_producer != 0).then(|| SpinGuard::lock(&h.producer_lock));

        let deadline = Instant::now() + timeout;
        let mask = attr.capacity - 1;
        loop {
            let head = h.head.load(Ordering::Acquire);
            let tail = h.tail.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) & mask == mask {
                // Full: one slot stays open to tell full from empty.
                if Instant::now() >= deadline {
                    return Err(Error::Timeout("ring buffer produce"));
                }
                std::hint::spin_loop();
                continue;
            }

            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), self.slot_ptr(tail), payload.len());
            }
            // Publish the payload to consumers.
            h.tail.store(tail.wrapping_add(1), Ordering::Release);
            return Ok(());
        }
    }

    /// Copy the oldest entry into `buf` and free its slot.
    ///
    /// `buf.len()` bytes are copied out of the slot. Busy-polls until an
    /// entry arrives or `timeout` elapses; a zero timeout attempts exactly
    /// once. In multiple-consumer mode the consumer spinlock is held for
    /// the duration of the call.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `buf` is empty or larger than the entry
    /// size; `Timeout` when the deadline passes with the buffer empty.
    pub fn consume(&self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let h = self.header();
        let attr = &h.attribute;
        if buf.is_empty() || buf.len() > attr.entry_size as usize {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes does not match an entry of {} bytes",
                buf.len(),
                attr.entry_size
            )));
        }

        let _serialize = (attr.multiple_consumer != 0).then(|| SpinGuard::lock(&h.consumer_lock));

        let deadline = Instant::now() + timeout;
        let mask = attr.capacity - 1;
        loop {
            let head = h.head.load(Ordering::Relaxed);
            // Acquire pairs with the producer's release: the payload write
            // happens-before any read below.
            let tail = h.tail.load(Ordering::Acquire);
            if tail.wrapping_sub(head) & mask == 0 {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout("ring buffer consume"));
                }
                std::hint::spin_loop();
                continue;
            }

            unsafe {
                std::ptr::copy_nonoverlapping(self.slot_ptr(head), buf.as_mut_ptr(), buf.len());
            }
            h.head.store(head.wrapping_add(1), Ordering::Release);
            return Ok(());
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.header.as_ptr().cast());
        }
    }
}

/// Resolve a key to a live segment id.
fn lookup(key: i32) -> Result<i32> {
    let id = unsafe { libc::shmget(key, 0, 0) };
    if id == -1 {
        let err = std::io::Error::last_os_error();
        return if err.raw_os_error() == Some(libc::ENOENT) {
            Err(Error::NotFound(format!("ring buffer key {key:#x}")))
        } else {
            Err(Error::last_os())
        };
    }
    Ok(id)
}
