//! # shmkit
//!
//! Shared-memory IPC primitives for POSIX hosts.
//!
//! shmkit provides two composable building blocks for processes that
//! communicate through memory instead of sockets:
//!
//! - A lock-free **ring buffer** of fixed-size entries in a System-V
//!   shared memory segment, with optional huge-page backing and optional
//!   multi-producer / multi-consumer serialization.
//! - A **shared memory pool allocator**: cooperating processes of a named
//!   *group* share a reserved 16 TiB virtual address window, carved up by
//!   a buddy system whose state persists in a RAM-disk file. Each pool
//!   binds to an external arena allocator through extent hooks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmkit::prelude::*;
//! use std::time::Duration;
//!
//! // Ring buffer: create once, attach from any process.
//! let key = RingBuffer::create(&RingBufferAttr {
//!     capacity: 4096,
//!     entry_size: 64,
//!     ..Default::default()
//! })?;
//! let rb = RingBuffer::attach(key)?;
//! rb.produce(b"hello", Duration::from_millis(10))?;
//!
//! // Pool allocator: one process creates the group, every member joins.
//! VirtualAddressWindow::create("demo")?;
//! VirtualAddressWindow::initialize("demo")?;
//! let pool = ShmPool::create(shmkit::vaw::MIN_POOL_SIZE)?;
//! println!("pool at {:#x}", pool.vaddr());
//! ```
//!
//! Linux-only: the crate relies on System-V shared memory, `/dev/shm`,
//! and advisory file locks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buddy;
pub mod error;
pub mod group;
pub mod pool;
pub mod ring;
pub mod timing;
pub mod vaw;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buddy::BuddyTree;
    pub use crate::error::{Error, Result};
    pub use crate::pool::{ArenaAllocator, ExtentHooks, ShmPool};
    pub use crate::ring::{PageSize, RingBuffer, RingBufferAttr};
    pub use crate::vaw::VirtualAddressWindow;
}

pub use error::{Error, Result};
