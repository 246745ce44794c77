//! Error types for shmkit.

use thiserror::Error;

/// Result type alias using shmkit's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shmkit operations.
///
/// The variant is the contract: callers match on the kind, the payload
/// carries the offending value or the underlying OS error for diagnostics.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied value has the wrong shape: non-power-of-two size,
    /// misaligned offset, unknown page size, oversized description, or an
    /// offset that does not name a live allocation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The buddy system cannot satisfy an allocation request.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A ring buffer deadline elapsed without making progress.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A per-process singleton was initialized twice without an intervening
    /// uninitialize.
    #[error("already initialized: {0}")]
    AlreadyInitialized(&'static str),

    /// Group metadata already exists on the RAM disk.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No live object matches the given key, offset, or singleton.
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Capture the calling thread's errno as a `System` error.
    ///
    /// Used after raw `libc` calls that report failure through errno.
    pub(crate) fn last_os() -> Self {
        let raw = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Error::System(rustix::io::Errno::from_raw_os_error(raw))
    }
}
