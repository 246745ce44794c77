//! In-memory timing event collector.
//!
//! A fixed-capacity circular store of `{tag, user1, user2, timestamp}`
//! records behind a CAS spinlock, for stamping latency-sensitive code
//! paths without syscalls or allocation on the hot path. Independent of
//! the IPC core: records live in private memory and the collector has its
//! own (much simpler) locking.
//!
//! A process-wide collector is available through the free functions
//! [`punch`], [`save`], and [`clear`].

use crate::error::Result;
use std::cell::UnsafeCell;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Default capacity of the process-wide collector, in records.
pub const DEFAULT_CAPACITY: usize = 1 << 20;

/// One timing record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingRecord {
    /// Event tag (event identifier).
    pub tag: u64,
    /// First user datum.
    pub user1: u64,
    /// Second user datum.
    pub user2: u64,
    /// Monotonic timestamp in nanoseconds since the collector was built.
    pub timestamp_ns: u64,
}

struct Inner {
    records: Box<[TimingRecord]>,
    /// Next write position.
    position: usize,
    /// Number of live records, saturating at capacity.
    count: usize,
}

/// Fixed-capacity circular store of timing records.
pub struct TimingLog {
    lock: AtomicBool,
    inner: UnsafeCell<Inner>,
    epoch: Instant,
}

// SAFETY: all access to `inner` goes through the spinlock.
unsafe impl Sync for TimingLog {}
unsafe impl Send for TimingLog {}

impl TimingLog {
    /// Create a collector holding up to `capacity` records; the oldest
    /// records are overwritten once it is full.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lock: AtomicBool::new(false),
            inner: UnsafeCell::new(Inner {
                records: vec![TimingRecord::default(); capacity.max(1)].into_boxed_slice(),
                position: 0,
                count: 0,
            }),
            epoch: Instant::now(),
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        // SAFETY: the spinlock grants exclusive access to `inner`.
        let result = f(unsafe { &mut *self.inner.get() });
        self.lock.store(false, Ordering::Release);
        result
    }

    /// Record one event.
    pub fn punch(&self, tag: u64, user1: u64, user2: u64) {
        let timestamp_ns = self.epoch.elapsed().as_nanos() as u64;
        self.locked(|inner| {
            let capacity = inner.records.len();
            inner.records[inner.position] = TimingRecord {
                tag,
                user1,
                user2,
                timestamp_ns,
            };
            inner.position = (inner.position + 1) % capacity;
            inner.count = (inner.count + 1).min(capacity);
        });
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.locked(|inner| inner.count)
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the records, oldest first.
    pub fn snapshot(&self) -> Vec<TimingRecord> {
        self.locked(|inner| {
            let capacity = inner.records.len();
            let start = (inner.position + capacity - inner.count) % capacity;
            (0..inner.count)
                .map(|i| inner.records[(start + i) % capacity])
                .collect()
        })
    }

    /// Write the records to `path`, oldest first, then clear the store.
    ///
    /// The format is one record per line (`tag user1 user2 timestamp_ns`)
    /// after two `#` comment lines.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let records = self.snapshot();
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(out, "# number of entries:{}", records.len())?;
        writeln!(out, "# tag u1 u2 tsns")?;
        for r in &records {
            writeln!(out, "{} {} {} {}", r.tag, r.user1, r.user2, r.timestamp_ns)?;
        }
        out.flush()?;
        self.clear();
        Ok(())
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.locked(|inner| {
            inner.position = 0;
            inner.count = 0;
        });
    }
}

static GLOBAL: OnceLock<TimingLog> = OnceLock::new();

fn global() -> &'static TimingLog {
    GLOBAL.get_or_init(|| TimingLog::with_capacity(DEFAULT_CAPACITY))
}

/// Record one event in the process-wide collector.
pub fn punch(tag: u64, user1: u64, user2: u64) {
    global().punch(tag, user1, user2);
}

/// Save the process-wide collector to `path` and clear it.
pub fn save<P: AsRef<Path>>(path: P) -> Result<()> {
    global().save(path)
}

/// Clear the process-wide collector.
pub fn clear() {
    global().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punch_and_snapshot() {
        let log = TimingLog::with_capacity(8);
        assert!(log.is_empty());
        log.punch(1, 10, 20);
        log.punch(2, 30, 40);
        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag, 1);
        assert_eq!(records[1].tag, 2);
        assert!(records[0].timestamp_ns <= records[1].timestamp_ns);
    }

    #[test]
    fn test_wraparound_keeps_newest() {
        let log = TimingLog::with_capacity(4);
        for tag in 0..10u64 {
            log.punch(tag, 0, 0);
        }
        let records = log.snapshot();
        assert_eq!(records.len(), 4);
        let tags: Vec<u64> = records.iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_save_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.log");

        let log = TimingLog::with_capacity(16);
        log.punch(7, 1, 2);
        log.punch(8, 3, 4);
        log.save(&path).unwrap();
        assert!(log.is_empty());

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("# number of entries:2"));
        assert_eq!(lines.next(), Some("# tag u1 u2 tsns"));
        assert!(lines.next().unwrap().starts_with("7 1 2 "));
        assert!(lines.next().unwrap().starts_with("8 3 4 "));
    }

    #[test]
    fn test_concurrent_punch() {
        use std::sync::Arc;
        let log = Arc::new(TimingLog::with_capacity(4096));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..256u64 {
                        log.punch(t, i, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 1024);
    }
}
