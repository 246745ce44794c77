//! Integration tests for the ring buffer data path and segment lifecycle.
//!
//! Every test creates its own System-V segment with a process-unique key
//! and removes it before returning, so runs do not leak kernel objects.

use shmkit::ring::{RingBuffer, RingBufferAttr};
use shmkit::Error;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static KEY_SALT: AtomicI32 = AtomicI32::new(0);

/// A key unlikely to collide across test processes and test functions.
fn unique_key() -> i32 {
    let pid = std::process::id() as i32;
    let salt = KEY_SALT.fetch_add(1, Ordering::Relaxed);
    0x5a00_0000 | ((pid & 0xffff) << 8) | (salt & 0xff)
}

/// Removes the segment when the test body is done, panicking or not.
struct Segment {
    key: i32,
}

impl Segment {
    fn create(attr: RingBufferAttr) -> Self {
        let attr = RingBufferAttr {
            key: unique_key(),
            ..attr
        };
        let key = RingBuffer::create(&attr).expect("segment creation");
        Self { key }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = RingBuffer::delete(self.key);
    }
}

#[test]
fn test_create_attach_delete_lifecycle() {
    let attr = RingBufferAttr {
        key: unique_key(),
        capacity: 64,
        entry_size: 32,
        description: "lifecycle test".to_string(),
        ..Default::default()
    };
    let key = RingBuffer::create(&attr).unwrap();
    assert_eq!(key, attr.key);

    {
        let rb = RingBuffer::attach(key).unwrap();
        let read_back = rb.attribute();
        assert_eq!(read_back.key, key);
        assert_eq!(read_back.capacity, 64);
        assert_eq!(read_back.entry_size, 32);
        assert_eq!(read_back.description, "lifecycle test");
        assert!(!read_back.multiple_producer);
        assert!(rb.is_empty());
    }

    // Exclusive creation refuses a second segment under the same key.
    assert!(matches!(
        RingBuffer::create(&attr),
        Err(Error::System(_) | Error::Io(_))
    ));

    RingBuffer::delete(key).unwrap();
    assert!(matches!(RingBuffer::attach(key), Err(Error::NotFound(_))));
    assert!(matches!(RingBuffer::delete(key), Err(Error::NotFound(_))));
}

#[test]
fn test_spsc_fifo_and_full_at_capacity_minus_one() {
    let seg = Segment::create(RingBufferAttr {
        capacity: 16,
        entry_size: 64,
        ..Default::default()
    });
    let rb = RingBuffer::attach(seg.key).unwrap();

    let payload = |i: u8| [i; 64];

    // 15 entries fit; the 16th hits the reserved slot and times out.
    for i in 0..15u8 {
        rb.produce(&payload(i), Duration::ZERO).unwrap();
    }
    assert_eq!(rb.len(), 15);
    assert!(matches!(
        rb.produce(&payload(15), Duration::from_millis(1)),
        Err(Error::Timeout(_))
    ));

    // Draining one entry makes room for exactly one more.
    let mut buf = [0u8; 64];
    rb.consume(&mut buf, Duration::ZERO).unwrap();
    assert_eq!(buf, payload(0));
    rb.produce(&payload(15), Duration::ZERO).unwrap();

    // FIFO order holds across the wrap.
    for i in 1..16u8 {
        rb.consume(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf, payload(i), "entry {i} out of order");
    }
    assert!(rb.is_empty());
}

#[test]
fn test_zero_timeout_fails_immediately() {
    let seg = Segment::create(RingBufferAttr {
        capacity: 4,
        entry_size: 16,
        ..Default::default()
    });
    let rb = RingBuffer::attach(seg.key).unwrap();

    // Empty buffer: consume with zero timeout reports Timeout at once.
    let mut buf = [0u8; 16];
    assert!(matches!(
        rb.consume(&mut buf, Duration::ZERO),
        Err(Error::Timeout(_))
    ));

    // Non-full buffer: produce with zero timeout succeeds immediately.
    rb.produce(&[1u8; 16], Duration::ZERO).unwrap();
    rb.consume(&mut buf, Duration::ZERO).unwrap();
    assert_eq!(buf, [1u8; 16]);
}

#[test]
fn test_payload_size_validation() {
    let seg = Segment::create(RingBufferAttr {
        capacity: 4,
        entry_size: 16,
        ..Default::default()
    });
    let rb = RingBuffer::attach(seg.key).unwrap();

    assert!(matches!(
        rb.produce(&[], Duration::ZERO),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        rb.produce(&[0u8; 17], Duration::ZERO),
        Err(Error::InvalidArgument(_))
    ));
    let mut oversized = [0u8; 17];
    assert!(matches!(
        rb.consume(&mut oversized, Duration::ZERO),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_short_reads_and_writes_use_slot_prefix() {
    let seg = Segment::create(RingBufferAttr {
        capacity: 8,
        entry_size: 64,
        ..Default::default()
    });
    let rb = RingBuffer::attach(seg.key).unwrap();

    rb.produce(b"abcdef", Duration::ZERO).unwrap();
    let mut buf = [0u8; 4];
    rb.consume(&mut buf, Duration::ZERO).unwrap();
    assert_eq!(&buf, b"abcd");
}

#[test]
fn test_multi_producer_no_loss_no_duplication() {
    const PER_PRODUCER: u64 = 1000;

    let seg = Segment::create(RingBufferAttr {
        capacity: 64,
        entry_size: 16,
        multiple_producer: true,
        ..Default::default()
    });
    let rb = Arc::new(RingBuffer::attach(seg.key).unwrap());

    let producers: Vec<_> = (0..2u64)
        .map(|p| {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    rb.produce(&value.to_le_bytes(), Duration::from_secs(10))
                        .unwrap();
                }
            })
        })
        .collect();

    let mut seen = vec![false; 2 * PER_PRODUCER as usize];
    let mut buf = [0u8; 8];
    for _ in 0..2 * PER_PRODUCER {
        rb.consume(&mut buf, Duration::from_secs(10)).unwrap();
        let value = u64::from_le_bytes(buf) as usize;
        assert!(value < seen.len(), "value {value} out of range");
        assert!(!seen[value], "value {value} duplicated");
        seen[value] = true;
    }
    assert!(seen.iter().all(|&s| s), "entries lost");

    for p in producers {
        p.join().unwrap();
    }
    // Nothing extra arrived.
    assert!(rb.is_empty());
}

#[test]
fn test_multi_consumer_drains_everything_once() {
    const TOTAL: u64 = 2000;

    let seg = Segment::create(RingBufferAttr {
        capacity: 128,
        entry_size: 16,
        multiple_consumer: true,
        ..Default::default()
    });
    let rb = Arc::new(RingBuffer::attach(seg.key).unwrap());

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut got = Vec::new();
                let mut buf = [0u8; 8];
                loop {
                    match rb.consume(&mut buf, Duration::from_millis(200)) {
                        Ok(()) => got.push(u64::from_le_bytes(buf)),
                        Err(Error::Timeout(_)) => return got,
                        Err(e) => panic!("consume failed: {e}"),
                    }
                }
            })
        })
        .collect();

    for value in 0..TOTAL {
        rb.produce(&value.to_le_bytes(), Duration::from_secs(10))
            .unwrap();
    }

    let mut all: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<u64> = (0..TOTAL).collect();
    assert_eq!(all, expected);
}
