//! Buddy-system allocator over a flat binary-tree state array.
//!
//! The tree tracks which power-of-two subranges of a capacity are free,
//! split, or allocated. State lives in a caller-supplied `i64` array so the
//! same code runs against a private heap buffer or a file mapping shared by
//! many processes — the tree itself performs no locking and no I/O.
//!
//! # State encoding
//!
//! Each node holds one `i64`:
//!
//! | Value | Meaning |
//! |-------|---------|
//! | `0`   | free leaf or unsplit subtree |
//! | `-1`  | split, some descendants free |
//! | `-2`  | split, no descendants free |
//! | `> 0` | root of one allocation; the value is the requested byte size |
//!
//! The array is indexed from 1 (index 0 is unused). For node `n`, the
//! children are `2n` and `2n + 1`.

use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Node state: free leaf or unsplit subtree.
const IDLE: i64 = 0;
/// Node state: split with both used and free descendants.
const SPLIT_PARTIAL: i64 = -1;
/// Node state: split with no free space below.
const SPLIT_FULL: i64 = -2;

/// A node with no free space below it: either an allocation root or a
/// fully-occupied split.
fn is_full(state: i64) -> bool {
    state > 0 || state == SPLIT_FULL
}

/// Level of a node, counting the root as level 1.
fn level_of(node: u32) -> u32 {
    32 - node.leading_zeros()
}

/// Buddy allocator over a power-of-two capacity with a power-of-two unit.
///
/// Offsets handed out are relative to the start of the managed range; the
/// tree knows nothing about what the range addresses. All mutating calls
/// must be externally serialized when the backing array is shared (see
/// [`crate::vaw`] for the cross-process discipline).
pub struct BuddyTree {
    /// Tree state array, indexed from 1.
    nodes: NonNull<i64>,
    /// Managed range in bytes. Power of two.
    capacity: u64,
    /// Smallest allocatable size in bytes. Power of two.
    unit_size: u64,
    /// Level of the leaf nodes; the root is level 1.
    total_level: u32,
    /// Backing storage when the tree owns its buffer; kept only so the
    /// node pointer stays valid.
    _owned: Option<Box<[i64]>>,
}

// SAFETY: the raw node pointer is either owned by this tree or points into
// a mapping the creator guaranteed to outlive it; BuddyTree never aliases
// it behind shared references without external synchronization.
unsafe impl Send for BuddyTree {}

impl BuddyTree {
    /// Byte size of the tree state array for a capacity/unit pair.
    ///
    /// This is the required size of the on-disk `buddies` file; the factor
    /// of two over the leaf count covers the interior nodes and the unused
    /// index 0.
    pub const fn calc_tree_size(capacity: u64, unit_size: u64) -> u64 {
        2 * (capacity / unit_size) * std::mem::size_of::<i64>() as u64
    }

    /// Build a tree over a caller-supplied state buffer.
    ///
    /// With `init` set, the root is stamped free and any previous content
    /// is disregarded; otherwise the buffer's existing state is reused
    /// (the attach path for a shared mapping).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `unit_exp > capacity_exp`.
    ///
    /// # Safety
    ///
    /// `nodes` must point to at least
    /// `calc_tree_size(1 << capacity_exp, 1 << unit_exp)` bytes, valid and
    /// writable for the lifetime of the tree, and not concurrently mutated
    /// except through this tree under the caller's locking discipline.
    pub unsafe fn from_raw(
        capacity_exp: u32,
        unit_exp: u32,
        init: bool,
        nodes: NonNull<i64>,
    ) -> Result<Self> {
        let tree = Self::with_storage(capacity_exp, unit_exp, nodes, None)?;
        if init {
            unsafe { tree.nodes.as_ptr().add(1).write(IDLE) };
        }
        Ok(tree)
    }

    /// Build a tree with its own zero-initialized heap buffer.
    pub fn new_owned(capacity_exp: u32, unit_exp: u32) -> Result<Self> {
        let entries = Self::calc_tree_size(1u64 << capacity_exp, 1u64 << unit_exp) as usize
            / std::mem::size_of::<i64>();
        let mut buf = vec![IDLE; entries].into_boxed_slice();
        let nodes = NonNull::new(buf.as_mut_ptr()).expect("boxed slice is non-null");
        Self::with_storage(capacity_exp, unit_exp, nodes, Some(buf))
    }

    fn with_storage(
        capacity_exp: u32,
        unit_exp: u32,
        nodes: NonNull<i64>,
        owned: Option<Box<[i64]>>,
    ) -> Result<Self> {
        if unit_exp > capacity_exp {
            return Err(Error::InvalidArgument(format!(
                "unit exponent {unit_exp} exceeds capacity exponent {capacity_exp}"
            )));
        }
        let capacity = 1u64 << capacity_exp;
        let unit_size = 1u64 << unit_exp;
        Ok(Self {
            nodes,
            capacity,
            unit_size,
            total_level: (capacity / unit_size).trailing_zeros() + 1,
            _owned: owned,
        })
    }

    /// Managed range in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Smallest allocatable size in bytes.
    pub fn unit_size(&self) -> u64 {
        self.unit_size
    }

    fn node(&self, idx: u32) -> i64 {
        debug_assert!(idx >= 1 && idx < (2u32 << (self.total_level - 1)));
        unsafe { self.nodes.as_ptr().add(idx as usize).read() }
    }

    fn set_node(&mut self, idx: u32, state: i64) {
        debug_assert!(idx >= 1 && idx < (2u32 << (self.total_level - 1)));
        unsafe { self.nodes.as_ptr().add(idx as usize).write(state) };
    }

    /// Byte offset covered by a node.
    fn offset_of(&self, node: u32) -> u64 {
        let siblings = 1u64 << (level_of(node) - 1);
        self.capacity / siblings * (u64::from(node) - siblings)
    }

    /// Allocate `size` bytes, rounded up to the nearest power of two but
    /// not below the unit size. Returns the byte offset of the allocation.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `size` is zero or the rounded size exceeds
    /// the capacity; `OutOfMemory` when no free subrange of the rounded
    /// size remains.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate zero bytes".to_string(),
            ));
        }
        let bsize = size.next_power_of_two().max(self.unit_size);
        if bsize > self.capacity {
            return Err(Error::InvalidArgument(format!(
                "requested size {size} exceeds capacity {}",
                self.capacity
            )));
        }

        let level = self.total_level - (bsize / self.unit_size).trailing_zeros();
        let node = self.allocate_node(level, 1, size);
        if node == 0 {
            return Err(Error::OutOfMemory(format!(
                "no free range of {bsize} bytes"
            )));
        }
        Ok(self.offset_of(node))
    }

    /// Descend looking for a free node at `level`. Returns the node id, or
    /// 0 when the subtree has no room.
    fn allocate_node(&mut self, level: u32, cur: u32, size: u64) -> u32 {
        debug_assert!(level >= 1 && level <= self.total_level);
        if level_of(cur) == level {
            return if self.node(cur) == IDLE {
                self.set_node(cur, size as i64);
                cur
            } else {
                0
            };
        }

        let left = cur << 1;
        let right = left + 1;
        match self.node(cur) {
            IDLE => {
                // Split, then always descend left first.
                self.set_node(cur, SPLIT_PARTIAL);
                self.set_node(left, IDLE);
                self.set_node(right, IDLE);
                self.allocate_node(level, left, size)
            }
            SPLIT_PARTIAL => {
                let mut got = self.allocate_node(level, left, size);
                if got == 0 {
                    got = self.allocate_node(level, right, size);
                }
                if got != 0 && is_full(self.node(left)) && is_full(self.node(right)) {
                    self.set_node(cur, SPLIT_FULL);
                }
                got
            }
            _ => 0,
        }
    }

    /// Free the allocation starting at `offset`.
    ///
    /// The offset must be unit-aligned and name the exact start of a live
    /// allocation; anything else (including a second free of the same
    /// offset) is `InvalidArgument`.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        if offset % self.unit_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} is not aligned to unit size {}",
                self.unit_size
            )));
        }
        if offset >= self.capacity {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} is beyond capacity {}",
                self.capacity
            )));
        }

        let node = self.find_allocated(offset)?;
        if self.offset_of(node) != offset {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} is inside an allocation, not its start"
            )));
        }
        self.set_node(node, IDLE);

        // Restore the parent invariants up to the root.
        let mut parent = node >> 1;
        while parent > 0 {
            let left = self.node(parent << 1);
            let right = self.node((parent << 1) + 1);
            if left == IDLE && right == IDLE {
                self.set_node(parent, IDLE);
            } else if self.node(parent) == SPLIT_FULL {
                self.set_node(parent, SPLIT_PARTIAL);
            } else {
                break;
            }
            parent >>= 1;
        }
        Ok(())
    }

    /// Whether the whole of `[offset, offset + size)` is free.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the range reaches past the capacity.
    pub fn is_free(&self, offset: u64, size: u64) -> Result<bool> {
        if offset + size > self.capacity {
            return Err(Error::InvalidArgument(format!(
                "range [{offset}, {}) is beyond capacity {}",
                offset + size,
                self.capacity
            )));
        }
        Ok(self.is_free_below(1, offset, size))
    }

    fn is_free_below(&self, cur: u32, offset: u64, size: u64) -> bool {
        let state = self.node(cur);
        if state == IDLE {
            return true;
        }
        if is_full(state) {
            return false;
        }
        // SPLIT_PARTIAL: recurse into the children the range touches.
        let left = cur << 1;
        let right = left + 1;
        let mid = self.offset_of(right);
        if offset + size <= mid {
            self.is_free_below(left, offset, size)
        } else if offset >= mid {
            self.is_free_below(right, offset, size)
        } else {
            self.is_free_below(left, offset, mid - offset)
                && self.is_free_below(right, mid, offset + size - mid)
        }
    }

    /// Find the allocation containing `offset`.
    ///
    /// Returns the allocation's starting offset and its requested byte
    /// size, or `InvalidArgument` when the offset lies outside any
    /// allocation.
    pub fn query(&self, offset: u64) -> Result<(u64, u64)> {
        let node = self.find_allocated(offset)?;
        Ok((self.offset_of(node), self.node(node) as u64))
    }

    /// Walk from the root to the allocated node covering `offset`.
    fn find_allocated(&self, offset: u64) -> Result<u32> {
        let mut cur = 1u32;
        let mut leaf_index = offset / self.unit_size;
        let mut num_leaves = 1u64 << (self.total_level - 1);

        while self.node(cur) == SPLIT_PARTIAL || self.node(cur) == SPLIT_FULL {
            num_leaves >>= 1;
            if leaf_index < num_leaves {
                cur <<= 1;
            } else {
                cur = (cur << 1) + 1;
                leaf_index -= num_leaves;
            }
        }

        if self.node(cur) == IDLE {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} is outside any allocation"
            )));
        }
        Ok(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const CAP_EXP: u32 = 23; // 8 MiB
    const UNIT_EXP: u32 = 20; // 1 MiB
    const UNIT: u64 = 1 << UNIT_EXP;

    fn tree() -> BuddyTree {
        BuddyTree::new_owned(CAP_EXP, UNIT_EXP).unwrap()
    }

    /// Re-derive every interior node's state from its children and compare.
    fn check_invariants(t: &BuddyTree) {
        let leaves = (t.capacity() / t.unit_size()) as u32;
        // Walk interior nodes bottom-up so child states are already final.
        for node in (1..leaves).rev() {
            let state = t.node(node);
            if state > 0 {
                continue; // allocation root; children are unspecified
            }
            if state == IDLE {
                continue; // unsplit subtree; children are unspecified
            }
            let left = t.node(node << 1);
            let right = t.node((node << 1) + 1);
            if is_full(left) && is_full(right) {
                assert_eq!(state, SPLIT_FULL, "node {node} must be full");
            } else {
                assert_eq!(state, SPLIT_PARTIAL, "node {node} must be partial");
            }
            assert!(
                !(left == IDLE && right == IDLE),
                "node {node} split with two idle children"
            );
        }
    }

    #[test]
    fn test_tree_size() {
        assert_eq!(BuddyTree::calc_tree_size(1 << 23, 1 << 20), 128);
        assert_eq!(
            BuddyTree::calc_tree_size(0x1000_0000_0000, 0x1_0000_0000),
            65536
        );
    }

    #[test]
    fn test_construction_rejects_inverted_exponents() {
        assert!(matches!(
            BuddyTree::new_owned(20, 23),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fresh_tree_is_idle() {
        let t = tree();
        assert_eq!(t.node(1), IDLE);
        assert!(t.is_free(0, t.capacity()).unwrap());
    }

    #[test]
    fn test_first_unit_allocation_descends_left() {
        let mut t = tree();
        let offset = t.allocate(UNIT).unwrap();
        assert_eq!(offset, 0);

        // The path to the first leaf is split; the leaf holds the size.
        assert_eq!(t.node(1), SPLIT_PARTIAL);
        assert_eq!(t.node(2), SPLIT_PARTIAL);
        assert_eq!(t.node(4), SPLIT_PARTIAL);
        assert_eq!(t.node(8), UNIT as i64);
        assert_eq!(t.node(3), IDLE);
        assert_eq!(t.node(5), IDLE);
        assert_eq!(t.node(9), IDLE);
        check_invariants(&t);
    }

    #[test]
    fn test_small_request_rounds_up_to_unit() {
        let mut t = tree();
        t.allocate(UNIT).unwrap();
        let offset = t.allocate(100).unwrap();
        // Rounded to one unit: the next unit-aligned slot.
        assert_eq!(offset, UNIT);
        // The node stores the requested size, not the rounded size.
        assert_eq!(t.node(9), 100);
        assert_eq!(t.query(offset).unwrap(), (UNIT, 100));
        check_invariants(&t);
    }

    #[test]
    fn test_fill_then_oom() {
        let mut t = tree();
        assert_eq!(t.allocate(1 << 20).unwrap(), 0);
        assert_eq!(t.allocate(100).unwrap(), 1 << 20);
        // 1 MiB + 1 byte rounds to 2 MiB.
        assert_eq!(t.allocate((1 << 20) + 1).unwrap(), 2 << 20);
        assert_eq!(t.allocate(2 << 20).unwrap(), 4 << 20);
        // 8 MiB total, 6 MiB + 2×1 MiB in use: a 3 MiB request needs a
        // free 4 MiB subrange and there is none.
        assert!(matches!(t.allocate(3 << 20), Err(Error::OutOfMemory(_))));
        check_invariants(&t);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut t = tree();
        let offset = t.allocate(1 << 20).unwrap();
        t.free(offset).unwrap();
        assert!(matches!(t.free(offset), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_free_validates_alignment_and_bounds() {
        let mut t = tree();
        t.allocate(UNIT).unwrap();
        assert!(matches!(t.free(12345), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            t.free(t.capacity() + UNIT),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_free_rejects_interior_offset() {
        let mut t = tree();
        let offset = t.allocate(2 << 20).unwrap();
        // Unit-aligned but in the middle of the 2 MiB allocation.
        assert!(matches!(
            t.free(offset + UNIT),
            Err(Error::InvalidArgument(_))
        ));
        t.free(offset).unwrap();
    }

    #[test]
    fn test_round_trip_restores_tree() {
        for size in [1u64, 100, UNIT, UNIT + 1, 2 << 20, 1 << 23] {
            let mut t = tree();
            // Shape the tree a little before the round trip.
            let keep = if size <= 4 << 20 {
                Some(t.allocate(UNIT).unwrap())
            } else {
                None
            };
            let snapshot: Vec<i64> = (1..16).map(|i| t.node(i)).collect();

            let offset = t.allocate(size).unwrap();
            t.free(offset).unwrap();

            let restored: Vec<i64> = (1..16).map(|i| t.node(i)).collect();
            assert_eq!(snapshot, restored, "size {size} round trip");
            if let Some(k) = keep {
                t.free(k).unwrap();
            }
        }
    }

    #[test]
    fn test_alignment_of_returned_offsets() {
        for size in [1u64, UNIT, UNIT + 1, (2 << 20) + 7, 4 << 20] {
            let mut t = tree();
            t.allocate(UNIT).unwrap();
            let offset = t.allocate(size).unwrap();
            let align = size.next_power_of_two().max(UNIT);
            assert_eq!(offset % align, 0, "size {size} alignment");
        }
    }

    #[test]
    fn test_is_free_tracks_allocations() {
        let mut t = tree();
        let a = t.allocate(2 << 20).unwrap();
        assert!(!t.is_free(a, 1).unwrap());
        assert!(!t.is_free(a + UNIT, UNIT).unwrap());
        assert!(t.is_free(a + (2 << 20), UNIT).unwrap());
        // Range straddling allocated and free halves.
        assert!(!t.is_free(a, 4 << 20).unwrap());
        assert!(matches!(
            t.is_free(0, t.capacity() + 1),
            Err(Error::InvalidArgument(_))
        ));
        t.free(a).unwrap();
        assert!(t.is_free(0, t.capacity()).unwrap());
    }

    #[test]
    fn test_query_finds_covering_allocation() {
        let mut t = tree();
        let a = t.allocate((1 << 20) + 1).unwrap();
        // Any offset inside the rounded 2 MiB range maps back to it.
        assert_eq!(t.query(a).unwrap(), (a, (1 << 20) + 1));
        assert_eq!(t.query(a + UNIT + 17).unwrap(), (a, (1 << 20) + 1));
        // Outside any allocation.
        assert!(matches!(
            t.query(a + (2 << 20)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_whole_capacity_allocation() {
        let mut t = tree();
        let offset = t.allocate(1 << 23).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(t.node(1), (1 << 23) as i64);
        assert!(matches!(t.allocate(1), Err(Error::OutOfMemory(_))));
        t.free(0).unwrap();
        assert_eq!(t.node(1), IDLE);
    }

    #[test]
    fn test_oversized_and_zero_requests() {
        let mut t = tree();
        assert!(matches!(
            t.allocate((1 << 23) + 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(t.allocate(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_shared_buffer_reattach() {
        // Simulate two processes attaching to the same state buffer.
        let entries = BuddyTree::calc_tree_size(1 << CAP_EXP, 1 << UNIT_EXP) as usize / 8;
        let mut buf = vec![0i64; entries].into_boxed_slice();
        let nodes = NonNull::new(buf.as_mut_ptr()).unwrap();

        let offset;
        {
            let mut t = unsafe { BuddyTree::from_raw(CAP_EXP, UNIT_EXP, true, nodes) }.unwrap();
            offset = t.allocate(2 << 20).unwrap();
        }
        {
            // Second attach sees the first allocation.
            let mut t = unsafe { BuddyTree::from_raw(CAP_EXP, UNIT_EXP, false, nodes) }.unwrap();
            assert_eq!(t.query(offset).unwrap(), (offset, 2 << 20));
            t.free(offset).unwrap();
            assert!(t.is_free(0, 1 << CAP_EXP).unwrap());
        }
    }
}
