//! In-memory set of 64-bit integers added in ascending order.
//!
//! Values are kept in a B-tree whose leaf items pair a first value with a
//! Simple-8b codeword holding the following values. New values land in a
//! small buffer first and are packed into leaf items once enough of them
//! have accumulated. Vacuum uses it to remember the internal pages and the
//! empty leaves of an index between its two passes.

use std::mem::size_of;

use crate::error::{GistError, GistResult};
use crate::utils::simple8b::{self, MAX_VALUES_PER_CODEWORD};

const MAX_INTERNAL_ITEMS: usize = 64;
const MAX_LEAF_ITEMS: usize = 64;
const MAX_TREE_LEVELS: usize = 11;

const MAX_VALUES_PER_LEAF_ITEM: usize = 1 + MAX_VALUES_PER_CODEWORD;
const MAX_BUFFERED_VALUES: usize = MAX_VALUES_PER_LEAF_ITEM * 2;

#[derive(Debug, Clone, Copy, Default)]
struct LeafItem {
    first: u64,
    codeword: u64,
}

#[derive(Debug)]
struct LeafNode {
    num_items: usize,
    next: Option<usize>,
    items: [LeafItem; MAX_LEAF_ITEMS],
}

impl LeafNode {
    fn new() -> Self {
        Self {
            num_items: 0,
            next: None,
            items: [LeafItem::default(); MAX_LEAF_ITEMS],
        }
    }
}

/// Children of a level-1 node are leaves, all others are internal nodes.
#[derive(Debug)]
struct InternalNode {
    level: usize,
    num_items: usize,
    values: [u64; MAX_INTERNAL_ITEMS],
    downlinks: [usize; MAX_INTERNAL_ITEMS],
}

impl InternalNode {
    fn new(level: usize) -> Self {
        Self {
            level,
            num_items: 0,
            values: [0; MAX_INTERNAL_ITEMS],
            downlinks: [0; MAX_INTERNAL_ITEMS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRef {
    Leaf(usize),
    Internal(usize),
}

#[derive(Debug)]
pub struct IntegerSet {
    num_entries: u64,
    highest_value: u64,
    num_levels: usize,
    root: Option<NodeRef>,
    rightmost_nodes: [Option<NodeRef>; MAX_TREE_LEVELS],
    leaves: Vec<LeafNode>,
    internals: Vec<InternalNode>,
    buffered: Vec<u64>,
    iter: Option<Box<Cursor>>,
}

impl Default for IntegerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegerSet {
    pub fn new() -> Self {
        Self {
            num_entries: 0,
            highest_value: 0,
            num_levels: 0,
            root: None,
            rightmost_nodes: [None; MAX_TREE_LEVELS],
            leaves: Vec::new(),
            internals: Vec::new(),
            buffered: Vec::with_capacity(MAX_BUFFERED_VALUES),
            iter: None,
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    fn node_bytes(&self) -> usize {
        size_of::<Self>()
            + self.leaves.len() * size_of::<LeafNode>()
            + self.internals.len() * size_of::<InternalNode>()
    }

    /// Bytes holding values: allocated tree nodes plus the values currently
    /// waiting in the buffer. Unused buffer slots are not counted; see
    /// `allocated_bytes` for the resident size.
    pub fn memory_usage(&self) -> u64 {
        (self.node_bytes() + self.buffered.len() * size_of::<u64>()) as u64
    }

    /// Resident size, including the whole preallocated insert buffer.
    pub fn allocated_bytes(&self) -> u64 {
        (self.node_bytes() + self.buffered.capacity() * size_of::<u64>()) as u64
    }

    /// Adds `x`, which must be greater than every value added so far.
    pub fn add_member(&mut self, x: u64) -> GistResult<()> {
        if self.iter.is_some() {
            return Err(GistError::InvariantFailed(
                "cannot add new values to integer set while iteration is in progress".to_string(),
            ));
        }
        if x <= self.highest_value && self.num_entries > 0 {
            return Err(GistError::InvariantFailed(
                "cannot add value to integer set out of order".to_string(),
            ));
        }
        if self.buffered.len() >= MAX_BUFFERED_VALUES {
            self.flush_buffered_values()?;
        }
        self.buffered.push(x);
        self.num_entries += 1;
        self.highest_value = x;
        Ok(())
    }

    /// Packs buffered values into leaf items, leaving fewer than one item's
    /// worth behind.
    fn flush_buffered_values(&mut self) -> GistResult<()> {
        let mut leaf = match self.rightmost_nodes[0] {
            Some(NodeRef::Leaf(idx)) => idx,
            _ => {
                let idx = self.alloc_leaf();
                self.root = Some(NodeRef::Leaf(idx));
                self.rightmost_nodes[0] = Some(NodeRef::Leaf(idx));
                self.num_levels = 1;
                idx
            }
        };

        let mut num_packed = 0usize;
        while self.buffered.len() - num_packed >= MAX_VALUES_PER_LEAF_ITEM {
            let first = self.buffered[num_packed];
            let (codeword, num_encoded) =
                simple8b::encode(&self.buffered[num_packed + 1..], first);
            let item = LeafItem { first, codeword };

            if self.leaves[leaf].num_items >= MAX_LEAF_ITEMS {
                let new_leaf = self.alloc_leaf();
                self.leaves[leaf].next = Some(new_leaf);
                self.rightmost_nodes[0] = Some(NodeRef::Leaf(new_leaf));
                self.update_upper(1, NodeRef::Leaf(new_leaf), first)?;
                leaf = new_leaf;
            }
            let node = &mut self.leaves[leaf];
            node.items[node.num_items] = item;
            node.num_items += 1;
            num_packed += 1 + num_encoded;
        }
        self.buffered.drain(..num_packed);
        Ok(())
    }

    /// Inserts a downlink to `child` into the rightmost node at `level`,
    /// growing the tree as needed.
    fn update_upper(&mut self, level: usize, child: NodeRef, child_key: u64) -> GistResult<()> {
        if level >= self.num_levels {
            if self.num_levels == MAX_TREE_LEVELS {
                return Err(GistError::StructuralLimit(
                    "could not expand integer set, maximum number of levels reached".to_string(),
                ));
            }
            let old_root = self.root.ok_or_else(|| {
                GistError::InvariantFailed("integer set has no root".to_string())
            })?;
            self.num_levels += 1;
            let downlink_key = self.first_key(old_root);
            let parent = self.alloc_internal(level);
            let node = &mut self.internals[parent];
            node.values[0] = downlink_key;
            node.downlinks[0] = node_index(old_root);
            node.num_items = 1;
            self.root = Some(NodeRef::Internal(parent));
            self.rightmost_nodes[level] = Some(NodeRef::Internal(parent));
        }

        let parent = match self.rightmost_nodes[level] {
            Some(NodeRef::Internal(idx)) => idx,
            _ => {
                return Err(GistError::InvariantFailed(format!(
                    "integer set is missing its rightmost node on level {}",
                    level
                )))
            }
        };
        if self.internals[parent].num_items < MAX_INTERNAL_ITEMS {
            let node = &mut self.internals[parent];
            node.values[node.num_items] = child_key;
            node.downlinks[node.num_items] = node_index(child);
            node.num_items += 1;
            Ok(())
        } else {
            let sibling = self.alloc_internal(level);
            let node = &mut self.internals[sibling];
            node.values[0] = child_key;
            node.downlinks[0] = node_index(child);
            node.num_items = 1;
            self.rightmost_nodes[level] = Some(NodeRef::Internal(sibling));
            self.update_upper(level + 1, NodeRef::Internal(sibling), child_key)
        }
    }

    fn first_key(&self, node: NodeRef) -> u64 {
        match node {
            NodeRef::Leaf(idx) => self.leaves[idx].items[0].first,
            NodeRef::Internal(idx) => self.internals[idx].values[0],
        }
    }

    fn alloc_leaf(&mut self) -> usize {
        self.leaves.push(LeafNode::new());
        self.leaves.len() - 1
    }

    fn alloc_internal(&mut self, level: usize) -> usize {
        self.internals.push(InternalNode::new(level));
        self.internals.len() - 1
    }

    pub fn is_member(&self, x: u64) -> bool {
        if let Some(&head) = self.buffered.first() {
            if x >= head {
                return self.buffered.binary_search(&x).is_ok();
            }
        }

        let mut node = match self.root {
            Some(root) => root,
            None => return false,
        };
        while let NodeRef::Internal(idx) = node {
            let internal = &self.internals[idx];
            let itemno = upper_bound(&internal.values[..internal.num_items], x);
            if itemno == 0 {
                return false;
            }
            let child = internal.downlinks[itemno - 1];
            node = if internal.level == 1 {
                NodeRef::Leaf(child)
            } else {
                NodeRef::Internal(child)
            };
        }
        let NodeRef::Leaf(idx) = node else {
            return false;
        };
        let leaf = &self.leaves[idx];
        let items = &leaf.items[..leaf.num_items];
        let itemno = items.partition_point(|item| item.first <= x);
        if itemno == 0 {
            return false;
        }
        let item = &items[itemno - 1];
        item.first == x || simple8b::contains(item.codeword, x, item.first)
    }

    /// Starts a stateful walk over the whole set. No values may be added
    /// until `iterate_next` has returned `None`.
    pub fn begin_iterate(&mut self) {
        self.iter = Some(Box::new(Cursor::new(self)));
    }

    pub fn iterate_next(&mut self) -> Option<u64> {
        let mut cursor = self.iter.take()?;
        let next = cursor.advance(self);
        if next.is_some() {
            self.iter = Some(cursor);
        }
        next
    }

    /// Borrowing iterator over every value in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            cursor: Cursor::new(self),
        }
    }
}

fn node_index(node: NodeRef) -> usize {
    match node {
        NodeRef::Leaf(idx) | NodeRef::Internal(idx) => idx,
    }
}

/// Number of elements `<= x` in ascending `values`.
fn upper_bound(values: &[u64], x: u64) -> usize {
    values.partition_point(|v| *v <= x)
}

#[derive(Debug)]
struct Cursor {
    leaf: Option<usize>,
    itemno: usize,
    values: [u64; MAX_VALUES_PER_LEAF_ITEM],
    num_values: usize,
    valueno: usize,
    in_buffer: bool,
}

impl Cursor {
    fn new(set: &IntegerSet) -> Self {
        let leftmost = if set.leaves.is_empty() { None } else { Some(0) };
        Self {
            leaf: leftmost,
            itemno: 0,
            values: [0; MAX_VALUES_PER_LEAF_ITEM],
            num_values: 0,
            valueno: 0,
            in_buffer: false,
        }
    }

    fn advance(&mut self, set: &IntegerSet) -> Option<u64> {
        loop {
            if self.valueno < self.num_values {
                let value = if self.in_buffer {
                    set.buffered[self.valueno]
                } else {
                    self.values[self.valueno]
                };
                self.valueno += 1;
                return Some(value);
            }
            if let Some(idx) = self.leaf {
                let leaf = &set.leaves[idx];
                if self.itemno < leaf.num_items {
                    let item = leaf.items[self.itemno];
                    self.itemno += 1;
                    self.values[0] = item.first;
                    let decoded =
                        simple8b::decode(item.codeword, item.first, &mut self.values[1..]);
                    self.num_values = decoded + 1;
                    self.valueno = 0;
                    continue;
                }
                self.leaf = leaf.next;
                self.itemno = 0;
                continue;
            }
            if !self.in_buffer {
                self.in_buffer = true;
                self.num_values = set.buffered.len();
                self.valueno = 0;
                continue;
            }
            return None;
        }
    }
}

pub struct Iter<'a> {
    set: &'a IntegerSet,
    cursor: Cursor,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.cursor.advance(self.set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn empty_set() {
        let mut set = IntegerSet::new();
        assert!(!set.is_member(0));
        assert_eq!(set.iter().count(), 0);
        set.begin_iterate();
        assert_eq!(set.iterate_next(), None);
    }

    #[test]
    fn run_with_large_jumps_stays_small() {
        let mut set = IntegerSet::new();
        let mut expected: Vec<u64> = (0..1000).collect();
        expected.push(10_000);
        expected.push(10_000 + (1u64 << 61));
        for v in &expected {
            set.add_member(*v).unwrap();
        }
        assert_eq!(set.num_entries(), expected.len() as u64);
        assert!(set.memory_usage() < 2048, "{}", set.memory_usage());

        let collected: Vec<u64> = set.iter().collect();
        assert_eq!(collected, expected);
        for v in &expected {
            assert!(set.is_member(*v), "{}", v);
        }
        for v in [1000u64, 1001, 9_999, 10_001, u64::MAX] {
            assert!(!set.is_member(v), "{}", v);
        }
    }

    #[test]
    fn huge_gap_survives_packing_into_leaf_items() {
        let mut set = IntegerSet::new();
        let gap = 10_000 + (1u64 << 61);
        let mut expected: Vec<u64> = (0..1000).collect();
        expected.push(10_000);
        expected.push(gap);
        // enough values after the jump to push it out of the buffer
        expected.extend((1..=600u64).map(|i| gap + i * 3));
        for v in &expected {
            set.add_member(*v).unwrap();
        }
        assert!(!set.buffered.contains(&gap));
        assert!(!set.buffered.contains(&10_000));

        assert_eq!(set.iter().collect::<Vec<_>>(), expected);
        for v in [0u64, 999, 10_000, gap, gap + 3, gap + 1_800] {
            assert!(set.is_member(v), "{}", v);
        }
        for v in [1_000u64, 10_001, gap - 1, gap + 1, gap + 1_801, u64::MAX] {
            assert!(!set.is_member(v), "{}", v);
        }
    }

    #[test]
    fn allocated_bytes_include_the_whole_buffer() {
        let mut set = IntegerSet::new();
        let empty = set.allocated_bytes();
        assert!(empty >= (MAX_BUFFERED_VALUES * size_of::<u64>()) as u64);
        assert!(set.memory_usage() < empty);
        for v in 0..10u64 {
            set.add_member(v).unwrap();
        }
        assert_eq!(set.allocated_bytes(), empty);
        assert_eq!(
            set.allocated_bytes() - set.memory_usage(),
            ((set.buffered.capacity() - 10) * size_of::<u64>()) as u64
        );
    }

    #[test]
    fn stateful_iteration_blocks_additions() {
        let mut set = IntegerSet::new();
        for v in [5u64, 7, 9] {
            set.add_member(v).unwrap();
        }
        set.begin_iterate();
        assert_eq!(set.iterate_next(), Some(5));
        assert!(matches!(
            set.add_member(11),
            Err(GistError::InvariantFailed(_))
        ));
        assert_eq!(set.iterate_next(), Some(7));
        assert_eq!(set.iterate_next(), Some(9));
        assert_eq!(set.iterate_next(), None);
        set.add_member(11).unwrap();
        assert!(matches!(
            set.add_member(11),
            Err(GistError::InvariantFailed(_))
        ));
    }

    #[test]
    fn random_gaps_across_many_levels() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut set = IntegerSet::new();
        let mut values = Vec::new();
        let mut v = 0u64;
        for _ in 0..200_000 {
            v += rng.random_range(1..=2_000u64);
            values.push(v);
            set.add_member(v).unwrap();
        }
        assert_eq!(set.iter().collect::<Vec<_>>(), values);
        for (i, v) in values.iter().enumerate().step_by(97) {
            assert!(set.is_member(*v));
            if i + 1 < values.len() && values[i + 1] > v + 1 {
                assert!(!set.is_member(v + 1));
            }
        }
        assert!(!set.internals.is_empty());
    }

    #[test]
    fn dense_run_is_compact() {
        let mut set = IntegerSet::new();
        for v in 0..1_000_000u64 {
            set.add_member(v).unwrap();
        }
        // 240 consecutive values per 16-byte item.
        assert!(set.memory_usage() < 200_000, "{}", set.memory_usage());
        assert!(set.is_member(999_999));
        assert!(!set.is_member(1_000_000));
        assert_eq!(set.iter().count(), 1_000_000);
    }
}
