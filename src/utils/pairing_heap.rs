//! Min pairing heap.
//!
//! Nodes live in a slab owned by the heap and refer to each other by index,
//! so popping an element hands it back by value without any unsafe links.

use std::cmp::Ordering;

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    child: Option<usize>,
    sibling: Option<usize>,
}

#[derive(Debug)]
pub struct PairingHeap<T: Ord> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    root: Option<usize>,
    len: usize,
}

impl<T: Ord> Default for PairingHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> PairingHeap<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.len = 0;
    }

    pub fn peek(&self) -> Option<&T> {
        self.root.and_then(|idx| self.nodes[idx].value.as_ref())
    }

    pub fn push(&mut self, value: T) {
        let node = Node {
            value: Some(value),
            child: None,
            sibling: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.root = Some(match self.root {
            Some(root) => self.meld(root, idx),
            None => idx,
        });
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        let root = self.root?;
        let value = self.nodes[root].value.take();
        let children = self.nodes[root].child.take();
        self.free.push(root);
        self.len -= 1;
        self.root = self.merge_pairs(children);
        value
    }

    /// Links two roots, the larger becoming the first child of the smaller.
    fn meld(&mut self, a: usize, b: usize) -> usize {
        let (parent, child) = match self.compare(a, b) {
            Ordering::Greater => (b, a),
            _ => (a, b),
        };
        self.nodes[child].sibling = self.nodes[parent].child;
        self.nodes[parent].child = Some(child);
        parent
    }

    fn compare(&self, a: usize, b: usize) -> Ordering {
        self.nodes[a].value.cmp(&self.nodes[b].value)
    }

    /// Two-pass merge of a sibling list: pair left to right, then fold the
    /// pairs right to left.
    fn merge_pairs(&mut self, first: Option<usize>) -> Option<usize> {
        let mut pairs = Vec::new();
        let mut cursor = first;
        while let Some(a) = cursor {
            let next = self.nodes[a].sibling.take();
            match next {
                Some(b) => {
                    cursor = self.nodes[b].sibling.take();
                    pairs.push(self.meld(a, b));
                }
                None => {
                    cursor = None;
                    pairs.push(a);
                }
            }
        }
        let mut result = pairs.pop()?;
        while let Some(prev) = pairs.pop() {
            result = self.meld(prev, result);
        }
        Some(result)
    }
}
