use crate::index::bplus_tree::{BPlusTreeIndex, NodeId};
use crate::storage::record::{Key, Offset};

/// Lazy walk along the leaf chain yielding `(key, offset)` for keys in `[min, max]`.
#[derive(Debug, Clone)]
pub struct RangeIter<'a> {
    index: &'a BPlusTreeIndex,
    leaf: Option<NodeId>,
    cursor: usize,
    min: Key,
    max: Key,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn new(index: &'a BPlusTreeIndex, start_leaf: NodeId, min: Key, max: Key) -> Self {
        Self {
            index,
            leaf: Some(start_leaf),
            cursor: 0,
            min,
            max,
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = (Key, Offset);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.leaf {
            let Some(leaf) = self.index.leaf(node) else {
                self.leaf = None;
                return None;
            };
            if self.cursor >= leaf.keys.len() {
                self.leaf = leaf.next;
                self.cursor = 0;
                continue;
            }

            let key = leaf.keys[self.cursor];
            let offset = leaf.offsets[self.cursor];
            self.cursor += 1;
            if key > self.max {
                self.leaf = None;
                return None;
            }
            if key >= self.min {
                return Some((key, offset));
            }
        }
        None
    }
}
