use log::{debug, trace};

use crate::error::{RecStoreError, RecStoreResult};
use crate::index::iterator::RangeIter;
use crate::index::ORDER;
use crate::storage::record::{check_live_key, Key, Offset};

/// Position of a node inside the tree's arena.
pub type NodeId = usize;

#[derive(Debug, Clone, Default)]
pub(crate) struct LeafNode {
    pub(crate) keys: Vec<Key>,
    pub(crate) offsets: Vec<Offset>,
    pub(crate) next: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InternalNode {
    pub(crate) keys: Vec<Key>,
    pub(crate) children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    fn key_count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Internal(inner) => inner.keys.len(),
        }
    }
}

/// In-memory B+-tree from key to record offset.
///
/// Nodes live in an arena and refer to each other by [`NodeId`]. A node holds
/// at most `order` keys; a full child is split before insertion descends into
/// it, so no node ever overflows. Leaves are chained left to right for range
/// scans. Deletion only removes the entry from its leaf: siblings are never
/// merged and separator keys stay in place, which keeps lookups correct because
/// separators only route the descent.
#[derive(Debug, Clone)]
pub struct BPlusTreeIndex {
    nodes: Vec<Node>,
    root: NodeId,
    order: usize,
    len: usize,
}

impl Default for BPlusTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BPlusTreeIndex {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::Leaf(LeafNode::default())],
            root: 0,
            order: ORDER,
            len: 0,
        }
    }

    pub fn with_order(order: usize) -> RecStoreResult<Self> {
        if order < 3 {
            return Err(RecStoreError::InvalidArgument(format!(
                "b+tree order must be at least 3, got {}",
                order
            )));
        }
        Ok(Self {
            order,
            ..Self::new()
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of key/offset pairs in the leaves.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Levels from root to leaf; a lone leaf root has height 1.
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root;
        while let Node::Internal(inner) = &self.nodes[node] {
            node = inner.children[0];
            height += 1;
        }
        height
    }

    /// Children of the root, zero while the root is still a leaf.
    pub fn root_children(&self) -> usize {
        match &self.nodes[self.root] {
            Node::Leaf(_) => 0,
            Node::Internal(inner) => inner.children.len(),
        }
    }

    /// Inserts `key -> offset`.
    ///
    /// Duplicate keys are not detected here; callers that need unique keys
    /// must check with [`BPlusTreeIndex::find`] first.
    pub fn insert(&mut self, key: Key, offset: Offset) -> RecStoreResult<()> {
        check_live_key(key)?;

        if self.nodes[self.root].key_count() == self.order {
            let old_root = self.root;
            let new_root = self.alloc(Node::Internal(InternalNode {
                keys: Vec::with_capacity(self.order),
                children: vec![old_root],
            }));
            self.split_child(new_root, 0)?;
            self.root = new_root;
            debug!("root split, tree height now {}", self.height());
        }

        let mut node = self.root;
        loop {
            let (child_idx, child) = match &self.nodes[node] {
                Node::Leaf(_) => break,
                Node::Internal(inner) => {
                    let idx = child_index(&inner.keys, key);
                    (idx, inner.children[idx])
                }
            };
            node = if self.nodes[child].key_count() == self.order {
                self.split_child(node, child_idx)?;
                let inner = self.internal(node)?;
                if key >= inner.keys[child_idx] {
                    inner.children[child_idx + 1]
                } else {
                    inner.children[child_idx]
                }
            } else {
                child
            };
        }

        let Node::Leaf(leaf) = &mut self.nodes[node] else {
            return Err(RecStoreError::Internal(format!(
                "descent ended on internal node {}",
                node
            )));
        };
        let pos = leaf.keys.partition_point(|k| *k <= key);
        leaf.keys.insert(pos, key);
        leaf.offsets.insert(pos, offset);
        self.len += 1;
        trace!("index insert key={} offset={} leaf={}", key, offset, node);
        Ok(())
    }

    pub fn find(&self, key: Key) -> Option<Offset> {
        let leaf = self.leaf(self.find_leaf(key))?;
        leaf.keys
            .iter()
            .position(|k| *k == key)
            .map(|pos| leaf.offsets[pos])
    }

    pub fn contains(&self, key: Key) -> bool {
        self.find(key).is_some()
    }

    /// Removes `key` from its leaf and returns the offset it pointed at.
    pub fn delete(&mut self, key: Key) -> Option<Offset> {
        let node = self.find_leaf(key);
        let Node::Leaf(leaf) = &mut self.nodes[node] else {
            return None;
        };
        let pos = leaf.keys.iter().position(|k| *k == key)?;
        leaf.keys.remove(pos);
        let offset = leaf.offsets.remove(pos);
        self.len -= 1;
        trace!("index delete key={} offset={} leaf={}", key, offset, node);
        Some(offset)
    }

    /// Offsets of every key in `[min, max]`, ascending by key.
    pub fn range(&self, min: Key, max: Key) -> RangeIter<'_> {
        RangeIter::new(self, self.find_leaf(min), min, max)
    }

    /// Every entry in key order, walking the leaf chain from the leftmost leaf.
    pub fn iter(&self) -> RangeIter<'_> {
        RangeIter::new(self, self.leftmost_leaf(), Key::MIN, Key::MAX)
    }

    pub fn first_key(&self) -> Option<Key> {
        self.iter().next().map(|(key, _)| key)
    }

    pub fn last_key(&self) -> Option<Key> {
        self.iter().last().map(|(key, _)| key)
    }

    /// Verifies ordering, capacity, uniform leaf depth and the leaf chain.
    pub fn check_invariants(&self) -> RecStoreResult<()> {
        let mut leaf_depth = None;
        let mut leaves = Vec::new();
        self.check_node(self.root, None, None, 1, &mut leaf_depth, &mut leaves)?;

        let mut chained = Vec::with_capacity(leaves.len());
        let mut cursor = Some(self.leftmost_leaf());
        while let Some(node) = cursor {
            if chained.len() > leaves.len() {
                return Err(RecStoreError::Corrupt("leaf chain has a cycle".to_string()));
            }
            chained.push(node);
            cursor = self.leaf(node).and_then(|leaf| leaf.next);
        }
        if chained != leaves {
            return Err(RecStoreError::Corrupt(format!(
                "leaf chain {:?} does not match tree order {:?}",
                chained, leaves
            )));
        }

        let keys: Vec<Key> = self.iter().map(|(key, _)| key).collect();
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(RecStoreError::Corrupt(
                "leaf chain keys are not strictly ascending".to_string(),
            ));
        }
        if keys.len() != self.len {
            return Err(RecStoreError::Corrupt(format!(
                "leaf chain holds {} keys, index counts {}",
                keys.len(),
                self.len
            )));
        }
        Ok(())
    }

    fn check_node(
        &self,
        node: NodeId,
        lower: Option<Key>,
        upper: Option<Key>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        leaves: &mut Vec<NodeId>,
    ) -> RecStoreResult<()> {
        let keys = match &self.nodes[node] {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Internal(inner) => &inner.keys,
        };
        if keys.len() > self.order {
            return Err(RecStoreError::Corrupt(format!(
                "node {} holds {} keys, order is {}",
                node,
                keys.len(),
                self.order
            )));
        }
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(RecStoreError::Corrupt(format!(
                "node {} keys are not strictly ascending",
                node
            )));
        }
        let out_of_bounds = keys.iter().any(|k| {
            lower.is_some_and(|lo| *k < lo) || upper.is_some_and(|hi| *k >= hi)
        });
        if out_of_bounds {
            return Err(RecStoreError::Corrupt(format!(
                "node {} has keys outside its separator range",
                node
            )));
        }

        match &self.nodes[node] {
            Node::Leaf(leaf) => {
                if leaf.keys.len() != leaf.offsets.len() {
                    return Err(RecStoreError::Corrupt(format!(
                        "leaf {} has {} keys but {} offsets",
                        node,
                        leaf.keys.len(),
                        leaf.offsets.len()
                    )));
                }
                match *leaf_depth {
                    Some(expected) if expected != depth => {
                        return Err(RecStoreError::Corrupt(format!(
                            "leaf {} at depth {}, expected {}",
                            node, depth, expected
                        )));
                    }
                    _ => *leaf_depth = Some(depth),
                }
                leaves.push(node);
            }
            Node::Internal(inner) => {
                if inner.children.len() != inner.keys.len() + 1 {
                    return Err(RecStoreError::Corrupt(format!(
                        "internal node {} has {} keys and {} children",
                        node,
                        inner.keys.len(),
                        inner.children.len()
                    )));
                }
                for (idx, child) in inner.children.iter().enumerate() {
                    let lo = if idx == 0 { lower } else { Some(inner.keys[idx - 1]) };
                    let hi = inner.keys.get(idx).copied().or(upper);
                    self.check_node(*child, lo, hi, depth + 1, leaf_depth, leaves)?;
                }
            }
        }
        Ok(())
    }

    /// Splits the full child at `parent.children[idx]`, moving its upper half
    /// into a new right sibling and inserting the separator into `parent`.
    fn split_child(&mut self, parent: NodeId, idx: usize) -> RecStoreResult<()> {
        let child = self.internal(parent)?.children[idx];
        let mid = self.order / 2;
        let sibling_id = self.nodes.len();

        let (separator, sibling) = match &mut self.nodes[child] {
            Node::Leaf(leaf) => {
                let keys = leaf.keys.split_off(mid);
                let offsets = leaf.offsets.split_off(mid);
                let next = leaf.next.replace(sibling_id);
                // copied up: the leaf keeps every key
                (keys[0], Node::Leaf(LeafNode { keys, offsets, next }))
            }
            Node::Internal(inner) => {
                let keys = inner.keys.split_off(mid + 1);
                let children = inner.children.split_off(mid + 1);
                // pushed up: removed from both halves
                let separator = inner.keys.pop().ok_or_else(|| {
                    RecStoreError::Internal(format!("split of empty internal node {}", child))
                })?;
                (separator, Node::Internal(InternalNode { keys, children }))
            }
        };
        self.nodes.push(sibling);

        let inner = self.internal(parent)?;
        inner.keys.insert(idx, separator);
        inner.children.insert(idx + 1, sibling_id);
        debug!(
            "split node {} into {} around separator {}",
            child, sibling_id, separator
        );
        Ok(())
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn internal(&mut self, node: NodeId) -> RecStoreResult<&mut InternalNode> {
        match &mut self.nodes[node] {
            Node::Internal(inner) => Ok(inner),
            Node::Leaf(_) => Err(RecStoreError::Internal(format!(
                "node {} is a leaf, expected internal",
                node
            ))),
        }
    }

    pub(crate) fn leaf(&self, node: NodeId) -> Option<&LeafNode> {
        match &self.nodes[node] {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    fn find_leaf(&self, key: Key) -> NodeId {
        let mut node = self.root;
        while let Node::Internal(inner) = &self.nodes[node] {
            node = inner.children[child_index(&inner.keys, key)];
        }
        node
    }

    fn leftmost_leaf(&self) -> NodeId {
        let mut node = self.root;
        while let Node::Internal(inner) = &self.nodes[node] {
            node = inner.children[0];
        }
        node
    }
}

/// Child slot for `key`; a separator equal to the key routes right.
fn child_index(separators: &[Key], key: Key) -> usize {
    separators.partition_point(|sep| *sep <= key)
}

#[cfg(test)]
mod tests {
    use super::BPlusTreeIndex;
    use crate::storage::record::Key;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn keys(index: &BPlusTreeIndex) -> Vec<Key> {
        index.iter().map(|(key, _)| key).collect()
    }

    #[test]
    fn fifth_ascending_insert_grows_root() {
        let mut index = BPlusTreeIndex::new();
        for key in 1..=4 {
            index.insert(key, key as u64 * 10).unwrap();
        }
        assert_eq!(index.height(), 1);
        assert_eq!(index.root_children(), 0);

        index.insert(5, 50).unwrap();
        assert_eq!(index.height(), 2);
        assert_eq!(index.root_children(), 2);
        assert_eq!(index.len(), 5);
        assert_eq!(keys(&index), vec![1, 2, 3, 4, 5]);
        index.check_invariants().unwrap();
    }

    #[test]
    fn find_routes_separator_keys_right() {
        let mut index = BPlusTreeIndex::new();
        for key in 1..=5 {
            index.insert(key, key as u64 * 10).unwrap();
        }
        // 3 became the root separator and lives in the right leaf
        for key in 1..=5 {
            assert_eq!(index.find(key), Some(key as u64 * 10));
        }
        assert_eq!(index.find(6), None);
        assert_eq!(index.find(-1), None);
    }

    #[test]
    fn shuffled_inserts_keep_invariants() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut input: Vec<Key> = (-500..=500).filter(|k| *k != 0).collect();
        input.shuffle(&mut rng);

        let mut index = BPlusTreeIndex::new();
        for (i, key) in input.iter().enumerate() {
            index.insert(*key, i as u64).unwrap();
            assert_eq!(index.find(*key), Some(i as u64));
        }
        index.check_invariants().unwrap();
        assert_eq!(index.len(), 1000);
        assert!(index.height() > 3);

        let mut expected = input.clone();
        expected.sort();
        assert_eq!(keys(&index), expected);
        assert_eq!(index.first_key(), Some(-500));
        assert_eq!(index.last_key(), Some(500));
    }

    #[test]
    fn range_returns_inclusive_bounds() {
        let mut index = BPlusTreeIndex::new();
        for key in (2..=100).step_by(2) {
            index.insert(key, key as u64).unwrap();
        }
        let hits: Vec<Key> = index.range(9, 21).map(|(key, _)| key).collect();
        assert_eq!(hits, vec![10, 12, 14, 16, 18, 20]);

        let hits: Vec<Key> = index.range(10, 10).map(|(key, _)| key).collect();
        assert_eq!(hits, vec![10]);
        assert_eq!(index.range(101, 200).count(), 0);
        assert_eq!(index.range(-50, 1).count(), 0);

        // restartable
        assert_eq!(index.range(1, 100).count(), 50);
        assert_eq!(index.range(1, 100).count(), 50);
    }

    #[test]
    fn delete_is_leaf_local() {
        let mut index = BPlusTreeIndex::new();
        for key in 1..=30 {
            index.insert(key, key as u64).unwrap();
        }
        let nodes_before = index.node_count();
        let height_before = index.height();

        for key in 1..=20 {
            assert_eq!(index.delete(key), Some(key as u64));
        }
        assert_eq!(index.delete(5), None);
        assert_eq!(index.node_count(), nodes_before);
        assert_eq!(index.height(), height_before);
        assert_eq!(index.len(), 10);
        assert_eq!(keys(&index), (21..=30).collect::<Vec<_>>());
        index.check_invariants().unwrap();

        // emptied leaves still accept keys routed to them
        index.insert(3, 300).unwrap();
        index.insert(1, 100).unwrap();
        assert_eq!(index.find(3), Some(300));
        assert_eq!(index.first_key(), Some(1));
        index.check_invariants().unwrap();
    }

    #[test]
    fn wider_orders_split_at_capacity() {
        let mut index = BPlusTreeIndex::with_order(7).unwrap();
        for key in 1..=7 {
            index.insert(key, 0).unwrap();
        }
        assert_eq!(index.height(), 1);
        index.insert(8, 0).unwrap();
        assert_eq!(index.root_children(), 2);
        index.check_invariants().unwrap();

        assert!(BPlusTreeIndex::with_order(2).is_err());
    }

    #[test]
    fn zero_key_is_rejected() {
        let mut index = BPlusTreeIndex::new();
        assert!(index.insert(0, 0).is_err());
        assert!(index.is_empty());
    }
}
