pub mod bplus_tree;
pub mod iterator;
pub mod side_file;

pub use bplus_tree::{BPlusTreeIndex, NodeId};
pub use iterator::RangeIter;
pub use side_file::{IndexSideFile, SideEntry};

/// Default branching factor: a node splits once it holds this many keys.
pub const ORDER: usize = 4;
