mod codec;
mod error;
mod header;
mod node;
mod tree;

pub use error::BTreeError;
pub use node::{InternalNode, LeafNode, Node, Side};
pub use tree::{BPlusTree, TreeIterator};
