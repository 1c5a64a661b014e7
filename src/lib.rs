// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BPlusTree, BTreeError, TreeIterator};
pub use storage::buffer::{BufferPoolManager, BufferPoolError};
pub use transaction::concurrency::{
    IsolationLevel, LockManager, LockMode, Transaction, TransactionManager,
};
