mod deadlock;
mod lock_manager;
mod transaction;
mod transaction_manager;

pub use deadlock::WaitsForGraph;
pub use lock_manager::LockManager;
pub use transaction::{
    AbortReason, IsolationLevel, LockMode, Transaction, TransactionAbort, TransactionState,
};
pub use transaction_manager::{TransactionError, TransactionManager};
