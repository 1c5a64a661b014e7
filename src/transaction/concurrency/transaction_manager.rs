use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is not active")]
    NotActive(TxnId),
}

/// Creates and tracks transactions, and drives the strict-2PL release
/// point: commit and abort hand every held lock back to the lock manager.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new transaction with a fresh monotonically increasing id
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.lock().insert(txn_id, Arc::clone(&txn));
        txn
    }

    /// Commit: release every held lock and retire the transaction. Fails if
    /// the transaction was already aborted or finished.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Growing | TransactionState::Shrinking => {}
            _ => return Err(TransactionError::NotActive(txn.id())),
        }
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all(txn);
        self.retire(txn.id());
        Ok(())
    }

    /// Abort: mark aborted (waking any in-flight lock waits), release every
    /// held lock and retire the transaction
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(txn);
        self.retire(txn.id());
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        self.active.lock().keys().copied().collect()
    }

    fn retire(&self, txn_id: TxnId) {
        self.active.lock().remove(&txn_id);
        self.lock_manager.forget_txn(txn_id);
    }
}
