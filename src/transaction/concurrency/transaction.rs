use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Hierarchical lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Why the lock manager aborted a transaction
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("shared lock requested under READ UNCOMMITTED")]
    LockSharedOnReadUncommitted,

    #[error("lock requested while shrinking")]
    LockOnShrinking,

    #[error("another upgrade is already pending on this resource")]
    UpgradeConflict,

    #[error("requested mode is not an upgrade of the held mode")]
    IncompatibleUpgrade,

    #[error("unlock attempted without a held lock")]
    AttemptedUnlockButNoLockHeld,

    #[error("row lock requested without a covering table lock")]
    TableLockNotPresent,

    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,

    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// Error raised by lock operations that abort their transaction. The
/// transaction's state is set to Aborted before this is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// Currently held locks, broken down by mode and granularity
#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

/// An active database transaction: identity, isolation level, 2PL state and
/// the set of locks it holds. Shared between caller threads and the
/// deadlock detector behind an `Arc`.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    abort_reason: Mutex<Option<AbortReason>>,
    locks: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            abort_reason: Mutex::new(None),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Reason this transaction was aborted, if it was
    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort_reason.lock()
    }

    /// Mark aborted with a reason; keeps the first reason on repeat calls
    pub(crate) fn mark_aborted(&self, reason: AbortReason) {
        let mut stored = self.abort_reason.lock();
        if stored.is_none() {
            *stored = Some(reason);
        }
        *self.state.lock() = TransactionState::Aborted;
    }

    pub fn holds_table_lock(&self, oid: TableOid, mode: LockMode) -> bool {
        let locks = self.locks.lock();
        Self::table_set(&locks, mode).contains(&oid)
    }

    pub fn holds_row_lock(&self, oid: TableOid, rid: Rid, mode: LockMode) -> bool {
        let locks = self.locks.lock();
        match mode {
            LockMode::Shared => locks
                .shared_rows
                .get(&oid)
                .is_some_and(|rows| rows.contains(&rid)),
            LockMode::Exclusive => locks
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| rows.contains(&rid)),
            _ => false,
        }
    }

    /// Whether this transaction still holds any row locks on the table;
    /// used to reject unlocking a table under its rows
    pub fn has_row_locks_on(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || locks.exclusive_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
    }

    /// A row X lock requires X, IX or SIX on the covering table
    pub fn can_lock_row_exclusive(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.exclusive_tables.contains(&oid)
            || locks.intention_exclusive_tables.contains(&oid)
            || locks.shared_intention_exclusive_tables.contains(&oid)
    }

    pub(crate) fn record_table_lock(&self, oid: TableOid, mode: LockMode, held: bool) {
        let mut locks = self.locks.lock();
        let set = Self::table_set_mut(&mut locks, mode);
        if held {
            set.insert(oid);
        } else {
            set.remove(&oid);
        }
    }

    pub(crate) fn record_row_lock(&self, oid: TableOid, rid: Rid, mode: LockMode, held: bool) {
        let mut locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("row locks are only shared or exclusive"),
        };
        if held {
            rows.entry(oid).or_default().insert(rid);
        } else if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    /// Drain every held lock, returning them for bulk release at
    /// commit/abort time
    pub(crate) fn take_all_locks(&self) -> (Vec<(TableOid, LockMode)>, Vec<(TableOid, Rid, LockMode)>) {
        let mut locks = self.locks.lock();
        let mut tables = Vec::new();
        let mut rows = Vec::new();

        for (oid, rids) in locks.shared_rows.drain() {
            rows.extend(rids.into_iter().map(|rid| (oid, rid, LockMode::Shared)));
        }
        for (oid, rids) in locks.exclusive_rows.drain() {
            rows.extend(rids.into_iter().map(|rid| (oid, rid, LockMode::Exclusive)));
        }
        for oid in locks.shared_tables.drain() {
            tables.push((oid, LockMode::Shared));
        }
        for oid in locks.exclusive_tables.drain() {
            tables.push((oid, LockMode::Exclusive));
        }
        for oid in locks.intention_shared_tables.drain() {
            tables.push((oid, LockMode::IntentionShared));
        }
        for oid in locks.intention_exclusive_tables.drain() {
            tables.push((oid, LockMode::IntentionExclusive));
        }
        for oid in locks.shared_intention_exclusive_tables.drain() {
            tables.push((oid, LockMode::SharedIntentionExclusive));
        }

        (tables, rows)
    }

    fn table_set(locks: &LockSets, mode: LockMode) -> &HashSet<TableOid> {
        match mode {
            LockMode::Shared => &locks.shared_tables,
            LockMode::Exclusive => &locks.exclusive_tables,
            LockMode::IntentionShared => &locks.intention_shared_tables,
            LockMode::IntentionExclusive => &locks.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &locks.shared_intention_exclusive_tables,
        }
    }

    fn table_set_mut(locks: &mut LockSets, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut locks.shared_tables,
            LockMode::Exclusive => &mut locks.exclusive_tables,
            LockMode::IntentionShared => &mut locks.intention_shared_tables,
            LockMode::IntentionExclusive => &mut locks.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut locks.shared_intention_exclusive_tables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.abort_reason(), None);
    }

    #[test]
    fn test_mark_aborted_keeps_first_reason() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        txn.mark_aborted(AbortReason::Deadlock);
        txn.mark_aborted(AbortReason::LockOnShrinking);
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.abort_reason(), Some(AbortReason::Deadlock));
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        txn.record_table_lock(10, LockMode::IntentionExclusive, true);
        assert!(txn.holds_table_lock(10, LockMode::IntentionExclusive));
        assert!(!txn.holds_table_lock(10, LockMode::Exclusive));
        assert!(txn.can_lock_row_exclusive(10));

        let rid = Rid::new(1, 7);
        txn.record_row_lock(10, rid, LockMode::Exclusive, true);
        assert!(txn.holds_row_lock(10, rid, LockMode::Exclusive));
        assert!(txn.has_row_locks_on(10));

        txn.record_row_lock(10, rid, LockMode::Exclusive, false);
        assert!(!txn.has_row_locks_on(10));

        txn.record_table_lock(10, LockMode::IntentionExclusive, false);
        assert!(!txn.can_lock_row_exclusive(10));
    }

    #[test]
    fn test_take_all_locks_drains_everything() {
        let txn = Transaction::new(4, IsolationLevel::RepeatableRead);
        txn.record_table_lock(1, LockMode::IntentionExclusive, true);
        txn.record_table_lock(2, LockMode::Shared, true);
        txn.record_row_lock(1, Rid::new(0, 1), LockMode::Exclusive, true);

        let (tables, rows) = txn.take_all_locks();
        assert_eq!(tables.len(), 2);
        assert_eq!(rows.len(), 1);
        assert!(!txn.has_row_locks_on(1));
        assert!(!txn.holds_table_lock(2, LockMode::Shared));
    }
}
