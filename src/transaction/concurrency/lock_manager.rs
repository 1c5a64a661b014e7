use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::deadlock::WaitsForGraph;
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, LockMode, Transaction, TransactionAbort, TransactionState,
};

/// One entry in a resource's lock queue
#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct QueueInner {
    requests: Vec<LockRequest>,
    /// Transaction with a pending upgrade, if any; at most one per queue
    upgrading: Option<TxnId>,
}

struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            cv: Condvar::new(),
        }
    }
}

/// Hierarchical strict two-phase lock manager over tables and rows.
/// Requests wait on per-queue condition variables until they are compatible
/// with every earlier request; a background detector breaks waits-for
/// cycles by aborting the youngest transaction in each.
pub struct LockManager {
    table_locks: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_locks: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    /// Transactions seen by the lock manager, for the detector's benefit
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    detection_interval: Duration,
    running: AtomicBool,
}

impl LockManager {
    pub fn new(detection_interval: Duration) -> Self {
        Self {
            table_locks: Mutex::new(HashMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
            detection_interval,
            running: AtomicBool::new(true),
        }
    }

    /// Acquire a table lock. Ok(true) on grant, Ok(false) if the
    /// transaction was aborted while waiting, Err on a pre-flight abort.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        if let Some(result) = self.reraise_if_aborted(txn) {
            return result;
        }
        self.preflight(txn, mode)?;
        self.register_txn(txn);

        let queue = {
            let mut map = self.table_locks.lock();
            Arc::clone(map.entry(oid).or_insert_with(|| Arc::new(LockRequestQueue::new())))
        };

        let outcome = self.acquire(txn, &queue, mode, |txn, mode, held| {
            txn.record_table_lock(oid, mode, held)
        })?;
        Ok(outcome)
    }

    /// Release a table lock, applying the shrinking transition
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<bool, TransactionAbort> {
        let queue = {
            let map = self.table_locks.lock();
            match map.get(&oid) {
                Some(queue) => Arc::clone(queue),
                None => return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
            }
        };

        // Row locks must go before their table lock
        if txn.has_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mut inner = queue.inner.lock();
        let pos = inner
            .requests
            .iter()
            .position(|r| r.granted && r.txn_id == txn.id());
        match pos {
            Some(pos) => {
                let mode = inner.requests[pos].mode;
                inner.requests.remove(pos);
                drop(inner);
                self.shrink_on_unlock(txn, mode);
                txn.record_table_lock(oid, mode, false);
                queue.cv.notify_all();
                Ok(true)
            }
            None => {
                drop(inner);
                Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
            }
        }
    }

    /// Acquire a row lock; rows support only S and X
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        assert!(
            matches!(mode, LockMode::Shared | LockMode::Exclusive),
            "row locks are only shared or exclusive"
        );
        if let Some(result) = self.reraise_if_aborted(txn) {
            return result;
        }
        self.preflight(txn, mode)?;
        if mode == LockMode::Exclusive && !txn.can_lock_row_exclusive(oid) {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }
        self.register_txn(txn);

        let queue = {
            let mut map = self.row_locks.lock();
            Arc::clone(map.entry(rid).or_insert_with(|| Arc::new(LockRequestQueue::new())))
        };

        let outcome = self.acquire(txn, &queue, mode, |txn, mode, held| {
            txn.record_row_lock(oid, rid, mode, held)
        })?;
        Ok(outcome)
    }

    /// Release a row lock, applying the shrinking transition
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        let queue = {
            let map = self.row_locks.lock();
            match map.get(&rid) {
                Some(queue) => Arc::clone(queue),
                None => return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
            }
        };

        let mut inner = queue.inner.lock();
        let pos = inner
            .requests
            .iter()
            .position(|r| r.granted && r.txn_id == txn.id());
        match pos {
            Some(pos) => {
                let mode = inner.requests[pos].mode;
                inner.requests.remove(pos);
                drop(inner);
                self.shrink_on_unlock(txn, mode);
                txn.record_row_lock(oid, rid, mode, false);
                queue.cv.notify_all();
                Ok(true)
            }
            None => {
                drop(inner);
                Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
            }
        }
    }

    /// Queue discipline shared by table and row acquisition: duplicate
    /// grant short-circuits, an upgrade replaces the old grant ahead of the
    /// waiters, then the request waits until it is compatible with every
    /// earlier entry.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        mode: LockMode,
        record: impl Fn(&Transaction, LockMode, bool),
    ) -> Result<bool, TransactionAbort> {
        let mut inner = queue.inner.lock();

        let mut upgrade = false;
        if let Some(pos) = inner.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held = inner.requests[pos];
            if held.mode == mode {
                return Ok(true);
            }
            if inner.upgrading.is_some() {
                drop(inner);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !upgrade_allowed(held.mode, mode) {
                drop(inner);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            inner.requests.remove(pos);
            record(txn, held.mode, false);
            upgrade = true;
        }

        let request = LockRequest {
            txn_id: txn.id(),
            mode,
            granted: false,
        };
        if upgrade {
            // Upgrades jump ahead of every not-yet-granted request
            let pos = inner
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(inner.requests.len());
            inner.requests.insert(pos, request);
            inner.upgrading = Some(txn.id());
        } else {
            inner.requests.push(request);
        }

        loop {
            if grantable(&inner, txn.id()) {
                break;
            }
            queue.cv.wait(&mut inner);
            if txn.state() == TransactionState::Aborted {
                // Woken by the deadlock detector (or an aborting peer op):
                // withdraw the request and give the queue another look
                if let Some(pos) = inner
                    .requests
                    .iter()
                    .position(|r| r.txn_id == txn.id() && !r.granted)
                {
                    inner.requests.remove(pos);
                }
                if upgrade && inner.upgrading == Some(txn.id()) {
                    inner.upgrading = None;
                }
                drop(inner);
                queue.cv.notify_all();
                return Ok(false);
            }
        }

        let request = inner
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn.id())
            .expect("request vanished from its queue");
        request.granted = true;
        record(txn, mode, true);
        if upgrade {
            inner.upgrading = None;
        }
        drop(inner);

        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    /// Isolation-level pre-flight checks; failures abort the transaction
    fn preflight(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<(), TransactionAbort> {
        let shared_flavored = matches!(
            mode,
            LockMode::Shared | LockMode::IntentionShared | LockMode::SharedIntentionExclusive
        );
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if shared_flavored {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, LockMode::IntentionShared | LockMode::Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Lock calls by an already-aborted transaction are no-ops: they
    /// re-raise the stored reason, or plainly refuse when there is none
    fn reraise_if_aborted(&self, txn: &Arc<Transaction>) -> Option<Result<bool, TransactionAbort>> {
        if txn.state() != TransactionState::Aborted {
            return None;
        }
        Some(match txn.abort_reason() {
            Some(reason) => Err(TransactionAbort {
                txn_id: txn.id(),
                reason,
            }),
            None => Ok(false),
        })
    }

    /// Releasing X (any level), or S under REPEATABLE READ, ends the
    /// growing phase
    fn shrink_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        let shrink = match mode {
            LockMode::Exclusive => true,
            LockMode::Shared => txn.isolation_level() == IsolationLevel::RepeatableRead,
            _ => false,
        };
        if shrink && txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        txn.mark_aborted(reason);
        TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn register_txn(&self, txn: &Arc<Transaction>) {
        self.txns
            .lock()
            .entry(txn.id())
            .or_insert_with(|| Arc::clone(txn));
    }

    /// Forget a finished transaction; called by the transaction manager
    pub(crate) fn forget_txn(&self, txn_id: TxnId) {
        self.txns.lock().remove(&txn_id);
    }

    /// Release every lock the transaction still holds, without shrinking
    /// transitions or abort checks. This is the strict-2PL release point,
    /// driven by commit and abort.
    pub(crate) fn release_all(&self, txn: &Transaction) {
        let (tables, rows) = txn.take_all_locks();

        for (_oid, rid, _mode) in rows {
            let queue = {
                let map = self.row_locks.lock();
                map.get(&rid).cloned()
            };
            if let Some(queue) = queue {
                let mut inner = queue.inner.lock();
                inner.requests.retain(|r| r.txn_id != txn.id());
                drop(inner);
                queue.cv.notify_all();
            }
        }
        for (oid, _mode) in tables {
            let queue = {
                let map = self.table_locks.lock();
                map.get(&oid).cloned()
            };
            if let Some(queue) = queue {
                let mut inner = queue.inner.lock();
                inner.requests.retain(|r| r.txn_id != txn.id());
                drop(inner);
                queue.cv.notify_all();
            }
        }
    }

    /// Snapshot the current waits-for graph: each waiting request has an
    /// edge to every granted request in its queue
    pub fn waits_for(&self) -> WaitsForGraph {
        let mut graph = WaitsForGraph::new();
        let tables = self.table_locks.lock();
        let rows = self.row_locks.lock();
        for queue in tables.values().chain(rows.values()) {
            let inner = queue.inner.lock();
            let granted: Vec<TxnId> = inner
                .requests
                .iter()
                .filter(|r| r.granted)
                .map(|r| r.txn_id)
                .collect();
            for request in inner.requests.iter().filter(|r| !r.granted) {
                for &holder in &granted {
                    graph.add_edge(request.txn_id, holder);
                }
            }
        }
        graph
    }

    /// One detection pass: build the graph, then repeatedly abort the
    /// youngest member of each cycle and wake its queues until acyclic
    pub fn detect_deadlocks(&self) {
        let mut waiting_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();
        let mut graph = WaitsForGraph::new();
        {
            let tables = self.table_locks.lock();
            let rows = self.row_locks.lock();
            for queue in tables.values().chain(rows.values()) {
                let inner = queue.inner.lock();
                let granted: Vec<TxnId> = inner
                    .requests
                    .iter()
                    .filter(|r| r.granted)
                    .map(|r| r.txn_id)
                    .collect();
                for request in inner.requests.iter().filter(|r| !r.granted) {
                    for &holder in &granted {
                        graph.add_edge(request.txn_id, holder);
                    }
                    waiting_queues
                        .entry(request.txn_id)
                        .or_default()
                        .push(Arc::clone(queue));
                }
            }
        }

        while let Some(cycle) = graph.find_cycle() {
            let victim = *cycle.iter().max().expect("cycles are non-empty");
            warn!(
                "deadlock among transactions {:?}; aborting youngest {}",
                cycle, victim
            );
            let txn = self.txns.lock().get(&victim).cloned();
            if let Some(txn) = txn {
                txn.mark_aborted(AbortReason::Deadlock);
            }
            graph.remove_txn(victim);

            // Wake every queue the victim waits in so it observes the abort
            if let Some(queues) = waiting_queues.remove(&victim) {
                for queue in queues {
                    let _inner = queue.inner.lock();
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// Spawn the periodic background detector. The thread exits when the
    /// manager is dropped or `shutdown` is called.
    pub fn spawn_deadlock_detector(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.detection_interval;
        thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                match weak.upgrade() {
                    Some(lock_manager) => {
                        if !lock_manager.running.load(Ordering::Acquire) {
                            break;
                        }
                        lock_manager.detect_deadlocks();
                    }
                    None => break,
                }
            })
            .expect("failed to spawn deadlock detector")
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// The compatibility matrix
fn compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
        (IntentionShared, _) | (_, IntentionShared) => true,
        (IntentionExclusive, IntentionExclusive) => true,
        (Shared, Shared) => true,
        _ => false,
    }
}

/// The upgrade lattice: IS → {S, X, IX, SIX}, S → {X, SIX},
/// IX → {X, SIX}, SIX → {X}
fn upgrade_allowed(from: LockMode, to: LockMode) -> bool {
    use LockMode::*;
    match from {
        IntentionShared => !matches!(to, IntentionShared),
        Shared | IntentionExclusive => matches!(to, Exclusive | SharedIntentionExclusive),
        SharedIntentionExclusive => matches!(to, Exclusive),
        Exclusive => false,
    }
}

/// A request can be granted iff it is compatible with every request ahead
/// of it, granted or not
fn grantable(inner: &QueueInner, txn_id: TxnId) -> bool {
    let mode = inner
        .requests
        .iter()
        .find(|r| r.txn_id == txn_id)
        .expect("request vanished from its queue")
        .mode;
    for request in &inner.requests {
        if request.txn_id == txn_id {
            return true;
        }
        if !compatible(request.mode, mode) {
            return false;
        }
    }
    unreachable!("request vanished from its queue")
}
