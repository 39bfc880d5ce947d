use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Lsn, TxnId, INVALID_LSN};
use crate::storage::buffer::BufferManager;
use crate::transaction::operation::OperationRegistry;
use crate::transaction::wal::LogManager;
use super::executor::PostCommitExecutor;
use super::lock::LockService;
use super::transaction::{IsolationLevel, Transaction};

/// State shared by the manager and every transaction it created
pub(crate) struct TxManagerShared {
    pub buffer: Arc<BufferManager>,
    pub log: Arc<LogManager>,
    pub registry: OperationRegistry,
    pub locks: Arc<dyn LockService>,
    next_txn_id: AtomicU32,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    pub executor: PostCommitExecutor,
}

impl TxManagerShared {
    pub fn begin(shared: &Arc<Self>, isolation_level: IsolationLevel, read_only: bool) -> Arc<Transaction> {
        let txn_id = shared.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Self::register(shared, txn_id, isolation_level, read_only)
    }

    fn register(shared: &Arc<Self>, txn_id: TxnId, isolation_level: IsolationLevel, read_only: bool) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(txn_id, isolation_level, read_only, Arc::clone(shared)));
        shared.active.lock().insert(txn_id, Arc::clone(&txn));
        debug!("Began transaction {}", txn_id);
        txn
    }

    pub fn remove_active(&self, txn_id: TxnId) {
        self.active.lock().remove(&txn_id);
    }
}

/// Transaction manager - creates transactions and tracks the active ones
pub struct TransactionManager {
    shared: Arc<TxManagerShared>,
}

impl TransactionManager {
    pub fn new(
        buffer: Arc<BufferManager>,
        log: Arc<LogManager>,
        registry: OperationRegistry,
        locks: Arc<dyn LockService>,
    ) -> Self {
        let shared = Arc::new(TxManagerShared {
            buffer,
            log,
            registry,
            locks,
            next_txn_id: AtomicU32::new(1),
            active: Mutex::new(HashMap::new()),
            executor: PostCommitExecutor::new(),
        });
        shared.executor.start(Arc::downgrade(&shared));
        Self { shared }
    }

    /// Begin a new read-write transaction
    pub fn begin_transaction(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        TxManagerShared::begin(&self.shared, isolation_level, false)
    }

    /// Begin a transaction that may not log
    pub fn begin_read_only(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        TxManagerShared::begin(&self.shared, isolation_level, true)
    }

    /// Recreate a transaction found in the log at restart
    pub(crate) fn resurrect(&self, txn_id: TxnId) -> Arc<Transaction> {
        if let Some(txn) = self.get_transaction(txn_id) {
            return txn;
        }
        self.shared.next_txn_id.fetch_max(txn_id + 1, Ordering::SeqCst);
        TxManagerShared::register(&self.shared, txn_id, IsolationLevel::default(), false)
    }

    /// Make sure new transaction ids are above `txn_id`
    pub(crate) fn reserve_txn_ids(&self, txn_id: TxnId) {
        self.shared.next_txn_id.fetch_max(txn_id + 1, Ordering::SeqCst);
    }

    /// Drop a transaction from the table without finishing it
    pub(crate) fn forget(&self, txn_id: TxnId) {
        self.shared.remove_active(txn_id);
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.shared.active.lock().get(&txn_id).cloned()
    }

    pub fn transaction_exists(&self, txn_id: TxnId) -> bool {
        self.shared.active.lock().contains_key(&txn_id)
    }

    pub fn get_active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.shared.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Oldest first LSN over the active transactions that logged anything
    pub fn min_first_lsn(&self) -> Option<Lsn> {
        let active: Vec<Arc<Transaction>> = self.shared.active.lock().values().cloned().collect();
        active
            .iter()
            .map(|txn| txn.first_lsn())
            .filter(|&lsn| lsn != INVALID_LSN)
            .min()
    }

    /// Block until every queued post-commit hook has run
    pub fn wait_for_post_commit(&self) {
        self.shared.executor.wait_idle();
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.shared.buffer
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.shared.log
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.shared.registry
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.shared.executor.shutdown();
        // Transactions still active are abandoned, exactly as in a crash
        self.shared.active.lock().clear();
    }
}
