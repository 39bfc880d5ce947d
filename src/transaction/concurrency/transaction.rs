// Transaction: log chain, hooks and the commit/rollback protocol

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use log::{debug, error, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, PageId, TxnId, INVALID_LSN};
use crate::storage::buffer::{BufferManager, BufferPoolError};
use crate::transaction::operation::{encode_operation, LogOperation, OperationRegistry};
use crate::transaction::wal::{LogManager, LogManagerError, LogRecord, LogRecordType, OperationPayload};
use super::executor::PostCommitJob;
use super::hooks::{PostCommitHook, PreCommitHook};
use super::join::{JoinBarrier, JoinGuard, Vote, VoteOutcome};
use super::transaction_manager::TxManagerShared;

/// Attempts made to undo one log record before rollback gives up
pub const UNDO_RETRY_LIMIT: usize = 3;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    /// Undo in progress
    Rollback,
    Committed,
    RolledBack,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} cannot do this: {1}")]
    InvalidState(TxnId, String),

    #[error("Transaction {0} was aborted")]
    Aborted(TxnId),

    #[error("Transaction {0} was finished by another thread with a different outcome")]
    AlreadyFinished(TxnId),

    #[error("Log error: {0}")]
    Log(#[from] LogManagerError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferPoolError),

    #[error("Undo of LSN {lsn} failed {attempts} times: {source}")]
    UndoRetriesExhausted {
        lsn: Lsn,
        attempts: usize,
        #[source]
        source: Box<TransactionError>,
    },

    #[error("Unknown log operation tag {0}")]
    UnknownOperation(u8),

    #[error("Log operation codec error: {0}")]
    OperationCodec(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{} hook failure(s): {}", .0.len(), .0.join("; "))]
    HookFailed(Vec<String>),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

struct TransactionInner {
    state: TransactionState,
    /// Tail of this transaction's log chain
    prev_lsn: Lsn,
    /// Oldest log record this transaction may still need
    first_lsn: Lsn,
    pre_commit: Vec<Arc<dyn PreCommitHook>>,
    hook_groups: HashMap<String, Arc<dyn Any + Send + Sync>>,
    post_commit: Vec<Arc<dyn PostCommitHook>>,
    assigned: HashSet<PageId>,
}

/// A unit of work over the buffer manager, logged as one chain of records.
///
/// Transactions are shared as `Arc<Transaction>`: several threads may work on
/// one transaction after [`join`](Self::join)ing it, and the first thread
/// that votes through [`commit`](Self::commit) or [`rollback`](Self::rollback)
/// finishes it once all joined threads have left.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    read_only: bool,
    inner: Mutex<TransactionInner>,
    abort_requested: AtomicBool,
    join: JoinBarrier,
    shared: Arc<TxManagerShared>,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        isolation_level: IsolationLevel,
        read_only: bool,
        shared: Arc<TxManagerShared>,
    ) -> Self {
        Self {
            id,
            isolation_level,
            read_only,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Running,
                prev_lsn: INVALID_LSN,
                first_lsn: INVALID_LSN,
                pre_commit: Vec::new(),
                hook_groups: HashMap::new(),
                post_commit: Vec::new(),
                assigned: HashSet::new(),
            }),
            abort_requested: AtomicBool::new(false),
            join: JoinBarrier::new(),
            shared,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// LSN of the last record this transaction logged
    pub fn prev_lsn(&self) -> Lsn {
        self.inner.lock().prev_lsn
    }

    /// LSN of the first record this transaction logged
    pub fn first_lsn(&self) -> Lsn {
        self.inner.lock().first_lsn
    }

    /// Ask for the transaction to be rolled back when it tries to commit
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
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

    /// Join the calling thread to this transaction until the guard is dropped
    pub fn join(&self) -> JoinGuard<'_> {
        self.join.join()
    }

    pub fn joined_threads(&self) -> usize {
        self.join.joined_count()
    }

    // ---- logging ----

    /// Log an undoable change
    pub fn log_update(&self, op: &dyn LogOperation) -> Result<Lsn> {
        let payload = encode_operation(op)?;
        self.append(|txn_id, prev_lsn| LogRecord::new_update(txn_id, prev_lsn, payload))
    }

    /// Log a compensation record for an undone change
    pub fn log_clr(&self, op: &dyn LogOperation, undo_next: Lsn) -> Result<Lsn> {
        let payload = encode_operation(op)?;
        self.append(|txn_id, prev_lsn| LogRecord::new_clr(txn_id, prev_lsn, undo_next, payload))
    }

    /// Log a compensation record without a payload that only moves the undo chain
    pub fn log_dummy_clr(&self, undo_next: Lsn) -> Result<Lsn> {
        self.append(|txn_id, prev_lsn| LogRecord::new_dummy(txn_id, prev_lsn, undo_next))
    }

    /// Log a change that is redone at restart but never undone
    pub fn log_update_special(&self, op: &dyn LogOperation) -> Result<Lsn> {
        let payload = encode_operation(op)?;
        self.append(|txn_id, prev_lsn| LogRecord::new_update_special(txn_id, prev_lsn, payload))
    }

    /// Log the end of this transaction
    pub fn log_eot(&self) -> Result<Lsn> {
        self.append(LogRecord::new_eot)
    }

    fn append(&self, build: impl FnOnce(TxnId, Lsn) -> LogRecord) -> Result<Lsn> {
        if self.read_only {
            return Err(TransactionError::InvalidState(self.id, "read-only transactions cannot log".to_string()));
        }
        let mut inner = self.inner.lock();
        let record = build(self.id, inner.prev_lsn);
        let lsn = self.shared.log.append(&record)?;
        inner.prev_lsn = lsn;
        if inner.first_lsn == INVALID_LSN {
            inner.first_lsn = lsn;
        }
        Ok(lsn)
    }

    /// Adopt a record found for this transaction while scanning the log at restart
    pub(crate) fn restore_chain(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        inner.prev_lsn = lsn;
        if inner.first_lsn == INVALID_LSN {
            inner.first_lsn = lsn;
        }
    }

    // ---- hooks ----

    pub fn add_pre_commit_hook(&self, hook: Arc<dyn PreCommitHook>) {
        self.inner.lock().pre_commit.push(hook);
    }

    /// The pre-commit hook registered under `key`, created by `init` on first use.
    ///
    /// # Panics
    ///
    /// If `key` already holds a hook of another type.
    pub fn pre_commit_hook_for<H, F>(&self, key: &str, init: F) -> Arc<H>
    where
        H: PreCommitHook + 'static,
        F: FnOnce() -> H,
    {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.hook_groups.get(key) {
            return match Arc::clone(existing).downcast::<H>() {
                Ok(hook) => hook,
                Err(_) => panic!("hook group {:?} of transaction {} holds another hook type", key, self.id),
            };
        }
        let hook = Arc::new(init());
        inner
            .hook_groups
            .insert(key.to_string(), Arc::clone(&hook) as Arc<dyn Any + Send + Sync>);
        inner.pre_commit.push(Arc::clone(&hook) as Arc<dyn PreCommitHook>);
        hook
    }

    /// The pre-commit hook registered under `key`, if it has type `H`
    pub fn pre_commit_hook<H: PreCommitHook + 'static>(&self, key: &str) -> Option<Arc<H>> {
        let inner = self.inner.lock();
        let existing = inner.hook_groups.get(key)?;
        Arc::clone(existing).downcast::<H>().ok()
    }

    pub fn pre_commit_hook_count(&self) -> usize {
        self.inner.lock().pre_commit.len()
    }

    pub(crate) fn pre_commit_hooks(&self) -> Vec<Arc<dyn PreCommitHook>> {
        self.inner.lock().pre_commit.clone()
    }

    pub fn add_post_commit_hook(&self, hook: Arc<dyn PostCommitHook>) {
        self.inner.lock().post_commit.push(hook);
    }

    // ---- assigned pages ----

    pub(crate) fn add_assigned_page(&self, page_id: PageId) {
        self.inner.lock().assigned.insert(page_id);
    }

    pub(crate) fn take_assigned_pages(&self) -> Vec<PageId> {
        self.inner.lock().assigned.drain().collect()
    }

    pub fn assigned_page_count(&self) -> usize {
        self.inner.lock().assigned.len()
    }

    // ---- completion ----

    /// Commit: vote, run the pre-commit hooks, write and force the EOT,
    /// force the assigned pages, release locks, leave the transaction table
    /// and queue the post-commit hooks.
    pub fn commit(&self) -> Result<()> {
        match self.join.vote(Vote::Commit) {
            VoteOutcome::Lead => {}
            VoteOutcome::Follow { agreed: true, succeeded: true } => return Ok(()),
            VoteOutcome::Follow { .. } => return Err(TransactionError::AlreadyFinished(self.id)),
            VoteOutcome::Finished => return Err(self.finished_error()),
        }
        let result = self.finish_commit();
        self.publish(result.is_ok());
        result
    }

    /// Roll back: vote, abort the hooks, undo the log chain, write and force
    /// the EOT, release locks and leave the transaction table.
    pub fn rollback(&self) -> Result<()> {
        match self.join.vote(Vote::Rollback) {
            VoteOutcome::Lead => {}
            VoteOutcome::Follow { agreed: true, succeeded: true } => return Ok(()),
            VoteOutcome::Follow { .. } => return Err(TransactionError::AlreadyFinished(self.id)),
            VoteOutcome::Finished => return Err(self.finished_error()),
        }
        let result = self.finish_rollback();
        self.publish(result.is_ok());
        result
    }

    /// Tell the other voters how the finish went. A transaction left neither
    /// committed nor rolled back can be voted on again.
    fn publish(&self, succeeded: bool) {
        match self.state() {
            TransactionState::Committed | TransactionState::RolledBack => self.join.complete(succeeded),
            _ => self.join.reopen(),
        }
    }

    fn finished_error(&self) -> TransactionError {
        TransactionError::InvalidState(self.id, format!("already {:?}", self.state()))
    }

    fn finish_commit(&self) -> Result<()> {
        let state = self.state();
        if state != TransactionState::Running {
            return Err(TransactionError::InvalidState(self.id, format!("commit in state {:?}", state)));
        }
        if self.is_abort_requested() {
            self.finish_rollback()?;
            return Err(TransactionError::Aborted(self.id));
        }

        for hook in self.pre_commit_hooks() {
            if let Err(e) = hook.prepare(self) {
                warn!("Pre-commit hook of transaction {} failed, rolling back: {}", self.id, e);
                self.finish_rollback()?;
                return Err(e);
            }
        }

        if !self.read_only && self.prev_lsn() != INVALID_LSN {
            if let Err(e) = self.force_eot() {
                warn!("Could not log the end of transaction {}, rolling back: {}", self.id, e);
                if let Err(undo) = self.finish_rollback() {
                    error!("Rollback of transaction {} failed, it stays open: {}", self.id, undo);
                }
                return Err(e);
            }
        }
        let flushed = self.shared.buffer.flush_assigned(self);

        let post_commit = {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Committed;
            std::mem::take(&mut inner.post_commit)
        };
        self.shared.locks.release_all(self.id);
        self.shared.remove_active(self.id);
        if !post_commit.is_empty() {
            self.shared.executor.submit(
                &self.shared,
                PostCommitJob {
                    txn_id: self.id,
                    isolation_level: self.isolation_level,
                    hooks: post_commit,
                },
            );
        }
        debug!("Committed transaction {}", self.id);

        // The commit is durable; a failed page write only leaves the pages dirty
        if let Err(e) = flushed {
            warn!("Could not force the pages of committed transaction {}: {}", self.id, e);
        }
        Ok(())
    }

    fn finish_rollback(&self) -> Result<()> {
        let tail = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Running | TransactionState::Rollback => {}
                state => {
                    return Err(TransactionError::InvalidState(self.id, format!("rollback in state {:?}", state)));
                }
            }
            inner.state = TransactionState::Rollback;
            inner.prev_lsn
        };

        for hook in self.pre_commit_hooks() {
            hook.abort(self);
        }

        let mut next = tail;
        while next != INVALID_LSN {
            next = self.undo_record(next)?;
        }
        self.finish_undone(tail != INVALID_LSN)?;
        debug!("Rolled back transaction {}", self.id);
        Ok(())
    }

    /// Close a fully undone transaction: EOT, un-assign pages, release locks
    pub(crate) fn finish_undone(&self, logged: bool) -> Result<()> {
        if logged && !self.read_only {
            self.force_eot()?;
        }
        self.shared.buffer.unassign_all(self);
        {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::RolledBack;
            inner.post_commit.clear();
        }
        self.shared.locks.release_all(self.id);
        self.shared.remove_active(self.id);
        Ok(())
    }

    fn force_eot(&self) -> Result<()> {
        let eot = self.log_eot()?;
        self.shared.log.flush(eot)?;
        Ok(())
    }

    /// Undo the record at `lsn` and return the next LSN of the undo chain.
    ///
    /// Compensation and redo-only records are stepped over through their
    /// undo-next pointer.
    pub(crate) fn undo_record(&self, lsn: Lsn) -> Result<Lsn> {
        let record = self.shared.log.get(lsn)?;
        match record.record_type {
            LogRecordType::Clr | LogRecordType::Dummy | LogRecordType::UpdateSpecial => Ok(record.undo_next_lsn),
            LogRecordType::Eot => Ok(record.prev_lsn),
            LogRecordType::Update => {
                if let Some(payload) = &record.payload {
                    self.undo_payload(lsn, record.prev_lsn, payload)?;
                }
                Ok(record.prev_lsn)
            }
        }
    }

    fn undo_payload(&self, lsn: Lsn, undo_next: Lsn, payload: &OperationPayload) -> Result<()> {
        let op = self.shared.registry.decode(payload)?;
        let mut attempt = 1;
        loop {
            match op.undo(self, lsn, undo_next) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= UNDO_RETRY_LIMIT => {
                    return Err(TransactionError::UndoRetriesExhausted {
                        lsn,
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!("Undo of LSN {} failed (attempt {}): {}", lsn, attempt, e);
                    attempt += 1;
                }
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("read_only", &self.read_only)
            .field("prev_lsn", &inner.prev_lsn)
            .field("first_lsn", &inner.first_lsn)
            .finish()
    }
}
