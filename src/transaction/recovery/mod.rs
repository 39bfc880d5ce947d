//! Restart recovery: one forward analysis+redo scan, loser finalization,
//! a global undo pass in descending LSN order, then a checkpoint.

pub mod transaction_table;

use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use thiserror::Error;

use crate::common::types::{Lsn, TxnId, INVALID_LSN};
use crate::storage::buffer::BufferPoolError;
use crate::storage::disk::StorageError;
use crate::transaction::concurrency::{PostRedoHook, TransactionError, TransactionManager};
use crate::transaction::wal::{LogManagerError, LogRecordType};

pub use transaction_table::{TableEntry, TransactionTable};

/// Error type for recovery operations
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Log manager error: {0}")]
    Log(#[from] LogManagerError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferPoolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// What a restart did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// LSN the redo scan started at
    pub start_lsn: Lsn,
    pub records_scanned: usize,
    pub records_redone: usize,
    pub records_undone: usize,
    /// Transactions that had to be rolled back
    pub losers: usize,
    pub post_redo_hooks: usize,
    /// First LSN retained by the closing checkpoint
    pub checkpoint_lsn: Lsn,
    pub duration: Duration,
}

/// Manager for crash recovery and checkpoints
pub struct RecoveryManager<'a> {
    txns: &'a TransactionManager,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(txns: &'a TransactionManager) -> Self {
        Self { txns }
    }

    /// Bring the buffer and storage back to the last committed state.
    ///
    /// Running it again over the same log, after a crash in the middle of a
    /// previous run included, yields the same state.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let started = Instant::now();
        let log = self.txns.log();
        let mut stats = RecoveryStats {
            start_lsn: log.first_lsn(),
            ..RecoveryStats::default()
        };
        info!("Starting recovery at LSN {}", stats.start_lsn);

        let mut table = TransactionTable::new();
        let post_redo = self.redo_pass(&mut table, &mut stats)?;
        info!(
            "Redo pass done: {} records scanned, {} redone, {} transactions left open",
            stats.records_scanned,
            stats.records_redone,
            table.len()
        );

        stats.post_redo_hooks = post_redo.len();
        for (_, hook) in post_redo {
            if let Err(e) = hook.execute() {
                warn!("Post-redo hook failed: {}", e);
            }
        }
        self.txns.buffer().clear_redo_reallocations();

        stats.losers = table.len();
        for tx in table.transactions() {
            for hook in tx.pre_commit_hooks() {
                hook.abort(&tx);
            }
        }
        for entry in table.take_finished() {
            debug!("Transaction {} has nothing to undo", entry.tx.id());
            entry.tx.finish_undone(true)?;
        }
        self.undo_pass(&mut table, &mut stats)?;

        self.txns.buffer().flush_all()?;
        log.flush_all()?;
        stats.checkpoint_lsn = self.checkpoint()?;
        stats.duration = started.elapsed();
        info!(
            "Recovery finished in {:?}: {} losers, {} records undone",
            stats.duration, stats.losers, stats.records_undone
        );
        Ok(stats)
    }

    /// Forward scan replaying every retained record in LSN order.
    ///
    /// Returns the post-redo work of the transactions found committed.
    fn redo_pass(
        &self,
        table: &mut TransactionTable,
        stats: &mut RecoveryStats,
    ) -> Result<Vec<(TxnId, Arc<dyn PostRedoHook>)>> {
        let log = self.txns.log();
        let registry = self.txns.registry();
        let mut post_redo: Vec<(TxnId, Arc<dyn PostRedoHook>)> = Vec::new();
        let mut max_txn_id: TxnId = 0;

        for record in log.iter_from(log.first_lsn()) {
            let record = record?;
            stats.records_scanned += 1;
            max_txn_id = max_txn_id.max(record.txn_id);

            if record.record_type == LogRecordType::Eot {
                if let Some(entry) = table.remove(record.txn_id) {
                    for hook in entry.tx.pre_commit_hooks() {
                        post_redo.extend(hook.recovered_commit().map(|work| (record.txn_id, work)));
                    }
                    self.txns.forget(record.txn_id);
                }
                continue;
            }

            if !table.contains(record.txn_id) {
                // Records after an EOT belong to a commit that failed and was rolled back
                post_redo.retain(|(txn_id, _)| *txn_id != record.txn_id);
            }
            let entry = table.entry(self.txns, record.txn_id);
            entry.tx.restore_chain(record.lsn);
            entry.undo_next = match record.record_type {
                LogRecordType::Update => record.lsn,
                _ => record.undo_next_lsn,
            };

            if let Some(payload) = &record.payload {
                let op = registry.decode(payload)?;
                op.redo(&entry.tx, record.lsn)?;
                stats.records_redone += 1;
            }
        }

        self.txns.reserve_txn_ids(max_txn_id);
        Ok(post_redo)
    }

    /// Undo the losers one record at a time, always picking the most recent
    /// record across all of them
    fn undo_pass(&self, table: &mut TransactionTable, stats: &mut RecoveryStats) -> Result<()> {
        while let Some(txn_id) = table.max_undo_next() {
            let Some(entry) = table.get_mut(txn_id) else {
                break;
            };
            let next = entry.tx.undo_record(entry.undo_next)?;
            stats.records_undone += 1;
            if next != INVALID_LSN {
                entry.undo_next = next;
                continue;
            }

            let tx = Arc::clone(&entry.tx);
            table.remove(txn_id);
            tx.finish_undone(true)?;
            debug!("Rolled back loser transaction {}", txn_id);
        }
        Ok(())
    }

    /// Force everything needed to restart without the older log, then cut
    /// the log. Returns the first LSN still retained.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.txns.wait_for_post_commit();
        let log = self.txns.log();
        let buffer = self.txns.buffer();

        let mut bound = log.next_lsn();
        if let Some(lsn) = self.txns.min_first_lsn() {
            bound = bound.min(lsn);
        }
        if let Some(lsn) = buffer.min_redo_lsn() {
            bound = bound.min(lsn);
        }

        buffer.sync_storage()?;
        log.flush_all()?;
        let first = log.truncate_to(bound)?;
        info!("Checkpoint at LSN {}, log retained from LSN {}", bound, first);
        Ok(first)
    }
}
