use std::collections::HashMap;
use std::sync::Arc;

use crate::common::types::{Lsn, TxnId, INVALID_LSN};
use crate::transaction::concurrency::{Transaction, TransactionManager};

/// A transaction seen in the log and not yet ended
pub struct TableEntry {
    pub tx: Arc<Transaction>,
    /// Next record to undo if the transaction turns out to be a loser
    pub undo_next: Lsn,
}

/// Transactions live during restart, keyed by id and created on first sight
#[derive(Default)]
pub struct TransactionTable {
    entries: HashMap<TxnId, TableEntry>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `txn_id`, resurrecting the transaction if needed
    pub fn entry(&mut self, txns: &TransactionManager, txn_id: TxnId) -> &mut TableEntry {
        self.entries.entry(txn_id).or_insert_with(|| TableEntry {
            tx: txns.resurrect(txn_id),
            undo_next: INVALID_LSN,
        })
    }

    pub fn get_mut(&mut self, txn_id: TxnId) -> Option<&mut TableEntry> {
        self.entries.get_mut(&txn_id)
    }

    pub fn remove(&mut self, txn_id: TxnId) -> Option<TableEntry> {
        self.entries.remove(&txn_id)
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.entries.contains_key(&txn_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.entries.values().map(|entry| Arc::clone(&entry.tx)).collect()
    }

    /// Remove and return the entries with nothing left to undo
    pub fn take_finished(&mut self) -> Vec<TableEntry> {
        let finished: Vec<TxnId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.undo_next == INVALID_LSN)
            .map(|(&txn_id, _)| txn_id)
            .collect();
        finished
            .into_iter()
            .filter_map(|txn_id| self.entries.remove(&txn_id))
            .collect()
    }

    /// The transaction whose next record to undo is the most recent in the log
    pub fn max_undo_next(&self) -> Option<TxnId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.undo_next != INVALID_LSN)
            .max_by_key(|(_, entry)| entry.undo_next)
            .map(|(&txn_id, _)| txn_id)
    }
}
