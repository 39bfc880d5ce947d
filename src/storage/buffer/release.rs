//! Deferred physical release of deleted pages and dropped units.
//!
//! A deferred delete is logged right away but the storage is only freed
//! after the deleting transaction is durably committed, or after redo at
//! restart when the commit survived a crash but the release did not.

use std::sync::Arc;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::types::{Lsn, PageId, UnitId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::manager::BufferManager;
use crate::transaction::concurrency::hooks::{PostCommitHook, PostRedoHook, PreCommitHook};
use crate::transaction::concurrency::{Transaction, TransactionError};

/// Hook group key under which a transaction collects the releases of one unit
pub fn release_group_key(unit: UnitId) -> String {
    format!("release:{}", unit)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseEntry {
    Page { page_id: PageId, unit: UnitId, lsn: Lsn },
    Unit { unit: UnitId, lsn: Lsn },
}

/// Pre-commit hook collecting the deferred releases of one unit.
///
/// On prepare it schedules its [`ReleaseSet`] as a post-commit hook; when
/// found in a committed transaction during restart it turns into a
/// post-redo hook instead.
pub struct DeferredRelease {
    set: Arc<ReleaseSet>,
}

impl DeferredRelease {
    pub fn new(buffer: Arc<BufferManager>) -> Self {
        Self {
            set: Arc::new(ReleaseSet {
                buffer,
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn add(&self, entry: ReleaseEntry) {
        self.set.entries.lock().push(entry);
    }

    pub fn remove_page(&self, page_id: PageId) {
        self.set
            .entries
            .lock()
            .retain(|entry| !matches!(entry, ReleaseEntry::Page { page_id: p, .. } if *p == page_id));
    }

    pub fn remove_unit(&self, unit: UnitId) {
        self.set
            .entries
            .lock()
            .retain(|entry| !matches!(entry, ReleaseEntry::Unit { unit: u, .. } if *u == unit));
    }

    pub fn entries(&self) -> Vec<ReleaseEntry> {
        self.set.entries.lock().clone()
    }
}

impl PreCommitHook for DeferredRelease {
    fn prepare(&self, tx: &Transaction) -> Result<(), TransactionError> {
        if !self.set.entries.lock().is_empty() {
            tx.add_post_commit_hook(Arc::clone(&self.set) as Arc<dyn PostCommitHook>);
        }
        Ok(())
    }

    fn abort(&self, _tx: &Transaction) {
        self.set.entries.lock().clear();
    }

    fn recovered_commit(&self) -> Option<Arc<dyn PostRedoHook>> {
        if self.set.entries.lock().is_empty() {
            return None;
        }
        Some(Arc::clone(&self.set) as Arc<dyn PostRedoHook>)
    }
}

/// The releases themselves. Every step tolerates an already-freed resource,
/// so running a set twice is harmless.
pub struct ReleaseSet {
    buffer: Arc<BufferManager>,
    entries: Mutex<Vec<ReleaseEntry>>,
}

impl ReleaseSet {
    fn release_all(&self) -> Result<(), TransactionError> {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut failures = Vec::new();

        for entry in entries {
            let released = match entry {
                ReleaseEntry::Page { page_id, unit, lsn } => {
                    if self.buffer.reallocated_after(page_id, lsn) {
                        debug!("Skipping release of {}: allocated again after LSN {}", page_id, lsn);
                        continue;
                    }
                    self.buffer.release_page(page_id, unit, lsn, true)
                }
                ReleaseEntry::Unit { unit, lsn } => self.release_unit(unit, lsn),
            };
            if let Err(e) = released {
                warn!("Deferred release of {:?} failed: {}", entry, e);
                failures.push(format!("{:?}: {}", entry, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::HookFailed(failures))
        }
    }

    fn release_unit(&self, unit: UnitId, lsn: Lsn) -> Result<(), BufferPoolError> {
        self.buffer.log().flush(lsn)?;
        self.buffer.discard_unit_pages(unit)?;
        self.buffer
            .storage()
            .drop_unit(unit, true)
            .map_err(|e| BufferPoolError::storage(format!("dropping unit {}", unit), e))?;
        debug!("Dropped unit {}", unit);
        Ok(())
    }
}

impl PostCommitHook for ReleaseSet {
    fn execute(&self, _tx: &Transaction) -> Result<(), TransactionError> {
        self.release_all()
    }
}

impl PostRedoHook for ReleaseSet {
    fn execute(&self) -> Result<(), TransactionError> {
        self.release_all()
    }
}
