use std::ops::Range;
use std::sync::Arc;
use log::{debug, warn};

use crate::common::types::{BlockNo, Lsn, PageId, UnitId};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::handle::PageHandle;
use crate::storage::buffer::release::{release_group_key, DeferredRelease, ReleaseEntry};
use crate::storage::page::Page;
use crate::transaction::concurrency::Transaction;
use crate::transaction::operation::StorageOperation;
use super::BufferManager;

/// How a storage operation is recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Normal forward processing: an UPDATE record
    Update,
    /// Undo: a compensation record pointing at the given undo-next LSN
    Clr(Lsn),
    /// Restart redo of the record at the given LSN: nothing is logged and
    /// storage calls are forced
    Replay(Lsn),
}

impl LogMode {
    pub fn is_replay(&self) -> bool {
        matches!(self, LogMode::Replay(_))
    }

    /// Whether storage calls must tolerate an already-reached state
    fn force(&self) -> bool {
        !matches!(self, LogMode::Update)
    }
}

/// Capability to physically release a deleted page.
///
/// Returned by [`BufferManager::delete_page`] once the deallocation is
/// logged. Releasing forces the log up to that record first, so storage
/// never reuses a block whose deletion could be lost.
#[must_use = "the page stays allocated until the releaser is invoked"]
pub struct PageReleaser<'a> {
    buffer: &'a BufferManager,
    page_id: PageId,
    unit: UnitId,
    lsn: Lsn,
}

impl PageReleaser<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// LSN of the deallocation record
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn release(self) -> Result<()> {
        self.buffer.release_page(self.page_id, self.unit, self.lsn, false)
    }
}

impl BufferManager {
    fn log_op(&self, tx: &Transaction, op: &StorageOperation, mode: LogMode) -> Result<Lsn> {
        let lsn = match mode {
            LogMode::Update => tx.log_update(op)?,
            LogMode::Clr(undo_next) => tx.log_clr(op, undo_next)?,
            LogMode::Replay(lsn) => lsn,
        };
        Ok(lsn)
    }

    /// Allocate a fresh page in `unit`, fixed and assigned to `tx`
    pub fn allocate_page(&self, tx: &Transaction, unit: UnitId) -> Result<PageHandle> {
        self.allocate_page_with(tx, unit, None, LogMode::Update)
    }

    /// Allocate `block` (any free block when `None`) to `unit`.
    ///
    /// The new frame is formatted with the LSN of the allocation record and
    /// marked modified. In replay mode the storage allocation is forced and
    /// the page is only formatted if its stored LSN predates the record.
    pub fn allocate_page_with(
        &self,
        tx: &Transaction,
        unit: UnitId,
        block: Option<BlockNo>,
        mode: LogMode,
    ) -> Result<PageHandle> {
        self.check_open()?;
        if let LogMode::Replay(lsn) = mode {
            let block = block.ok_or_else(|| {
                BufferPoolError::InvalidOperation("replayed allocation without a block".to_string())
            })?;
            return self.reallocate_page(self.page_id(block), unit, lsn);
        }

        if let Some(block) = block {
            let page_id = self.page_id(block);
            if self.state.lock().page_table.contains_key(&page_id) {
                return Err(BufferPoolError::PageAlreadyMapped(page_id));
            }
        }
        let block = self
            .storage
            .allocate(block, unit, mode.force())
            .map_err(|e| BufferPoolError::storage(format!("allocating a block in unit {}", unit), e))?;
        let page_id = self.page_id(block);

        let claimed = {
            let mut state = self.state.lock();
            if state.page_table.contains_key(&page_id) {
                Err(BufferPoolError::PageAlreadyMapped(page_id))
            } else {
                self.claim_frame(&mut state, page_id, unit)
            }
        };
        let claims = match claimed.and_then(|claim| self.write_back_claims(vec![claim])) {
            Ok(claims) => claims,
            Err(e) => {
                self.undo_storage_allocation(block, unit);
                return Err(e);
            }
        };

        let op = StorageOperation::AllocatePage { page: page_id, unit };
        let lsn = match self.log_op(tx, &op, mode) {
            Ok(lsn) => lsn,
            Err(e) => {
                self.abandon_claims(claims);
                self.undo_storage_allocation(block, unit);
                return Err(e);
            }
        };

        if let Some(claim) = claims.first() {
            let mut page = claim.frame.write();
            page.set_page_id(page_id);
            page.format(unit, lsn);
            claim.frame.set_modified(lsn);
        }
        let handle = self.finish_claims(claims)?;
        if mode == LogMode::Update {
            self.assign(&handle, tx);
        }
        debug!("Allocated page {} in unit {} at LSN {}", page_id, unit, lsn);
        Ok(handle)
    }

    fn reallocate_page(&self, page_id: PageId, unit: UnitId, lsn: Lsn) -> Result<PageHandle> {
        self.storage
            .allocate(Some(page_id.block), unit, true)
            .map_err(|e| BufferPoolError::storage(format!("replaying allocation of {}", page_id), e))?;
        let handle = self.fix_page(page_id)?;
        {
            let mut page = handle.write();
            if page.lsn() < lsn {
                page.format(unit, lsn);
                handle.mark_modified(&mut page, lsn);
            }
        }
        self.redo_reallocations.lock().insert(page_id, lsn);
        Ok(handle)
    }

    fn undo_storage_allocation(&self, block: BlockNo, unit: UnitId) {
        if let Err(e) = self.storage.release(block, unit, true) {
            warn!("Could not return block {} of unit {} to storage: {}", block, unit, e);
        }
    }

    /// Bring back a deallocated page without touching its content
    pub(crate) fn restore_page_with(&self, tx: &Transaction, page_id: PageId, unit: UnitId, mode: LogMode) -> Result<()> {
        self.check_open()?;
        self.log_op(tx, &StorageOperation::RestorePage { page: page_id, unit }, mode)?;
        self.storage
            .allocate(Some(page_id.block), unit, true)
            .map_err(|e| BufferPoolError::storage(format!("restoring {}", page_id), e))?;
        Ok(())
    }

    /// Log the deletion of `page_id`. The returned releaser frees the block.
    pub fn delete_page(&self, tx: &Transaction, page_id: PageId, unit: UnitId) -> Result<PageReleaser<'_>> {
        self.check_open()?;
        self.check_page_id(page_id)?;
        let lsn = self.log_op(tx, &StorageOperation::DeallocatePage { page: page_id, unit }, LogMode::Update)?;
        Ok(PageReleaser {
            buffer: self,
            page_id,
            unit,
            lsn,
        })
    }

    /// Deallocate immediately, for undo and redo
    pub(crate) fn deallocate_page_with(&self, tx: &Transaction, page_id: PageId, unit: UnitId, mode: LogMode) -> Result<()> {
        self.check_open()?;
        let lsn = self.log_op(tx, &StorageOperation::DeallocatePage { page: page_id, unit }, mode)?;
        self.release_page(page_id, unit, lsn, true)
    }

    /// Drop the frame of a deleted page and free its block once the log holds `lsn`.
    ///
    /// A dirty frame is written back first: undoing the deletion only
    /// re-allocates the block, so the disk image has to be current.
    pub(crate) fn release_page(&self, page_id: PageId, unit: UnitId, lsn: Lsn, force: bool) -> Result<()> {
        self.log.flush(lsn)?;
        self.write_back_page(page_id)?;
        self.discard_page(page_id)?;
        self.storage
            .release(page_id.block, unit, force)
            .map_err(|e| BufferPoolError::storage(format!("releasing {}", page_id), e))?;
        debug!("Released page {} of unit {}", page_id, unit);
        Ok(())
    }

    /// Log the deletion of `page_id` now and release it after `tx` commits
    pub fn delete_page_deferred(&self, tx: &Transaction, page_id: PageId, unit: UnitId) -> Result<()> {
        self.check_page_id(page_id)?;
        self.delete_page_deferred_with(tx, page_id, unit, LogMode::Update)
    }

    pub(crate) fn delete_page_deferred_with(
        &self,
        tx: &Transaction,
        page_id: PageId,
        unit: UnitId,
        mode: LogMode,
    ) -> Result<()> {
        self.check_open()?;
        let op = StorageOperation::DeferredDeallocatePage { page: page_id, unit };
        let lsn = self.log_op(tx, &op, mode)?;
        self.deferred_release(tx, unit).add(ReleaseEntry::Page { page_id, unit, lsn });
        Ok(())
    }

    pub(crate) fn cancel_deferred_delete_with(
        &self,
        tx: &Transaction,
        page_id: PageId,
        unit: UnitId,
        mode: LogMode,
    ) -> Result<()> {
        let op = StorageOperation::CancelDeferredDeallocate { page: page_id, unit };
        self.log_op(tx, &op, mode)?;
        if let Some(hook) = tx.pre_commit_hook::<DeferredRelease>(&release_group_key(unit)) {
            hook.remove_page(page_id);
        }
        Ok(())
    }

    /// Log the drop of `unit` now and drop it after `tx` commits
    pub fn drop_unit_deferred(&self, tx: &Transaction, unit: UnitId) -> Result<()> {
        self.drop_unit_deferred_with(tx, unit, LogMode::Update)
    }

    pub(crate) fn drop_unit_deferred_with(&self, tx: &Transaction, unit: UnitId, mode: LogMode) -> Result<()> {
        self.check_open()?;
        let lsn = self.log_op(tx, &StorageOperation::DeferredDropUnit { unit }, mode)?;
        self.deferred_release(tx, unit).add(ReleaseEntry::Unit { unit, lsn });
        Ok(())
    }

    pub(crate) fn cancel_deferred_drop_with(&self, tx: &Transaction, unit: UnitId, mode: LogMode) -> Result<()> {
        self.log_op(tx, &StorageOperation::CancelDeferredDrop { unit }, mode)?;
        if let Some(hook) = tx.pre_commit_hook::<DeferredRelease>(&release_group_key(unit)) {
            hook.remove_unit(unit);
        }
        Ok(())
    }

    /// The release hook of `tx` for `unit`; one per unit and transaction
    fn deferred_release(&self, tx: &Transaction, unit: UnitId) -> Arc<DeferredRelease> {
        tx.pre_commit_hook_for(&release_group_key(unit), || DeferredRelease::new(Arc::clone(tx.buffer())))
    }

    /// Create a fresh unit
    pub fn create_unit(&self, tx: &Transaction) -> Result<UnitId> {
        self.create_unit_with(tx, None, LogMode::Update)
    }

    pub(crate) fn create_unit_with(&self, tx: &Transaction, unit: Option<UnitId>, mode: LogMode) -> Result<UnitId> {
        self.check_open()?;
        let unit = self
            .storage
            .create_unit(unit, mode.force())
            .map_err(|e| BufferPoolError::storage("creating a unit", e))?;
        if let Err(e) = self.log_op(tx, &StorageOperation::CreateUnit { unit }, mode) {
            if let Err(drop_error) = self.storage.drop_unit(unit, true) {
                warn!("Could not drop unlogged unit {}: {}", unit, drop_error);
            }
            return Err(e);
        }
        debug!("Created unit {}", unit);
        Ok(unit)
    }

    /// Drop `unit` with all its pages right away
    pub fn drop_unit(&self, tx: &Transaction, unit: UnitId) -> Result<()> {
        self.drop_unit_with(tx, unit, LogMode::Update)
    }

    pub(crate) fn drop_unit_with(&self, tx: &Transaction, unit: UnitId, mode: LogMode) -> Result<()> {
        self.check_open()?;
        let lsn = self.log_op(tx, &StorageOperation::DropUnit { unit }, mode)?;
        self.log.flush(lsn)?;
        self.discard_unit_pages(unit)?;
        self.storage
            .drop_unit(unit, mode.force())
            .map_err(|e| BufferPoolError::storage(format!("dropping unit {}", unit), e))?;
        debug!("Dropped unit {}", unit);
        Ok(())
    }

    /// Overwrite payload bytes of a fixed page under a logged physiological update.
    ///
    /// Returns the LSN of the update record. The page is assigned to `tx`.
    pub fn update_page(&self, tx: &Transaction, handle: &PageHandle, offset: usize, data: &[u8]) -> Result<Lsn> {
        self.check_open()?;
        let mut page = handle.write();
        let range = payload_range(&page, offset, data.len())?;
        let op = StorageOperation::WritePage {
            page: handle.page_id(),
            offset: offset as u32,
            before: page.payload()[range.clone()].to_vec(),
            after: data.to_vec(),
        };
        let lsn = self.log_op(tx, &op, LogMode::Update)?;
        page.payload_mut()[range].copy_from_slice(data);
        handle.mark_modified(&mut page, lsn);
        drop(page);
        self.assign(handle, tx);
        Ok(lsn)
    }

    /// Apply a payload write for undo (logging a CLR) or redo (skipped when
    /// the stored page already reflects `lsn`)
    pub(crate) fn write_page_with(
        &self,
        tx: &Transaction,
        page_id: PageId,
        offset: usize,
        before: &[u8],
        after: &[u8],
        mode: LogMode,
    ) -> Result<()> {
        self.check_open()?;
        let handle = self.fix_page(page_id)?;
        let mut page = handle.write();
        if let LogMode::Replay(lsn) = mode {
            if page.lsn() >= lsn {
                return Ok(());
            }
        }
        let range = payload_range(&page, offset, after.len())?;
        let op = StorageOperation::WritePage {
            page: page_id,
            offset: offset as u32,
            before: before.to_vec(),
            after: after.to_vec(),
        };
        let lsn = self.log_op(tx, &op, mode)?;
        page.payload_mut()[range].copy_from_slice(after);
        handle.mark_modified(&mut page, lsn);
        Ok(())
    }

    /// Whether redo allocated `page_id` again after `lsn`
    pub(crate) fn reallocated_after(&self, page_id: PageId, lsn: Lsn) -> bool {
        self.redo_reallocations
            .lock()
            .get(&page_id)
            .is_some_and(|&allocated| allocated > lsn)
    }

    pub(crate) fn clear_redo_reallocations(&self) {
        self.redo_reallocations.lock().clear();
    }
}

fn payload_range(page: &Page, offset: usize, len: usize) -> Result<Range<usize>> {
    let end = offset.checked_add(len).filter(|&end| end <= page.payload().len());
    match end {
        Some(end) => Ok(offset..end),
        None => Err(BufferPoolError::InvalidOperation(format!(
            "write of {} bytes at offset {} exceeds the payload of page {}",
            len,
            offset,
            page.page_id()
        ))),
    }
}
