use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::types::{Lsn, PageId, UnitId};
use crate::storage::buffer::{BufferPoolError, LogMode};
use crate::transaction::concurrency::{Result, Transaction, TransactionError};
use super::LogOperation;

/// Built-in page and unit operations of the buffer manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageOperation {
    AllocatePage { page: PageId, unit: UnitId },
    DeallocatePage { page: PageId, unit: UnitId },
    /// Compensation for a deallocation: the block is allocated again with its old content
    RestorePage { page: PageId, unit: UnitId },
    DeferredDeallocatePage { page: PageId, unit: UnitId },
    /// Compensation for a deferred deallocation
    CancelDeferredDeallocate { page: PageId, unit: UnitId },
    CreateUnit { unit: UnitId },
    DropUnit { unit: UnitId },
    DeferredDropUnit { unit: UnitId },
    CancelDeferredDrop { unit: UnitId },
    /// Physiological overwrite of payload bytes
    WritePage {
        page: PageId,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },
}

impl StorageOperation {
    pub const TAGS: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

    pub fn decode(data: &[u8]) -> Result<Box<dyn LogOperation>> {
        let op: StorageOperation =
            bincode::deserialize(data).map_err(|e| TransactionError::OperationCodec(e.to_string()))?;
        Ok(Box::new(op))
    }

    /// Page the operation targets, if any
    pub fn page(&self) -> Option<PageId> {
        match self {
            StorageOperation::AllocatePage { page, .. }
            | StorageOperation::DeallocatePage { page, .. }
            | StorageOperation::RestorePage { page, .. }
            | StorageOperation::DeferredDeallocatePage { page, .. }
            | StorageOperation::CancelDeferredDeallocate { page, .. }
            | StorageOperation::WritePage { page, .. } => Some(*page),
            _ => None,
        }
    }

    fn apply(&self, tx: &Transaction, mode: LogMode) -> std::result::Result<(), BufferPoolError> {
        let buffer = tx.buffer();
        match self {
            StorageOperation::AllocatePage { page, unit } => {
                buffer.allocate_page_with(tx, *unit, Some(page.block), mode).map(drop)
            }
            StorageOperation::DeallocatePage { page, unit } => buffer.deallocate_page_with(tx, *page, *unit, mode),
            StorageOperation::RestorePage { page, unit } => buffer.restore_page_with(tx, *page, *unit, mode),
            StorageOperation::DeferredDeallocatePage { page, unit } => {
                buffer.delete_page_deferred_with(tx, *page, *unit, mode)
            }
            StorageOperation::CancelDeferredDeallocate { page, unit } => {
                buffer.cancel_deferred_delete_with(tx, *page, *unit, mode)
            }
            StorageOperation::CreateUnit { unit } => buffer.create_unit_with(tx, Some(*unit), mode).map(drop),
            StorageOperation::DropUnit { unit } => buffer.drop_unit_with(tx, *unit, mode),
            StorageOperation::DeferredDropUnit { unit } => buffer.drop_unit_deferred_with(tx, *unit, mode),
            StorageOperation::CancelDeferredDrop { unit } => buffer.cancel_deferred_drop_with(tx, *unit, mode),
            StorageOperation::WritePage { page, offset, before, after } => {
                buffer.write_page_with(tx, *page, *offset as usize, before, after, mode)
            }
        }
    }

    /// The operation a compensation record carries when this one is undone
    fn compensation(&self) -> Option<StorageOperation> {
        let compensation = match self {
            StorageOperation::AllocatePage { page, unit } => StorageOperation::DeallocatePage { page: *page, unit: *unit },
            StorageOperation::DeallocatePage { page, unit } => StorageOperation::RestorePage { page: *page, unit: *unit },
            StorageOperation::DeferredDeallocatePage { page, unit } => {
                StorageOperation::CancelDeferredDeallocate { page: *page, unit: *unit }
            }
            StorageOperation::CreateUnit { unit } => StorageOperation::DropUnit { unit: *unit },
            StorageOperation::DropUnit { unit } => StorageOperation::CreateUnit { unit: *unit },
            StorageOperation::DeferredDropUnit { unit } => StorageOperation::CancelDeferredDrop { unit: *unit },
            StorageOperation::WritePage { page, offset, before, after } => StorageOperation::WritePage {
                page: *page,
                offset: *offset,
                before: after.clone(),
                after: before.clone(),
            },
            StorageOperation::RestorePage { .. }
            | StorageOperation::CancelDeferredDeallocate { .. }
            | StorageOperation::CancelDeferredDrop { .. } => return None,
        };
        Some(compensation)
    }
}

impl LogOperation for StorageOperation {
    fn type_tag(&self) -> u8 {
        match self {
            StorageOperation::AllocatePage { .. } => 1,
            StorageOperation::DeallocatePage { .. } => 2,
            StorageOperation::RestorePage { .. } => 3,
            StorageOperation::DeferredDeallocatePage { .. } => 4,
            StorageOperation::CancelDeferredDeallocate { .. } => 5,
            StorageOperation::CreateUnit { .. } => 6,
            StorageOperation::DropUnit { .. } => 7,
            StorageOperation::DeferredDropUnit { .. } => 8,
            StorageOperation::CancelDeferredDrop { .. } => 9,
            StorageOperation::WritePage { .. } => 10,
        }
    }

    fn redo(&self, tx: &Transaction, lsn: Lsn) -> Result<()> {
        match self.apply(tx, LogMode::Replay(lsn)) {
            // The page was deleted and its deletion already reached storage
            Err(e) if e.is_page_not_found() => {
                debug!("Skipping redo of LSN {}: {:?} no longer exists", lsn, self.page());
                Ok(())
            }
            other => other.map_err(TransactionError::from),
        }
    }

    fn undo(&self, tx: &Transaction, lsn: Lsn, undo_next: Lsn) -> Result<()> {
        let Some(compensation) = self.compensation() else {
            return Err(TransactionError::InvalidOperation(format!(
                "record at LSN {} is a compensation and cannot be undone",
                lsn
            )));
        };
        compensation
            .apply(tx, LogMode::Clr(undo_next))
            .map_err(TransactionError::from)
    }

    fn size(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |size| size as usize)
    }

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(buf, self).map_err(|e| TransactionError::OperationCodec(e.to_string()))
    }
}
