// Recovery Integration Tests
//
// A crash is simulated by dropping the kernel without closing it: the log
// tail that was never forced and all storage metadata since the last sync
// are lost, and the next open runs restart recovery.

use std::sync::Arc;
use anyhow::Result;
use tempfile::TempDir;

use pagevault::storage::disk::DiskManagerConfig;
use pagevault::transaction::concurrency::{self, NoLocking};
use pagevault::transaction::{LogOperation, OperationRegistry};
use pagevault::{
    DiskManager, Kernel, KernelConfig, Lsn, PageId, RecoveryError, Transaction, TransactionError,
};

#[path = "../common/mod.rs"]
mod common;
use common::{init_logging, open_kernel, populate, read_payload, test_config};

fn crash(kernel: Kernel) {
    drop(kernel);
}

fn update(kernel: &Kernel, tx: &Transaction, page_id: PageId, offset: usize, data: &[u8]) -> Result<Lsn> {
    let handle = kernel.buffer().fix_page(page_id)?;
    Ok(kernel.buffer().update_page(tx, &handle, offset, data)?)
}

fn marker(page_id: PageId) -> Vec<u8> {
    page_id.block.to_le_bytes().to_vec()
}

/// Commit one change to `pages[0]` and leave an uncommitted, flushed change
/// to `pages[1]`, then crash
fn crash_with_winner_and_loser(dir: &TempDir) -> Result<Vec<PageId>> {
    let kernel = open_kernel(dir)?;
    let (_, pages) = populate(&kernel, 2)?;

    let winner = kernel.begin();
    update(&kernel, &winner, pages[0], 0, b"durable")?;
    winner.commit()?;

    let loser = kernel.begin();
    update(&kernel, &loser, pages[1], 0, b"lost!")?;
    // The uncommitted change is stolen to disk, after its log record
    kernel.log().flush_all()?;
    kernel.buffer().flush_all()?;

    drop(winner);
    drop(loser);
    crash(kernel);
    Ok(pages)
}

#[test]
fn test_committed_work_survives_and_loser_is_undone() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let pages = crash_with_winner_and_loser(&dir)?;

    let kernel = open_kernel(&dir)?;
    let stats = kernel.recovery_stats().clone();
    assert_eq!(stats.losers, 1);
    assert!(stats.records_undone >= 1);
    assert!(stats.records_redone >= stats.records_undone);

    assert_eq!(read_payload(&kernel, pages[0], 0, 7)?, b"durable".to_vec());
    assert_eq!(read_payload(&kernel, pages[1], 0, 4)?, marker(pages[1]));
    assert_eq!(read_payload(&kernel, pages[1], 4, 1)?, vec![0]);
    assert!(kernel.transactions().get_active_transaction_ids().is_empty());

    // Transaction ids keep growing past the ones found in the log
    let tx = kernel.begin();
    assert!(tx.id() > 3);
    tx.commit()?;

    kernel.close()?;
    Ok(())
}

#[test]
fn test_repeated_recovery_is_stable() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let pages = crash_with_winner_and_loser(&dir)?;

    let kernel = open_kernel(&dir)?;
    assert_eq!(kernel.recovery_stats().losers, 1);
    crash(kernel);

    for _ in 0..2 {
        let kernel = open_kernel(&dir)?;
        // The loser was closed with an EOT by the first run
        assert_eq!(kernel.recovery_stats().losers, 0);
        assert_eq!(kernel.recovery_stats().records_undone, 0);
        assert_eq!(read_payload(&kernel, pages[0], 0, 7)?, b"durable".to_vec());
        assert_eq!(read_payload(&kernel, pages[1], 0, 4)?, marker(pages[1]));
        crash(kernel);
    }

    let kernel = open_kernel(&dir)?;
    kernel.close()?;
    Ok(())
}

#[test]
fn test_uncommitted_allocation_is_released() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let (unit, block) = {
        let kernel = open_kernel(&dir)?;
        let (unit, _) = populate(&kernel, 1)?;

        let loser = kernel.begin();
        let handle = kernel.buffer().allocate_page(&loser, unit)?;
        let block = handle.page_id().block;
        kernel.buffer().update_page(&loser, &handle, 0, b"orphan")?;
        drop(handle);
        kernel.log().flush_all()?;
        kernel.buffer().flush_all()?;
        drop(loser);
        crash(kernel);
        (unit, block)
    };

    let kernel = open_kernel(&dir)?;
    assert_eq!(kernel.recovery_stats().losers, 1);
    assert_eq!(kernel.storage().unit_of(block), None);
    assert_eq!(kernel.storage().unit_of(1), Some(unit));
    kernel.close()?;
    Ok(())
}

#[test]
fn test_unforced_transaction_leaves_no_trace() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let pages = {
        let kernel = open_kernel(&dir)?;
        let (_, pages) = populate(&kernel, 1)?;
        let tx = kernel.begin();
        update(&kernel, &tx, pages[0], 0, b"volatile")?;
        drop(tx);
        crash(kernel);
        pages
    };

    let kernel = open_kernel(&dir)?;
    // Its records never reached the log, so there is nothing to undo
    assert_eq!(kernel.recovery_stats().losers, 0);
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, marker(pages[0]));
    kernel.close()?;
    Ok(())
}

#[test]
fn test_crash_after_rollback_keeps_it_rolled_back() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let pages = {
        let kernel = open_kernel(&dir)?;
        let (_, pages) = populate(&kernel, 1)?;
        let tx = kernel.begin();
        update(&kernel, &tx, pages[0], 0, b"stolen")?;
        // The update reaches disk, its compensation stays in the pool
        kernel.buffer().flush_all()?;
        tx.rollback()?;
        drop(tx);
        crash(kernel);
        pages
    };

    let kernel = open_kernel(&dir)?;
    assert_eq!(kernel.recovery_stats().losers, 0);
    assert_eq!(kernel.recovery_stats().records_undone, 0);
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, marker(pages[0]));
    assert_eq!(read_payload(&kernel, pages[0], 4, 2)?, vec![0; 2]);
    kernel.close()?;
    Ok(())
}

#[test]
fn test_recovery_starts_at_checkpoint() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let (pages, checkpoint_lsn) = {
        let kernel = open_kernel(&dir)?;
        let (_, pages) = populate(&kernel, 3)?;

        // Enough committed log to fill more than one segment
        for round in 0..2u8 {
            let tx = kernel.begin();
            for _ in 0..100 {
                update(&kernel, &tx, pages[2], 64, &[round; 400])?;
            }
            tx.commit()?;
        }
        let checkpoint_lsn = kernel.checkpoint()?;
        assert!(checkpoint_lsn > 1);

        let winner = kernel.begin();
        update(&kernel, &winner, pages[0], 0, b"after checkpoint")?;
        winner.commit()?;
        let loser = kernel.begin();
        update(&kernel, &loser, pages[1], 0, b"never")?;
        kernel.log().flush_all()?;
        drop(winner);
        drop(loser);
        crash(kernel);
        (pages, checkpoint_lsn)
    };

    let kernel = open_kernel(&dir)?;
    assert_eq!(kernel.recovery_stats().start_lsn, checkpoint_lsn);
    assert_eq!(kernel.recovery_stats().losers, 1);
    assert_eq!(read_payload(&kernel, pages[0], 0, 16)?, b"after checkpoint".to_vec());
    assert_eq!(read_payload(&kernel, pages[1], 0, 4)?, marker(pages[1]));
    assert_eq!(read_payload(&kernel, pages[2], 64, 400)?, vec![1u8; 400]);
    kernel.close()?;
    Ok(())
}

#[test]
fn test_committed_deferred_delete_is_released_after_redo() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let (unit, pages) = {
        let kernel = open_kernel(&dir)?;
        let (unit, pages) = populate(&kernel, 2)?;

        // The EOT reaches the log but the process dies before the release
        let tx = kernel.begin();
        kernel.buffer().delete_page_deferred(&tx, pages[0], unit)?;
        let eot = tx.log_eot()?;
        kernel.log().flush(eot)?;
        drop(tx);
        crash(kernel);
        (unit, pages)
    };

    let kernel = open_kernel(&dir)?;
    let stats = kernel.recovery_stats();
    assert_eq!(stats.losers, 0);
    assert_eq!(stats.post_redo_hooks, 1);
    assert_eq!(kernel.storage().unit_of(pages[0].block), None);
    assert_eq!(kernel.storage().unit_of(pages[1].block), Some(unit));
    kernel.close()?;

    // A second restart replays the release harmlessly
    let kernel = open_kernel(&dir)?;
    assert_eq!(kernel.storage().unit_of(pages[0].block), None);
    kernel.close()?;
    Ok(())
}

#[test]
fn test_loser_deferred_delete_is_cancelled() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let (unit, pages) = {
        let kernel = open_kernel(&dir)?;
        let (unit, pages) = populate(&kernel, 1)?;
        let tx = kernel.begin();
        kernel.buffer().delete_page_deferred(&tx, pages[0], unit)?;
        kernel.log().flush_all()?;
        drop(tx);
        crash(kernel);
        (unit, pages)
    };

    let kernel = open_kernel(&dir)?;
    assert_eq!(kernel.recovery_stats().losers, 1);
    assert_eq!(kernel.recovery_stats().post_redo_hooks, 0);
    assert_eq!(kernel.storage().unit_of(pages[0].block), Some(unit));
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, marker(pages[0]));
    kernel.close()?;
    Ok(())
}

const STAMP_TAG: u8 = 64;

/// Single-byte page update defined outside the crate
#[derive(Debug, Clone, PartialEq, Eq)]
struct StampOperation {
    page: PageId,
    offset: u32,
    before: u8,
    after: u8,
}

impl StampOperation {
    fn decode(data: &[u8]) -> concurrency::Result<Box<dyn LogOperation>> {
        if data.len() != 12 {
            return Err(TransactionError::OperationCodec(format!("stamp of {} bytes", data.len())));
        }
        let container = u16::from_le_bytes([data[0], data[1]]);
        let block = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
        let offset = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        Ok(Box::new(StampOperation {
            page: PageId::new(container, block),
            offset,
            before: data[10],
            after: data[11],
        }))
    }

    fn write(&self, tx: &Transaction, lsn: Lsn, skip_if_applied: bool) -> concurrency::Result<()> {
        let handle = tx.buffer().fix_page(self.page)?;
        let mut page = handle.write();
        if skip_if_applied && page.lsn() >= lsn {
            return Ok(());
        }
        page.payload_mut()[self.offset as usize] = self.after;
        handle.mark_modified(&mut page, lsn);
        Ok(())
    }
}

impl LogOperation for StampOperation {
    fn type_tag(&self) -> u8 {
        STAMP_TAG
    }

    fn redo(&self, tx: &Transaction, lsn: Lsn) -> concurrency::Result<()> {
        self.write(tx, lsn, true)
    }

    fn undo(&self, tx: &Transaction, _lsn: Lsn, undo_next: Lsn) -> concurrency::Result<()> {
        let compensation = StampOperation {
            before: self.after,
            after: self.before,
            ..self.clone()
        };
        let lsn = tx.log_clr(&compensation, undo_next)?;
        compensation.write(tx, lsn, false)
    }

    fn size(&self) -> usize {
        12
    }

    fn serialize(&self, buf: &mut Vec<u8>) -> concurrency::Result<()> {
        buf.extend_from_slice(&self.page.container.to_le_bytes());
        buf.extend_from_slice(&self.page.block.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.push(self.before);
        buf.push(self.after);
        Ok(())
    }
}

/// Log a stamp and apply it without assigning the page, so commit does not force it
fn stamp(kernel: &Kernel, tx: &Transaction, page_id: PageId, offset: usize, value: u8) -> Result<Lsn> {
    let handle = kernel.buffer().fix_page(page_id)?;
    let mut page = handle.write();
    let op = StampOperation {
        page: page_id,
        offset: offset as u32,
        before: page.payload()[offset],
        after: value,
    };
    let lsn = tx.log_update(&op)?;
    page.payload_mut()[offset] = value;
    handle.mark_modified(&mut page, lsn);
    Ok(lsn)
}

fn open_with_stamps(config: KernelConfig) -> Result<Kernel> {
    let registry = OperationRegistry::new();
    registry.register(STAMP_TAG, StampOperation::decode)?;
    let storage = Arc::new(DiskManager::new(DiskManagerConfig {
        data_dir: config.data_dir.clone(),
        block_size: config.block_size,
    }));
    Ok(Kernel::open_with(config, storage, registry, Arc::new(NoLocking))?)
}

#[test]
fn test_registered_operation_is_redone_and_undone() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = test_config(dir.path(), 64, 4);
    let pages = {
        let kernel = open_with_stamps(config.clone())?;
        let (_, pages) = populate(&kernel, 3)?;

        // The committed stamp stays in the pool only
        let winner = kernel.begin();
        stamp(&kernel, &winner, pages[0], 200, 0xAB)?;
        winner.commit()?;

        // The uncommitted one reaches disk; the clean page between keeps the runs apart
        let loser = kernel.begin();
        stamp(&kernel, &loser, pages[2], 200, 0xCD)?;
        kernel.log().flush_all()?;
        let handle = kernel.buffer().fix_page(pages[2])?;
        kernel.buffer().flush_page(&handle)?;
        drop(handle);

        drop(winner);
        drop(loser);
        crash(kernel);
        pages
    };

    // Without the decoder the log cannot be replayed
    let unknown = Kernel::open(config.clone());
    assert!(matches!(
        unknown,
        Err(RecoveryError::Transaction(TransactionError::UnknownOperation(STAMP_TAG)))
    ));
    drop(unknown);

    let kernel = open_with_stamps(config)?;
    assert_eq!(kernel.recovery_stats().losers, 1);
    assert_eq!(read_payload(&kernel, pages[0], 200, 1)?, vec![0xAB]);
    assert_eq!(read_payload(&kernel, pages[2], 200, 1)?, vec![0]);
    kernel.close()?;
    Ok(())
}

#[test]
fn test_restart_undo_skips_compensated_records() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let config = test_config(dir.path(), 64, 4);
    let pages = {
        let kernel = open_with_stamps(config.clone())?;
        let (_, pages) = populate(&kernel, 1)?;
        let page_id = pages[0];

        let loser = kernel.begin();
        let first = stamp(&kernel, &loser, page_id, 10, 0x11)?;
        stamp(&kernel, &loser, page_id, 20, 0x22)?;
        // The second stamp is closed off as if compensated
        loser.log_dummy_clr(first)?;
        // A redo-only stamp on top
        {
            let handle = kernel.buffer().fix_page(page_id)?;
            let mut page = handle.write();
            let op = StampOperation {
                page: page_id,
                offset: 30,
                before: 0,
                after: 0x33,
            };
            let lsn = loser.log_update_special(&op)?;
            page.payload_mut()[30] = 0x33;
            handle.mark_modified(&mut page, lsn);
        }
        kernel.log().flush_all()?;

        drop(loser);
        crash(kernel);
        pages
    };

    let kernel = open_with_stamps(config)?;
    assert_eq!(kernel.recovery_stats().losers, 1);
    // Only the first stamp is rolled back
    assert_eq!(read_payload(&kernel, pages[0], 10, 1)?, vec![0]);
    assert_eq!(read_payload(&kernel, pages[0], 20, 1)?, vec![0x22]);
    assert_eq!(read_payload(&kernel, pages[0], 30, 1)?, vec![0x33]);
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, marker(pages[0]));
    kernel.close()?;
    Ok(())
}
