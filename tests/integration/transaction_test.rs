// Transaction Integration Tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use anyhow::Result;
use crossbeam::channel;
use parking_lot::Mutex;
use tempfile::TempDir;

use pagevault::storage::buffer::release::release_group_key;
use pagevault::storage::buffer::DeferredRelease;
use pagevault::transaction::concurrency::{PostCommitHook, PreCommitHook, TransactionState, UNDO_RETRY_LIMIT};
use pagevault::transaction::{LogOperation, LogRecordType};
use pagevault::{IsolationLevel, Kernel, Lsn, Transaction, TransactionError, TxnId};

#[path = "../common/mod.rs"]
mod common;
use common::{init_logging, open_checked_kernel, open_kernel, populate, read_payload, test_config};

#[test]
fn test_deferred_deletes_share_one_hook() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let buffer = kernel.buffer();
    let (unit, pages) = populate(&kernel, 3)?;

    let tx = kernel.begin();
    buffer.delete_page_deferred(&tx, pages[0], unit)?;
    buffer.delete_page_deferred(&tx, pages[1], unit)?;
    assert_eq!(tx.pre_commit_hook_count(), 1);
    let hook = tx
        .pre_commit_hook::<DeferredRelease>(&release_group_key(unit))
        .expect("release hook registered");
    assert_eq!(hook.entries().len(), 2);

    // Nothing is freed before the commit
    assert_eq!(kernel.storage().unit_of(pages[0].block), Some(unit));

    tx.commit()?;
    kernel.transactions().wait_for_post_commit();
    assert_eq!(kernel.storage().unit_of(pages[0].block), None);
    assert_eq!(kernel.storage().unit_of(pages[1].block), None);
    assert_eq!(kernel.storage().unit_of(pages[2].block), Some(unit));
    assert!(!buffer.contains_page(pages[0]));

    kernel.close()?;
    Ok(())
}

#[test]
fn test_rolled_back_deferred_delete_keeps_page() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let buffer = kernel.buffer();
    let (unit, pages) = populate(&kernel, 2)?;

    let tx = kernel.begin();
    buffer.delete_page_deferred(&tx, pages[0], unit)?;
    buffer.drop_unit_deferred(&tx, unit)?;
    let hook = tx
        .pre_commit_hook::<DeferredRelease>(&release_group_key(unit))
        .expect("release hook registered");
    tx.rollback()?;
    kernel.transactions().wait_for_post_commit();

    assert!(hook.entries().is_empty());
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(kernel.storage().unit_of(pages[0].block), Some(unit));
    assert_eq!(read_payload(&kernel, pages[1], 0, 4)?, pages[1].block.to_le_bytes().to_vec());

    kernel.close()?;
    Ok(())
}

#[test]
fn test_immediate_delete_releases_through_releaser() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let buffer = kernel.buffer();
    let (unit, pages) = populate(&kernel, 2)?;

    let tx = kernel.begin();
    let releaser = buffer.delete_page(&tx, pages[0], unit)?;
    assert_eq!(releaser.page_id(), pages[0]);
    assert_eq!(kernel.storage().unit_of(pages[0].block), Some(unit));
    let lsn = releaser.lsn();
    releaser.release()?;
    assert!(kernel.log().is_durable(lsn));
    assert_eq!(kernel.storage().unit_of(pages[0].block), None);
    tx.commit()?;

    // A fixed page cannot be released
    let tx = kernel.begin();
    let handle = buffer.fix_page(pages[1])?;
    let releaser = buffer.delete_page(&tx, pages[1], unit)?;
    assert!(releaser.release().is_err());
    drop(handle);
    tx.rollback()?;
    assert_eq!(kernel.storage().unit_of(pages[1].block), Some(unit));

    kernel.close()?;
    Ok(())
}

#[test]
fn test_undone_delete_brings_back_the_latest_image() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let buffer = kernel.buffer();
    let (unit, pages) = populate(&kernel, 1)?;
    let page_id = pages[0];
    let marker = page_id.block.to_le_bytes().to_vec();

    // An uncommitted image reaches disk, its rollback only the pool
    let first = kernel.begin();
    let handle = buffer.fix_page(page_id)?;
    buffer.update_page(&first, &handle, 0, b"UNCOMMITTED")?;
    buffer.flush_page(&handle)?;
    drop(handle);
    first.rollback()?;
    assert_eq!(read_payload(&kernel, page_id, 0, 4)?, marker);

    let second = kernel.begin();
    buffer.delete_page(&second, page_id, unit)?.release()?;
    assert!(!buffer.contains_page(page_id));
    assert_eq!(buffer.min_redo_lsn(), None);
    second.rollback()?;

    assert_eq!(kernel.storage().unit_of(page_id.block), Some(unit));
    assert_eq!(read_payload(&kernel, page_id, 0, 4)?, marker);
    assert_eq!(read_payload(&kernel, page_id, 4, 7)?, vec![0; 7]);

    kernel.close()?;
    Ok(())
}

#[test]
fn test_commit_that_cannot_force_its_end_stays_finishable() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let mut config = test_config(dir.path(), 64, 1);
    // Every flush but the first opens a new segment file
    config.log.max_log_file_size = 1;
    let kernel = Kernel::open(config.clone())?;
    let buffer = kernel.buffer();
    let (_, pages) = populate(&kernel, 1)?;
    let marker = pages[0].block.to_le_bytes().to_vec();

    let tx = kernel.begin();
    let handle = buffer.fix_page(pages[0])?;
    buffer.update_page(&tx, &handle, 0, b"unforced")?;
    drop(handle);

    // Without its directory the log cannot start a segment
    let wal_dir = config.log.log_dir.clone();
    let parked = dir.path().join("wal.parked");
    std::fs::rename(&wal_dir, &parked)?;
    assert!(matches!(tx.commit(), Err(TransactionError::Log(_))));
    assert_eq!(tx.state(), TransactionState::Rollback);
    assert!(kernel.transactions().transaction_exists(tx.id()));
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, marker);

    std::fs::rename(&parked, &wal_dir)?;
    tx.rollback()?;
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(!kernel.transactions().transaction_exists(tx.id()));
    assert_eq!(kernel.transactions().min_first_lsn(), None);
    assert!(matches!(tx.rollback(), Err(TransactionError::InvalidState(_, _))));

    // The log now holds an EOT followed by the compensation of the same transaction
    drop(tx);
    drop(kernel);
    let kernel = Kernel::open(config)?;
    assert_eq!(kernel.recovery_stats().losers, 0);
    assert_eq!(kernel.recovery_stats().post_redo_hooks, 0);
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, marker);
    kernel.close()?;
    Ok(())
}

#[test]
fn test_commit_forces_log_before_pages() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let (kernel, storage) = open_checked_kernel(&dir, 16)?;
    let buffer = kernel.buffer();

    let tx = kernel.begin();
    let unit = buffer.create_unit(&tx)?;
    let handle = buffer.allocate_page(&tx, unit)?;
    let page_id = handle.page_id();
    let allocated_lsn = handle.lsn();
    buffer.update_page(&tx, &handle, 16, b"committed")?;
    drop(handle);
    assert_eq!(tx.assigned_page_count(), 1);
    tx.commit()?;

    let eot_lsn = tx.prev_lsn();
    assert!(eot_lsn > allocated_lsn);
    assert_eq!(kernel.log().get(eot_lsn)?.record_type, LogRecordType::Eot);
    assert!(kernel.log().is_durable(eot_lsn));
    assert_eq!(tx.assigned_page_count(), 0);

    let page_writes: Vec<_> = storage.writes().into_iter().filter(|w| w.block == page_id.block).collect();
    assert_eq!(page_writes.len(), 1);
    assert!(page_writes[0].durable_lsn > eot_lsn);
    assert!(storage.violations().is_empty());
    assert!(!kernel.transactions().transaction_exists(tx.id()));

    kernel.close()?;
    Ok(())
}

#[test]
fn test_rollback_restores_pages() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let buffer = kernel.buffer();
    let (unit, pages) = populate(&kernel, 1)?;

    let tx = kernel.begin();
    let handle = buffer.fix_page(pages[0])?;
    buffer.update_page(&tx, &handle, 0, b"overwritten")?;
    buffer.update_page(&tx, &handle, 100, b"twice")?;
    drop(handle);
    let extra = buffer.allocate_page(&tx, unit)?.page_id();
    tx.rollback()?;

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, pages[0].block.to_le_bytes().to_vec());
    assert_eq!(read_payload(&kernel, pages[0], 100, 5)?, vec![0; 5]);
    assert_eq!(kernel.storage().unit_of(extra.block), None);

    // Finished transactions reject a second completion
    assert!(matches!(tx.commit(), Err(TransactionError::InvalidState(_, _))));
    assert!(matches!(tx.rollback(), Err(TransactionError::InvalidState(_, _))));

    kernel.close()?;
    Ok(())
}

#[test]
fn test_abort_request_turns_commit_into_rollback() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let buffer = kernel.buffer();
    let (_, pages) = populate(&kernel, 1)?;

    let tx = kernel.begin();
    let handle = buffer.fix_page(pages[0])?;
    buffer.update_page(&tx, &handle, 0, b"never")?;
    drop(handle);

    tx.request_abort();
    assert!(tx.is_abort_requested());
    assert!(matches!(tx.commit(), Err(TransactionError::Aborted(id)) if id == tx.id()));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, pages[0].block.to_le_bytes().to_vec());

    kernel.close()?;
    Ok(())
}

#[test]
fn test_joined_thread_delays_commit() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let (_, pages) = populate(&kernel, 2)?;
    let tx = kernel.begin();

    let (joined_send, joined_recv) = channel::bounded::<()>(0);
    let worker = {
        let tx = Arc::clone(&tx);
        let page = pages[1];
        thread::spawn(move || -> Result<u64> {
            let _guard = tx.join();
            let _ = joined_send.send(());
            thread::sleep(Duration::from_millis(50));
            let handle = tx.buffer().fix_page(page)?;
            let lsn = tx.buffer().update_page(&tx, &handle, 0, b"worker")?;
            Ok(lsn)
        })
    };

    joined_recv.recv()?;
    assert_eq!(tx.joined_threads(), 1);
    tx.commit()?;
    let worker_lsn = match worker.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("worker panicked"),
    };

    // The worker's update happened before the EOT
    assert!(worker_lsn < tx.prev_lsn());
    assert_eq!(tx.joined_threads(), 0);
    assert_eq!(read_payload(&kernel, pages[1], 0, 6)?, b"worker".to_vec());

    kernel.close()?;
    Ok(())
}

#[test]
fn test_concurrent_votes_finish_once() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let (_, pages) = populate(&kernel, 1)?;
    let tx = kernel.begin();
    {
        let handle = kernel.buffer().fix_page(pages[0])?;
        kernel.buffer().update_page(&tx, &handle, 0, b"vote")?;
    }

    let voters: Vec<_> = (0..4)
        .map(|_| {
            let tx = Arc::clone(&tx);
            thread::spawn(move || tx.commit())
        })
        .collect();
    let mut succeeded = 0;
    for voter in voters {
        match voter.join() {
            Ok(Ok(())) => succeeded += 1,
            Ok(Err(TransactionError::InvalidState(_, _))) => {}
            Ok(Err(e)) => anyhow::bail!("unexpected commit error: {}", e),
            Err(_) => anyhow::bail!("voter panicked"),
        }
    }
    assert!(succeeded >= 1);
    assert_eq!(tx.state(), TransactionState::Committed);

    let eots = kernel
        .log()
        .iter_from(kernel.log().first_lsn())
        .filter_map(|record| record.ok())
        .filter(|record| record.txn_id == tx.id() && record.record_type == LogRecordType::Eot)
        .count();
    assert_eq!(eots, 1);

    kernel.close()?;
    Ok(())
}

struct FailingHook;

impl PreCommitHook for FailingHook {
    fn prepare(&self, _tx: &Transaction) -> pagevault::transaction::concurrency::Result<()> {
        Err(TransactionError::InvalidOperation("constraint violated".to_string()))
    }

    fn abort(&self, _tx: &Transaction) {}
}

#[derive(Default)]
struct RecordingHook {
    ran_in: Mutex<Vec<(TxnId, IsolationLevel)>>,
}

impl PostCommitHook for RecordingHook {
    fn execute(&self, tx: &Transaction) -> pagevault::transaction::concurrency::Result<()> {
        self.ran_in.lock().push((tx.id(), tx.isolation_level()));
        Ok(())
    }
}

#[test]
fn test_failing_pre_commit_hook_rolls_back() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    let (_, pages) = populate(&kernel, 1)?;

    let tx = kernel.begin();
    let handle = kernel.buffer().fix_page(pages[0])?;
    kernel.buffer().update_page(&tx, &handle, 0, b"rejected")?;
    drop(handle);
    let recording = Arc::new(RecordingHook::default());
    tx.add_post_commit_hook(Arc::clone(&recording) as Arc<dyn PostCommitHook>);
    tx.add_pre_commit_hook(Arc::new(FailingHook));

    assert!(matches!(tx.commit(), Err(TransactionError::InvalidOperation(_))));
    kernel.transactions().wait_for_post_commit();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(recording.ran_in.lock().is_empty());
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, pages[0].block.to_le_bytes().to_vec());

    kernel.close()?;
    Ok(())
}

#[test]
fn test_post_commit_hooks_run_in_nested_transactions() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;

    let tx = kernel.transactions().begin_transaction(IsolationLevel::Serializable);
    let recording = Arc::new(RecordingHook::default());
    tx.add_post_commit_hook(Arc::clone(&recording) as Arc<dyn PostCommitHook>);
    tx.add_post_commit_hook(Arc::clone(&recording) as Arc<dyn PostCommitHook>);
    tx.commit()?;
    kernel.transactions().wait_for_post_commit();

    let ran_in = recording.ran_in.lock().clone();
    assert_eq!(ran_in.len(), 2);
    assert!(ran_in.iter().all(|(id, level)| *id != tx.id() && *level == IsolationLevel::Serializable));
    assert_ne!(ran_in[0].0, ran_in[1].0);
    assert!(kernel.transactions().get_active_transaction_ids().is_empty());

    kernel.close()?;
    Ok(())
}

const STUCK_TAG: u8 = 65;

static STUCK_UNDO_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

/// An operation whose undo never succeeds
#[derive(Debug)]
struct StuckOperation;

impl StuckOperation {
    fn decode(_data: &[u8]) -> pagevault::transaction::concurrency::Result<Box<dyn LogOperation>> {
        Ok(Box::new(StuckOperation))
    }
}

impl LogOperation for StuckOperation {
    fn type_tag(&self) -> u8 {
        STUCK_TAG
    }

    fn redo(&self, _tx: &Transaction, _lsn: Lsn) -> pagevault::transaction::concurrency::Result<()> {
        Ok(())
    }

    fn undo(&self, _tx: &Transaction, _lsn: Lsn, _undo_next: Lsn) -> pagevault::transaction::concurrency::Result<()> {
        STUCK_UNDO_ATTEMPTS.fetch_add(1, Ordering::SeqCst);
        Err(TransactionError::InvalidOperation("resource gone".to_string()))
    }

    fn size(&self) -> usize {
        0
    }

    fn serialize(&self, _buf: &mut Vec<u8>) -> pagevault::transaction::concurrency::Result<()> {
        Ok(())
    }
}

#[test]
fn test_undo_gives_up_after_retry_limit() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let kernel = open_kernel(&dir)?;
    kernel.transactions().registry().register(STUCK_TAG, StuckOperation::decode)?;
    let (_, pages) = populate(&kernel, 1)?;

    let tx = kernel.begin();
    let handle = kernel.buffer().fix_page(pages[0])?;
    kernel.buffer().update_page(&tx, &handle, 0, b"kept")?;
    drop(handle);
    let stuck_lsn = tx.log_update(&StuckOperation)?;

    let err = tx.rollback().unwrap_err();
    assert!(matches!(
        err,
        TransactionError::UndoRetriesExhausted { lsn, attempts, .. } if lsn == stuck_lsn && attempts == UNDO_RETRY_LIMIT
    ));
    assert_eq!(STUCK_UNDO_ATTEMPTS.load(Ordering::SeqCst), UNDO_RETRY_LIMIT);

    // Nothing older than the stuck record was undone and the transaction stays open
    assert_eq!(tx.state(), TransactionState::Rollback);
    assert!(kernel.transactions().transaction_exists(tx.id()));
    assert_eq!(read_payload(&kernel, pages[0], 0, 4)?, b"kept".to_vec());
    assert_eq!(tx.prev_lsn(), stuck_lsn);
    Ok(())
}
