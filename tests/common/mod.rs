#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use anyhow::Result;
use parking_lot::Mutex;
use tempfile::TempDir;

use pagevault::storage::disk::DiskManagerConfig;
use pagevault::transaction::concurrency::NoLocking;
use pagevault::transaction::OperationRegistry;
use pagevault::{
    BlockNo, DiskManager, Kernel, KernelConfig, LogManager, Lsn, PageId, ReplacementPolicy, Storage, StorageError,
    UnitId,
};

/// Smallest block size the storage accepts; keeps test files tiny
pub const TEST_BLOCK_SIZE: usize = 512;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Kernel configuration rooted in `dir` with a small pool
pub fn test_config(dir: &Path, pool_size: usize, read_ahead: usize) -> KernelConfig {
    let mut config = KernelConfig::new(dir);
    config.block_size = TEST_BLOCK_SIZE;
    config.buffer.pool_size = pool_size;
    config.buffer.read_ahead = read_ahead;
    config.log.force_sync = false;
    config.log.max_log_file_size = 64 * 1024;
    config
}

pub fn open_kernel(dir: &TempDir) -> Result<Kernel> {
    Ok(Kernel::open(test_config(dir.path(), 64, 4))?)
}

pub fn open_kernel_with(dir: &TempDir, pool_size: usize, read_ahead: usize, replacement: ReplacementPolicy) -> Result<Kernel> {
    let mut config = test_config(dir.path(), pool_size, read_ahead);
    config.buffer.replacement = replacement;
    Ok(Kernel::open(config)?)
}

/// Create a unit with `count` pages in one committed transaction.
///
/// Every page gets its block number written at payload offset 0.
pub fn populate(kernel: &Kernel, count: usize) -> Result<(UnitId, Vec<PageId>)> {
    let buffer = kernel.buffer();
    let tx = kernel.begin();
    let unit = buffer.create_unit(&tx)?;
    let mut pages = Vec::with_capacity(count);
    for _ in 0..count {
        let handle = buffer.allocate_page(&tx, unit)?;
        let marker = handle.page_id().block.to_le_bytes();
        buffer.update_page(&tx, &handle, 0, &marker)?;
        pages.push(handle.page_id());
    }
    tx.commit()?;
    Ok((unit, pages))
}

/// Read `len` payload bytes of `page_id` at `offset`
pub fn read_payload(kernel: &Kernel, page_id: PageId, offset: usize, len: usize) -> Result<Vec<u8>> {
    let handle = kernel.buffer().fix_page(page_id)?;
    let page = handle.read();
    Ok(page.payload()[offset..offset + len].to_vec())
}

/// One block write observed by [`WalCheckedStorage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWrite {
    pub block: BlockNo,
    pub page_lsn: Lsn,
    pub durable_lsn: Lsn,
}

/// File-backed storage that records every block write and checks that the
/// log record of the written page image was already durable
pub struct WalCheckedStorage {
    inner: DiskManager,
    log: Mutex<Option<Arc<LogManager>>>,
    writes: Mutex<Vec<BlockWrite>>,
    violations: Mutex<Vec<String>>,
}

impl WalCheckedStorage {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            inner: DiskManager::new(DiskManagerConfig {
                data_dir: config.data_dir.clone(),
                block_size: config.block_size,
            }),
            log: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Start checking writes against `log`
    pub fn attach(&self, log: Arc<LogManager>) {
        *self.log.lock() = Some(log);
    }

    pub fn writes(&self) -> Vec<BlockWrite> {
        self.writes.lock().clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }
}

impl Storage for WalCheckedStorage {
    fn open(&self) -> Result<(), StorageError> {
        self.inner.open()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read(&self, block: BlockNo, buf: &mut [u8], count: usize) -> Result<(), StorageError> {
        self.inner.read(block, buf, count)
    }

    fn write(&self, block: BlockNo, buf: &[u8], count: usize, sync: bool) -> Result<(), StorageError> {
        let block_size = self.inner.block_size();
        let log = self.log.lock().clone();
        for i in 0..count {
            let start = i * block_size;
            let mut lsn_bytes = [0u8; 8];
            lsn_bytes.copy_from_slice(&buf[start..start + 8]);
            let page_lsn = Lsn::from_le_bytes(lsn_bytes);
            let durable_lsn = log.as_ref().map_or(0, |log| log.durable_lsn());
            if let Some(log) = &log {
                if !log.is_durable(page_lsn) {
                    self.violations.lock().push(format!(
                        "block {} written with page LSN {} but log durable only below {}",
                        block + i as BlockNo,
                        page_lsn,
                        durable_lsn
                    ));
                }
            }
            self.writes.lock().push(BlockWrite {
                block: block + i as BlockNo,
                page_lsn,
                durable_lsn,
            });
        }
        self.inner.write(block, buf, count, sync)
    }

    fn allocate(&self, block: Option<BlockNo>, unit: UnitId, force: bool) -> Result<BlockNo, StorageError> {
        self.inner.allocate(block, unit, force)
    }

    fn release(&self, block: BlockNo, unit: UnitId, force: bool) -> Result<(), StorageError> {
        self.inner.release(block, unit, force)
    }

    fn create_unit(&self, unit: Option<UnitId>, force: bool) -> Result<UnitId, StorageError> {
        self.inner.create_unit(unit, force)
    }

    fn drop_unit(&self, unit: UnitId, force: bool) -> Result<(), StorageError> {
        self.inner.drop_unit(unit, force)
    }

    fn unit_of(&self, block: BlockNo) -> Option<UnitId> {
        self.inner.unit_of(block)
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.inner.sync()
    }

    fn sync_data(&self) -> Result<(), StorageError> {
        self.inner.sync_data()
    }
}

/// Open a kernel over a [`WalCheckedStorage`] that checks from then on
pub fn open_checked_kernel(dir: &TempDir, pool_size: usize) -> Result<(Kernel, Arc<WalCheckedStorage>)> {
    let config = test_config(dir.path(), pool_size, 1);
    let storage = Arc::new(WalCheckedStorage::new(&config));
    let kernel = Kernel::open_with(
        config,
        Arc::clone(&storage) as Arc<dyn Storage>,
        OperationRegistry::new(),
        Arc::new(NoLocking),
    )?;
    storage.attach(Arc::clone(kernel.log()));
    Ok((kernel, storage))
}
