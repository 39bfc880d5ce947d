//! The assembled kernel: storage, log, buffer manager and transactions,
//! recovered on open.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::info;

use crate::common::types::{Lsn, DEFAULT_BLOCK_SIZE};
use crate::storage::buffer::{BufferManager, BufferPoolConfig};
use crate::storage::disk::{DiskManager, DiskManagerConfig, Storage};
use crate::transaction::concurrency::{IsolationLevel, LockService, NoLocking, Transaction, TransactionManager};
use crate::transaction::operation::OperationRegistry;
use crate::transaction::recovery::{RecoveryManager, RecoveryStats, Result};
use crate::transaction::wal::{LogManager, LogManagerConfig};

/// Configuration for a kernel instance
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Directory of the block space
    pub data_dir: PathBuf,

    pub block_size: usize,

    pub buffer: BufferPoolConfig,

    pub log: LogManagerConfig,
}

impl KernelConfig {
    /// Data under `dir/data`, log under `dir/wal`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            data_dir: dir.join("data"),
            block_size: DEFAULT_BLOCK_SIZE,
            buffer: BufferPoolConfig::default(),
            log: LogManagerConfig {
                log_dir: dir.join("wal"),
                ..LogManagerConfig::default()
            },
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new("pagevault")
    }
}

/// An open kernel.
///
/// [`close`](Self::close) shuts it down cleanly. Dropping it without closing
/// loses everything not yet forced, like a crash; the next open recovers.
pub struct Kernel {
    storage: Arc<dyn Storage>,
    log: Arc<LogManager>,
    buffer: Arc<BufferManager>,
    txns: TransactionManager,
    recovery: RecoveryStats,
}

impl Kernel {
    /// Open a kernel over a file-backed block space and run restart recovery
    pub fn open(config: KernelConfig) -> Result<Self> {
        let storage = Arc::new(DiskManager::new(DiskManagerConfig {
            data_dir: config.data_dir.clone(),
            block_size: config.block_size,
        }));
        Self::open_with(config, storage, OperationRegistry::new(), Arc::new(NoLocking))
    }

    /// Open a kernel over the given storage, decoding log operations through
    /// `registry`
    pub fn open_with(
        config: KernelConfig,
        storage: Arc<dyn Storage>,
        registry: OperationRegistry,
        locks: Arc<dyn LockService>,
    ) -> Result<Self> {
        let log = Arc::new(LogManager::new(config.log.clone())?);
        let buffer = Arc::new(BufferManager::new(config.buffer.clone(), Arc::clone(&storage), Arc::clone(&log)));
        buffer.open()?;
        let txns = TransactionManager::new(Arc::clone(&buffer), Arc::clone(&log), registry, locks);
        let recovery = RecoveryManager::new(&txns).recover()?;

        Ok(Self {
            storage,
            log,
            buffer,
            txns,
            recovery,
        })
    }

    /// Begin a read-write transaction at the default isolation level
    pub fn begin(&self) -> Arc<Transaction> {
        self.txns.begin_transaction(IsolationLevel::default())
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// What the recovery run at open did
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Truncate the log as far as the current state allows.
    /// Returns the first retained LSN.
    pub fn checkpoint(&self) -> Result<Lsn> {
        RecoveryManager::new(&self.txns).checkpoint()
    }

    /// Finish post-commit work, checkpoint and write everything back
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        self.buffer.close(false)?;
        self.log.flush_all()?;
        info!("Closed kernel, log retained from LSN {}", self.log.first_lsn());
        Ok(())
    }
}
