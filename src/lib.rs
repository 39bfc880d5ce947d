// pagevault: a crash-recoverable transactional page buffer

pub mod common;
pub mod kernel;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::types::{BlockNo, ContainerId, Lsn, PageId, TxnId, UnitId};
pub use kernel::{Kernel, KernelConfig};
pub use storage::buffer::{BufferManager, BufferPoolConfig, BufferPoolError, PageHandle, ReplacementPolicy};
pub use storage::disk::{DiskManager, Storage, StorageError};
pub use transaction::concurrency::{IsolationLevel, Transaction, TransactionError, TransactionManager};
pub use transaction::recovery::{RecoveryError, RecoveryManager, RecoveryStats};
pub use transaction::wal::{LogManager, LogManagerConfig};
