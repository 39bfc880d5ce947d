pub mod disk_manager;
pub mod error;

pub use disk_manager::{DiskManager, DiskManagerConfig};
pub use error::StorageError;

use crate::common::types::{BlockNo, UnitId};
use error::Result;

/// Block-oriented storage underneath the buffer manager.
///
/// Blocks are numbered from 1 within one container and each allocated block
/// belongs to exactly one logical unit. The `force` flag on allocation and
/// release requests replay semantics: the call succeeds if the storage is
/// already in the requested state, which keeps redo and deferred release
/// idempotent.
pub trait Storage: Send + Sync {
    fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn block_size(&self) -> usize;

    /// Read `count` consecutive blocks starting at `block` into `buf`
    fn read(&self, block: BlockNo, buf: &mut [u8], count: usize) -> Result<()>;

    /// Write `count` consecutive blocks starting at `block` from `buf`
    fn write(&self, block: BlockNo, buf: &[u8], count: usize, sync: bool) -> Result<()>;

    /// Allocate `block` (or any free block when `None`) to `unit`
    fn allocate(&self, block: Option<BlockNo>, unit: UnitId, force: bool) -> Result<BlockNo>;

    fn release(&self, block: BlockNo, unit: UnitId, force: bool) -> Result<()>;

    /// Create `unit` (or a fresh unit when `None`)
    fn create_unit(&self, unit: Option<UnitId>, force: bool) -> Result<UnitId>;

    /// Drop `unit` and release every block it owns
    fn drop_unit(&self, unit: UnitId, force: bool) -> Result<()>;

    /// Owning unit of an allocated block
    fn unit_of(&self, block: BlockNo) -> Option<UnitId>;

    /// Make data and allocation metadata durable
    fn sync(&self) -> Result<()>;

    /// Make block data durable
    fn sync_data(&self) -> Result<()>;
}
