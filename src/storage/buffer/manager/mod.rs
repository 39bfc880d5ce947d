mod basic_operations;
mod frame_management;
mod transactions;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use log::info;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{BlockNo, ContainerId, FrameId, Lsn, PageId};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::frame::Frame;
use crate::storage::buffer::replacer::{ReplacementPolicy, Replacer};
use crate::storage::buffer::stats::BufferPoolStats;
use crate::storage::disk::Storage;
use crate::transaction::wal::LogManager;

pub use transactions::{LogMode, PageReleaser};

/// Configuration for the buffer manager
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum number of frames
    pub pool_size: usize,

    /// Blocks loaded per miss, including the requested one
    pub read_ahead: usize,

    pub replacement: ReplacementPolicy,

    /// Container whose pages this pool caches
    pub container: ContainerId,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            read_ahead: 8,
            replacement: ReplacementPolicy::TwoQueue,
            container: 0,
        }
    }
}

/// Everything guarded by the pool lock
pub(crate) struct PoolState {
    pub page_table: HashMap<PageId, FrameId>,
    pub frames: Vec<Arc<Frame>>,
    pub free_list: VecDeque<FrameId>,
    pub replacer: Box<dyn Replacer>,
}

/// Buffer manager: caches the pages of one container in a bounded set of frames.
///
/// A single pool lock guards the page table and pool membership; each frame
/// carries its own latch for the page bytes. A thread holding the pool lock
/// only ever *tries* a frame latch, so storage and log I/O always happen with
/// the pool lock released. Before any dirty frame is written, the log is
/// flushed up to the frame's page LSN.
pub struct BufferManager {
    pub(crate) config: BufferPoolConfig,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) log: Arc<LogManager>,
    pub(crate) state: Mutex<PoolState>,
    /// Signalled whenever a frame leaves the Loading or Evicting state
    pub(crate) io_done: Condvar,
    pub(crate) stats: BufferPoolStats,
    open: AtomicBool,
    /// Pages allocated again during redo, with the LSN of that allocation
    pub(crate) redo_reallocations: Mutex<HashMap<PageId, Lsn>>,
}

impl BufferManager {
    pub fn new(config: BufferPoolConfig, storage: Arc<dyn Storage>, log: Arc<LogManager>) -> Self {
        let pool_size = config.pool_size.max(1);
        let replacer = config.replacement.build(pool_size);
        Self {
            config: BufferPoolConfig { pool_size, ..config },
            storage,
            log,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                frames: Vec::with_capacity(pool_size),
                free_list: VecDeque::new(),
                replacer,
            }),
            io_done: Condvar::new(),
            stats: BufferPoolStats::new(),
            open: AtomicBool::new(false),
            redo_reallocations: Mutex::new(HashMap::new()),
        }
    }

    /// Open the pool, opening the storage if necessary
    pub fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(BufferPoolError::AlreadyOpen);
        }
        if self.storage.is_closed() {
            if let Err(e) = self.storage.open() {
                self.open.store(false, Ordering::SeqCst);
                return Err(BufferPoolError::storage("opening storage", e));
            }
        }
        let state = self.state.lock();
        info!(
            "Opened buffer pool: {} frames, read-ahead {}, {} replacement",
            self.config.pool_size,
            self.config.read_ahead,
            state.replacer.name()
        );
        Ok(())
    }

    /// Write back every dirty frame and close the storage.
    ///
    /// Fails with `PendingFixes` while pages are fixed, unless `force` is set.
    pub fn close(&self, force: bool) -> Result<()> {
        self.check_open()?;
        let fixes = self.outstanding_fixes();
        if fixes > 0 && !force {
            return Err(BufferPoolError::PendingFixes(fixes));
        }
        self.flush_all()?;
        self.storage
            .close()
            .map_err(|e| BufferPoolError::storage("closing storage", e))?;

        let mut state = self.state.lock();
        let pool_size = self.config.pool_size;
        state.page_table.clear();
        state.frames.clear();
        state.free_list.clear();
        state.replacer = self.config.replacement.build(pool_size);
        self.open.store(false, Ordering::SeqCst);
        info!("Closed buffer pool ({})", self.stats.snapshot());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BufferPoolError::NotOpen)
        }
    }

    pub(crate) fn check_page_id(&self, page_id: PageId) -> Result<()> {
        if !page_id.is_valid() || page_id.container != self.config.container {
            return Err(BufferPoolError::InvalidOperation(format!(
                "page {} is not a page of container {}",
                page_id, self.config.container
            )));
        }
        Ok(())
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Page id of `block` in this pool's container
    pub fn page_id(&self, block: BlockNo) -> PageId {
        PageId::new(self.config.container, block)
    }

    /// Smallest redo LSN over all dirty frames
    pub fn min_redo_lsn(&self) -> Option<Lsn> {
        let state = self.state.lock();
        state
            .frames
            .iter()
            .filter(|frame| frame.is_modified())
            .filter_map(|frame| frame.redo_lsn())
            .min()
    }

    /// Sum of the fix counts of all frames
    pub fn outstanding_fixes(&self) -> usize {
        let state = self.state.lock();
        state.frames.iter().map(|frame| frame.fix_count() as usize).sum()
    }

    /// Number of frames whose latch is currently held
    pub fn latched_frames(&self) -> usize {
        let state = self.state.lock();
        state
            .frames
            .iter()
            .filter(|frame| frame.try_write().is_none())
            .count()
    }

    /// Whether `page_id` is resident and ready
    pub fn contains_page(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .is_some_and(|&frame_id| state.frames[frame_id as usize].holds(page_id))
    }

    /// Number of frames created so far
    pub fn frame_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Make block data and allocation metadata durable
    pub fn sync_storage(&self) -> Result<()> {
        self.storage
            .sync()
            .map_err(|e| BufferPoolError::storage("syncing storage", e))
    }
}
