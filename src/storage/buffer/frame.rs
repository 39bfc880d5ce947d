use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::types::{FrameId, Lsn, PageId, TxnId, UnitId, INVALID_LSN};
use crate::storage::page::Page;

/// Lifecycle of a frame's mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Content matches the mapped page
    Ready,
    /// Being filled from storage
    Loading,
    /// Old content being written back before the frame is remapped
    Evicting,
}

#[derive(Debug)]
pub(crate) struct FrameMeta {
    pub state: FrameState,
    pub page_id: Option<PageId>,
    pub unit: UnitId,
    pub assigned_to: Option<TxnId>,
}

/// One slot of the buffer pool.
///
/// The page bytes sit behind the frame latch. The fix count, modified flag
/// and redo LSN are atomics so they can be read without the latch; the mapping
/// metadata is only changed while the pool lock is held.
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    page: RwLock<Page>,
    fix_count: AtomicU32,
    modified: AtomicBool,
    redo_lsn: AtomicU64,
    meta: Mutex<FrameMeta>,
}

impl Frame {
    pub(crate) fn new(id: FrameId, block_size: usize) -> Self {
        Self {
            id,
            page: RwLock::new(Page::new(PageId::new(0, 0), block_size)),
            fix_count: AtomicU32::new(0),
            modified: AtomicBool::new(false),
            redo_lsn: AtomicU64::new(INVALID_LSN),
            meta: Mutex::new(FrameMeta {
                state: FrameState::Ready,
                page_id: None,
                unit: 0,
                assigned_to: None,
            }),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn fix(&self) {
        self.fix_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one fix. Unfixing a frame that is not fixed is a contract violation.
    pub(crate) fn unfix(&self) {
        let previous = self
            .fix_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
        if previous.is_err() {
            panic!("unfix of frame {} without a matching fix", self.id);
        }
    }

    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::SeqCst)
    }

    pub fn is_fixed(&self) -> bool {
        self.fix_count() > 0
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    /// First LSN that dirtied the frame since it was last written, if any
    pub fn redo_lsn(&self) -> Option<Lsn> {
        match self.redo_lsn.load(Ordering::SeqCst) {
            INVALID_LSN => None,
            lsn => Some(lsn),
        }
    }

    pub(crate) fn set_modified(&self, lsn: Lsn) {
        self.modified.store(true, Ordering::SeqCst);
        if lsn != INVALID_LSN {
            let _ = self.redo_lsn.compare_exchange(INVALID_LSN, lsn, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_clean(&self) {
        self.modified.store(false, Ordering::SeqCst);
        self.redo_lsn.store(INVALID_LSN, Ordering::SeqCst);
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub(crate) fn try_read(&self) -> Option<RwLockReadGuard<'_, Page>> {
        self.page.try_read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    pub(crate) fn try_write(&self) -> Option<RwLockWriteGuard<'_, Page>> {
        self.page.try_write()
    }

    pub(crate) fn meta(&self) -> parking_lot::MutexGuard<'_, FrameMeta> {
        self.meta.lock()
    }

    pub fn state(&self) -> FrameState {
        self.meta.lock().state
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.meta.lock().page_id
    }

    pub fn unit(&self) -> UnitId {
        self.meta.lock().unit
    }

    pub fn assigned_to(&self) -> Option<TxnId> {
        self.meta.lock().assigned_to
    }

    /// Ready and mapped to `page_id`
    pub(crate) fn holds(&self, page_id: PageId) -> bool {
        let meta = self.meta.lock();
        meta.state == FrameState::Ready && meta.page_id == Some(page_id)
    }
}
