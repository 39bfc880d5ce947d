use std::fmt;
use std::sync::Arc;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::types::{Lsn, PageId, UnitId};
use crate::storage::buffer::frame::Frame;
use crate::storage::page::Page;

/// A fixed page. The fix is released when the handle is dropped.
///
/// Holding a handle keeps the frame resident; reading or changing the page
/// additionally requires the frame latch through [`read`](Self::read) or
/// [`write`](Self::write).
pub struct PageHandle {
    frame: Arc<Frame>,
    page_id: PageId,
    unit: UnitId,
}

impl PageHandle {
    pub(crate) fn new(frame: Arc<Frame>, page_id: PageId, unit: UnitId) -> Self {
        Self { frame, page_id, unit }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Shared latch
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.read()
    }

    /// Conditional shared latch; `None` if someone holds it exclusively
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Page>> {
        self.frame.try_read()
    }

    /// Exclusive latch
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.write()
    }

    /// Record a logged change made under the exclusive latch.
    ///
    /// Stamps the page with `lsn` and marks the frame dirty so the change is
    /// written back, after the log, on the next flush or eviction.
    pub fn mark_modified(&self, page: &mut Page, lsn: Lsn) {
        if lsn > page.lsn() {
            page.set_lsn(lsn);
        }
        self.frame.set_modified(lsn);
    }

    pub fn is_modified(&self) -> bool {
        self.frame.is_modified()
    }

    /// Page LSN, read under a short shared latch
    pub fn lsn(&self) -> Lsn {
        self.frame.read().lsn()
    }

    pub(crate) fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.frame.unfix();
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("unit", &self.unit)
            .field("frame", &self.frame.id())
            .finish()
    }
}
