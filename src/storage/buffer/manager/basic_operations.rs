use std::sync::Arc;
use log::debug;

use crate::common::types::{PageId, TxnId};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::frame::{Frame, FrameState};
use crate::storage::buffer::handle::PageHandle;
use crate::storage::page::Page;
use crate::transaction::concurrency::Transaction;
use super::BufferManager;

/// Longest run of consecutive blocks written with one storage call
pub(crate) const MAX_WRITE_RUN: usize = 64;

impl BufferManager {
    /// Fix `page_id`, loading it from storage on a miss.
    ///
    /// Blocks while another thread is loading or evicting the frame the page
    /// maps to. Fails with `PoolExhausted` when every frame is fixed.
    pub fn fix_page(&self, page_id: PageId) -> Result<PageHandle> {
        self.check_open()?;
        self.check_page_id(page_id)?;

        let mut state = self.state.lock();
        loop {
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                let frame = Arc::clone(&state.frames[frame_id as usize]);
                let (ready, unit) = {
                    let meta = frame.meta();
                    (meta.state == FrameState::Ready && meta.page_id == Some(page_id), meta.unit)
                };
                if !ready {
                    self.io_done.wait(&mut state);
                    continue;
                }
                frame.fix();
                state.replacer.record_reference(frame_id);
                drop(state);
                self.stats.record_hit();
                return Ok(PageHandle::new(frame, page_id, unit));
            }

            let Some(unit) = self.storage.unit_of(page_id.block) else {
                return Err(BufferPoolError::PageNotFound(page_id));
            };
            return self.load_pages(state, page_id, unit);
        }
    }

    /// Release a fix. Equivalent to dropping the handle.
    pub fn unfix_page(&self, handle: PageHandle) {
        drop(handle);
    }

    /// Write the page of `handle` together with the longest run of compatible
    /// dirty neighbours: same unit, consecutive blocks, and not assigned to a
    /// different transaction.
    ///
    /// The caller must not hold the latch of `handle`.
    pub fn flush_page(&self, handle: &PageHandle) -> Result<()> {
        self.check_open()?;
        let center = handle.page_id();
        let frame = handle.frame();
        let owner = frame.assigned_to();
        let unit = handle.unit();

        let (left, right) = {
            let state = self.state.lock();
            let neighbour = |page_id: PageId| -> Option<(PageId, Arc<Frame>)> {
                let &frame_id = state.page_table.get(&page_id)?;
                let candidate = &state.frames[frame_id as usize];
                let compatible = candidate.holds(page_id)
                    && candidate.is_modified()
                    && candidate.unit() == unit
                    && candidate.assigned_to().is_none_or(|txn| Some(txn) == owner);
                compatible.then(|| (page_id, Arc::clone(candidate)))
            };

            let mut left = Vec::new();
            let mut block = center.block;
            while left.len() + 1 < MAX_WRITE_RUN && block > 1 {
                block -= 1;
                match neighbour(PageId::new(center.container, block)) {
                    Some(found) => left.push(found),
                    None => break,
                }
            }
            let mut right = Vec::new();
            let mut block = center.block;
            while left.len() + right.len() + 1 < MAX_WRITE_RUN {
                block += 1;
                match neighbour(PageId::new(center.container, block)) {
                    Some(found) => right.push(found),
                    None => break,
                }
            }
            (left, right)
        };

        let center_page = frame.read();
        if !frame.is_modified() {
            return Ok(());
        }

        // Neighbours are only tried; a busy latch ends the run on that side
        let mut left_pages = Vec::new();
        for (page_id, neighbour) in &left {
            let Some(page) = neighbour.try_read() else { break };
            if !neighbour.holds(*page_id) || !neighbour.is_modified() {
                break;
            }
            left_pages.push((neighbour, page));
        }
        let mut right_pages = Vec::new();
        for (page_id, neighbour) in &right {
            let Some(page) = neighbour.try_read() else { break };
            if !neighbour.holds(*page_id) || !neighbour.is_modified() {
                break;
            }
            right_pages.push((neighbour, page));
        }

        let mut pages: Vec<&Page> = left_pages.iter().rev().map(|(_, page)| &**page).collect();
        pages.push(&*center_page);
        pages.extend(right_pages.iter().map(|(_, page)| &**page));
        self.write_pages(&pages)?;

        frame.set_clean();
        for (neighbour, _) in left_pages.iter().chain(right_pages.iter()) {
            neighbour.set_clean();
        }
        debug!("Flushed {} page(s) around {}", pages.len(), center);
        Ok(())
    }

    /// Write back every dirty frame in the pool
    pub fn flush_all(&self) -> Result<()> {
        self.check_open()?;
        let mut dirty: Vec<(PageId, Arc<Frame>)> = {
            let state = self.state.lock();
            state
                .frames
                .iter()
                .filter(|frame| frame.is_modified())
                .filter_map(|frame| {
                    let meta = frame.meta();
                    match (meta.state, meta.page_id) {
                        (FrameState::Ready, Some(page_id)) => Some((page_id, Arc::clone(frame))),
                        _ => None,
                    }
                })
                .collect()
        };
        dirty.sort_by_key(|(page_id, _)| *page_id);
        let written = self.flush_frames(&dirty)?;
        if written > 0 {
            debug!("Flushed {} dirty page(s)", written);
        }
        Ok(())
    }

    /// Write back the frames assigned to `tx` and release the assignment
    pub fn flush_assigned(&self, tx: &Transaction) -> Result<()> {
        self.check_open()?;
        let assigned = tx.take_assigned_pages();
        if assigned.is_empty() {
            return Ok(());
        }

        let mut owned = self.assigned_frames(tx.id(), &assigned);
        owned.sort_by_key(|(page_id, _)| *page_id);
        let dirty: Vec<_> = owned
            .iter()
            .filter(|(_, frame)| frame.is_modified())
            .cloned()
            .collect();
        let flushed = self.flush_frames(&dirty);

        for (_, frame) in &owned {
            let mut meta = frame.meta();
            if meta.assigned_to == Some(tx.id()) {
                meta.assigned_to = None;
            }
        }
        flushed.map(drop)
    }

    /// Release the frames assigned to `tx` without writing them
    pub fn unassign_all(&self, tx: &Transaction) {
        let assigned = tx.take_assigned_pages();
        for (_, frame) in self.assigned_frames(tx.id(), &assigned) {
            let mut meta = frame.meta();
            if meta.assigned_to == Some(tx.id()) {
                meta.assigned_to = None;
            }
        }
    }

    /// Record that `tx` owns the pending update on the page of `handle`.
    ///
    /// # Panics
    ///
    /// If the frame is already assigned to a different transaction.
    pub fn assign(&self, handle: &PageHandle, tx: &Transaction) {
        {
            let mut meta = handle.frame().meta();
            match meta.assigned_to {
                Some(owner) if owner != tx.id() => panic!(
                    "page {} is assigned to transaction {} and cannot be assigned to {}",
                    handle.page_id(),
                    owner,
                    tx.id()
                ),
                Some(_) => return,
                None => meta.assigned_to = Some(tx.id()),
            }
        }
        tx.add_assigned_page(handle.page_id());
    }

    fn assigned_frames(&self, txn_id: TxnId, pages: &[PageId]) -> Vec<(PageId, Arc<Frame>)> {
        let state = self.state.lock();
        pages
            .iter()
            .filter_map(|page_id| {
                let &frame_id = state.page_table.get(page_id)?;
                let frame = &state.frames[frame_id as usize];
                (frame.holds(*page_id) && frame.assigned_to() == Some(txn_id))
                    .then(|| (*page_id, Arc::clone(frame)))
            })
            .collect()
    }

    /// Write `frames`, sorted by page id, in runs of consecutive blocks.
    ///
    /// Each run starts with a blocking latch and extends only over latches
    /// that can be taken without waiting. Returns the number of pages written.
    fn flush_frames(&self, frames: &[(PageId, Arc<Frame>)]) -> Result<usize> {
        let mut written = 0;
        let mut next = 0;
        while next < frames.len() {
            let (page_id, frame) = &frames[next];
            next += 1;
            let first = frame.read();
            if !frame.holds(*page_id) || !frame.is_modified() {
                continue;
            }
            let unit = frame.unit();
            let mut run = vec![(frame, first)];
            let mut last_block = page_id.block;

            while next < frames.len() && run.len() < MAX_WRITE_RUN {
                let (candidate_id, candidate) = &frames[next];
                if candidate_id.block != last_block + 1 || candidate.unit() != unit {
                    break;
                }
                let Some(page) = candidate.try_read() else { break };
                if !candidate.holds(*candidate_id) || !candidate.is_modified() {
                    break;
                }
                run.push((candidate, page));
                last_block = candidate_id.block;
                next += 1;
            }

            let pages: Vec<&Page> = run.iter().map(|(_, page)| &**page).collect();
            self.write_pages(&pages)?;
            for (frame, _) in &run {
                frame.set_clean();
            }
            written += run.len();
        }
        Ok(written)
    }
}
