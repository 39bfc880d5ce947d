use std::sync::Arc;
use log::{debug, warn};
use parking_lot::MutexGuard;

use crate::common::types::{BlockNo, FrameId, PageId, UnitId, INVALID_LSN};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::frame::{Frame, FrameState};
use crate::storage::buffer::handle::PageHandle;
use crate::storage::page::Page;
use super::{BufferManager, PoolState};

/// A frame reserved for a page that is not resident yet.
///
/// The frame is fixed, mapped to `page_id` and in the Loading state, or in
/// the Evicting state while its previous dirty page still has to be written.
pub(super) struct Claim {
    pub frame: Arc<Frame>,
    pub page_id: PageId,
    pub unit: UnitId,
    pub evicting: Option<PageId>,
}

impl BufferManager {
    /// Reserve a frame for `page_id`: a free one, a new one while the pool
    /// can grow, or a victim picked by the replacer.
    pub(super) fn claim_frame(&self, state: &mut PoolState, page_id: PageId, unit: UnitId) -> Result<Claim> {
        let frame = if let Some(frame_id) = state.free_list.pop_front() {
            Arc::clone(&state.frames[frame_id as usize])
        } else if state.frames.len() < self.config.pool_size {
            let frame = Arc::new(Frame::new(state.frames.len() as FrameId, self.storage.block_size()));
            state.frames.push(Arc::clone(&frame));
            frame
        } else {
            let PoolState { frames, replacer, .. } = state;
            let victim = replacer
                .victim(&|id| frames[id as usize].is_fixed())
                .ok_or(BufferPoolError::PoolExhausted)?;
            Arc::clone(&frames[victim as usize])
        };
        frame.fix();

        let mut meta = frame.meta();
        let mut evicting = None;
        if let Some(old) = meta.page_id {
            self.stats.record_eviction();
            if frame.is_modified() {
                // Keep the old mapping until the write-back is done
                evicting = Some(old);
            } else {
                state.page_table.remove(&old);
            }
        }
        match evicting {
            Some(_) => meta.state = FrameState::Evicting,
            None => {
                meta.page_id = Some(page_id);
                meta.unit = unit;
                meta.assigned_to = None;
                meta.state = FrameState::Loading;
            }
        }
        drop(meta);
        state.page_table.insert(page_id, frame.id());

        Ok(Claim {
            frame,
            page_id,
            unit,
            evicting,
        })
    }

    /// Write back the dirty pages of evicted victims and remap their frames.
    ///
    /// A failure on the first claim is returned; a failure on a later (read-ahead)
    /// claim only shortens the run.
    pub(super) fn write_back_claims(&self, claims: Vec<Claim>) -> Result<Vec<Claim>> {
        let mut ready: Vec<Claim> = Vec::with_capacity(claims.len());
        let mut pending = claims.into_iter();

        while let Some(claim) = pending.next() {
            let Some(old) = claim.evicting else {
                ready.push(claim);
                continue;
            };

            let written = {
                let page = claim.frame.read();
                self.write_pages(&[&*page])
            };
            if let Err(e) = written {
                let failed: Vec<Claim> = std::iter::once(claim).chain(pending).collect();
                self.abandon_claims(failed);
                if ready.is_empty() {
                    return Err(e);
                }
                warn!("Stopping read-ahead after failed write-back of {}: {}", old, e);
                break;
            }

            {
                let mut state = self.state.lock();
                claim.frame.set_clean();
                state.page_table.remove(&old);
                let mut meta = claim.frame.meta();
                meta.page_id = Some(claim.page_id);
                meta.unit = claim.unit;
                meta.assigned_to = None;
                meta.state = FrameState::Loading;
            }
            self.io_done.notify_all();
            debug!("Evicted dirty page {} for {}", old, claim.page_id);

            ready.push(Claim {
                evicting: None,
                ..claim
            });
        }
        Ok(ready)
    }

    /// Give up claims, e.g. after a failed read
    pub(super) fn abandon_claims(&self, claims: Vec<Claim>) {
        let mut state = self.state.lock();
        for claim in claims {
            let id = claim.frame.id();
            if state.page_table.get(&claim.page_id) == Some(&id) {
                state.page_table.remove(&claim.page_id);
            }
            let mut meta = claim.frame.meta();
            meta.state = FrameState::Ready;
            if claim.evicting.is_some() {
                // The old dirty page is still mapped and stays resident
                drop(meta);
                state.replacer.record_reference(id);
            } else {
                meta.page_id = None;
                meta.assigned_to = None;
                drop(meta);
                claim.frame.set_clean();
                state.free_list.push_back(id);
            }
            claim.frame.unfix();
        }
        drop(state);
        self.io_done.notify_all();
    }

    /// Fill claimed frames for consecutive blocks with one storage read
    pub(super) fn read_claims(&self, claims: &[Claim]) -> Result<()> {
        let Some(first) = claims.first() else {
            return Ok(());
        };
        let block_size = self.storage.block_size();
        let count = claims.len();
        let mut guards: Vec<_> = claims.iter().map(|claim| claim.frame.write()).collect();

        let read = if count == 1 {
            self.storage.read(first.page_id.block, guards[0].bytes_mut(), 1)
        } else {
            let mut buf = vec![0u8; block_size * count];
            self.storage.read(first.page_id.block, &mut buf, count).map(|_| {
                for (guard, chunk) in guards.iter_mut().zip(buf.chunks(block_size)) {
                    guard.bytes_mut().copy_from_slice(chunk);
                }
            })
        };
        read.map_err(|e| BufferPoolError::storage(format!("reading {} block(s) at {}", count, first.page_id), e))?;

        for (guard, claim) in guards.iter_mut().zip(claims) {
            guard.set_page_id(claim.page_id);
        }
        self.stats.record_reads(count as u64);
        Ok(())
    }

    /// Publish loaded claims: the first one stays fixed for the caller, the
    /// rest are handed to the replacer as prefetched.
    pub(super) fn finish_claims(&self, claims: Vec<Claim>) -> Result<PageHandle> {
        let mut claims = claims.into_iter();
        let Some(requested) = claims.next() else {
            return Err(BufferPoolError::InvalidOperation("no frame was claimed".to_string()));
        };

        let mut state = self.state.lock();
        requested.frame.meta().state = FrameState::Ready;
        state.replacer.record_reference(requested.frame.id());

        let mut prefetched = 0;
        for claim in claims {
            claim.frame.meta().state = FrameState::Ready;
            state.replacer.record_prefetch(claim.frame.id());
            claim.frame.unfix();
            prefetched += 1;
        }
        drop(state);
        self.io_done.notify_all();

        if prefetched > 0 {
            self.stats.record_prefetches(prefetched);
        }
        Ok(PageHandle::new(requested.frame, requested.page_id, requested.unit))
    }

    /// Load `page_id` and up to `read_ahead - 1` following blocks of the same unit
    pub(super) fn load_pages(
        &self,
        mut state: MutexGuard<'_, PoolState>,
        page_id: PageId,
        unit: UnitId,
    ) -> Result<PageHandle> {
        let mut claims = vec![self.claim_frame(&mut state, page_id, unit)?];

        for offset in 1..self.config.read_ahead as BlockNo {
            let next = PageId::new(page_id.container, page_id.block + offset);
            if state.page_table.contains_key(&next) || self.storage.unit_of(next.block) != Some(unit) {
                break;
            }
            match self.claim_frame(&mut state, next, unit) {
                Ok(claim) => claims.push(claim),
                // Read-ahead never fails a fix
                Err(_) => break,
            }
        }
        drop(state);
        self.stats.record_miss();

        let claims = self.write_back_claims(claims)?;
        if let Err(e) = self.read_claims(&claims) {
            self.abandon_claims(claims);
            return Err(e);
        }
        self.finish_claims(claims)
    }

    /// Write pages of consecutive blocks, forcing the log up to their highest LSN first
    pub(crate) fn write_pages(&self, pages: &[&Page]) -> Result<()> {
        let Some(first) = pages.first() else {
            return Ok(());
        };
        let max_lsn = pages.iter().map(|page| page.lsn()).max().unwrap_or(INVALID_LSN);
        self.log.flush(max_lsn)?;

        let count = pages.len();
        let written = if count == 1 {
            self.storage.write(first.page_id().block, first.bytes(), 1, false)
        } else {
            let mut buf = Vec::with_capacity(first.bytes().len() * count);
            for page in pages {
                buf.extend_from_slice(page.bytes());
            }
            self.storage.write(first.page_id().block, &buf, count, false)
        };
        written.map_err(|e| BufferPoolError::storage(format!("writing {} page(s) at {}", count, first.page_id()), e))?;
        self.stats.record_writes(count as u64);
        Ok(())
    }

    /// Write the resident image of `page_id` back if it is dirty
    pub(crate) fn write_back_page(&self, page_id: PageId) -> Result<()> {
        let frame = {
            let state = self.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(());
            };
            Arc::clone(&state.frames[frame_id as usize])
        };
        let page = frame.read();
        if !frame.holds(page_id) || !frame.is_modified() {
            return Ok(());
        }
        self.write_pages(&[&*page])?;
        frame.set_clean();
        Ok(())
    }

    /// Drop the frame of `page_id` without writing it back
    pub(crate) fn discard_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(());
            };
            let frame = Arc::clone(&state.frames[frame_id as usize]);
            if !frame.holds(page_id) {
                self.io_done.wait(&mut state);
                continue;
            }
            if frame.is_fixed() {
                return Err(BufferPoolError::PageFixed(page_id));
            }
            let Some(latch) = frame.try_write() else {
                // A flush is reading the page; wait for it outside the pool lock
                drop(state);
                drop(frame.write());
                state = self.state.lock();
                continue;
            };

            state.page_table.remove(&page_id);
            state.replacer.remove(frame_id);
            {
                let mut meta = frame.meta();
                meta.page_id = None;
                meta.assigned_to = None;
            }
            frame.set_clean();
            drop(latch);
            state.free_list.push_back(frame_id);
            return Ok(());
        }
    }

    /// Drop every frame holding a page of `unit`
    pub(crate) fn discard_unit_pages(&self, unit: UnitId) -> Result<()> {
        let pages: Vec<PageId> = {
            let state = self.state.lock();
            state
                .page_table
                .iter()
                .filter(|&(_, &frame_id)| state.frames[frame_id as usize].unit() == unit)
                .map(|(&page_id, _)| page_id)
                .collect()
        };
        for page_id in pages {
            self.discard_page(page_id)?;
        }
        Ok(())
    }
}
