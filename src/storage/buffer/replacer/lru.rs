use std::collections::VecDeque;
use crate::common::types::FrameId;
use super::Replacer;

/// Simple LRU (Least Recently Used) page replacement policy
pub struct LruReplacer {
    lru_list: VecDeque<FrameId>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            lru_list: VecDeque::with_capacity(pool_size),
        }
    }

    fn unlink(&mut self, frame_id: FrameId) {
        if let Some(pos) = self.lru_list.iter().position(|&id| id == frame_id) {
            self.lru_list.remove(pos);
        }
    }
}

impl Replacer for LruReplacer {
    /// Move the frame to the front (most recently used)
    fn record_reference(&mut self, frame_id: FrameId) {
        self.unlink(frame_id);
        self.lru_list.push_front(frame_id);
    }

    // No scan resistance here: prefetched frames count as used
    fn record_prefetch(&mut self, frame_id: FrameId) {
        self.record_reference(frame_id);
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.unlink(frame_id);
    }

    /// Victim selection: the least recently used unfixed frame
    fn victim(&mut self, is_fixed: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let pos = self.lru_list.iter().rposition(|&id| !is_fixed(id))?;
        self.lru_list.remove(pos)
    }

    fn len(&self) -> usize {
        self.lru_list.len()
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}
