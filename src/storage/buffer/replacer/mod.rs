//! Replacement policies for the buffer manager.
//!
//! - [`TwoQueueReplacer`]: the default, separates one-time references from the working set
//! - [`LruReplacer`]: plain least-recently-used

mod lru;
mod two_queue;

pub use lru::LruReplacer;
pub use two_queue::TwoQueueReplacer;

use crate::common::types::FrameId;

/// Selects which frame to recycle on a capacity miss.
///
/// The buffer manager calls every method while holding its pool lock, so
/// implementations need no synchronization of their own.
pub trait Replacer: Send {
    /// A fixed frame was referenced
    fn record_reference(&mut self, frame_id: FrameId);

    /// A frame was loaded by read-ahead and not referenced yet
    fn record_prefetch(&mut self, frame_id: FrameId);

    /// Forget a frame, e.g. because its page was deleted
    fn remove(&mut self, frame_id: FrameId);

    /// Pick and forget a victim among the frames for which `is_fixed` is false
    fn victim(&mut self, is_fixed: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Number of frames tracked
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str;
}

/// Which replacement policy a buffer pool uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicy {
    #[default]
    TwoQueue,
    Lru,
}

impl ReplacementPolicy {
    pub fn build(self, capacity: usize) -> Box<dyn Replacer> {
        match self {
            ReplacementPolicy::TwoQueue => Box::new(TwoQueueReplacer::new(capacity)),
            ReplacementPolicy::Lru => Box::new(LruReplacer::new(capacity)),
        }
    }
}
