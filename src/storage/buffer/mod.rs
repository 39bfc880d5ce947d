pub mod error;
pub mod frame;
pub mod handle;
pub mod manager;
pub mod release;
pub mod replacer;
pub mod stats;

pub use error::BufferPoolError;
pub use frame::FrameState;
pub use handle::PageHandle;
pub use manager::{BufferManager, BufferPoolConfig, LogMode, PageReleaser};
pub use release::{DeferredRelease, ReleaseEntry};
pub use replacer::ReplacementPolicy;
pub use stats::{BufferPoolStats, StatsSnapshot};
