pub mod types;

pub use types::{BlockNo, ContainerId, FrameId, Lsn, PageId, TxnId, UnitId, FIRST_LSN, INVALID_LSN};
