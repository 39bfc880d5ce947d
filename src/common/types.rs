use std::fmt;
use serde::{Serialize, Deserialize};

/// Default block size in bytes (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Container ID type
pub type ContainerId = u16;

/// Block number inside a container
pub type BlockNo = u32;

/// Logical storage unit ID type
pub type UnitId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// LSN (Log Sequence Number) type: the logical byte position of a record in the log
pub type Lsn = u64;

/// "No LSN": end of an undo chain, never-logged page, empty log
pub const INVALID_LSN: Lsn = 0;

/// Position of the first record ever written to a log
pub const FIRST_LSN: Lsn = 1;

/// Block 0 never holds a page
pub const INVALID_BLOCK: BlockNo = 0;

/// Identifies a page: the container it lives in plus its block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub container: ContainerId,
    pub block: BlockNo,
}

impl PageId {
    pub const fn new(container: ContainerId, block: BlockNo) -> Self {
        Self { container, block }
    }

    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK
    }

    /// The page directly after this one in the same container
    pub fn next(&self) -> Self {
        Self::new(self.container, self.block + 1)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.block)
    }
}
