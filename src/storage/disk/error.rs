use thiserror::Error;

use crate::common::types::{BlockNo, UnitId};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Block {0} is not allocated")]
    BlockNotAllocated(BlockNo),
    #[error("Block {0} is already allocated to unit {1}")]
    BlockAlreadyAllocated(BlockNo, UnitId),
    #[error("Unit {0} does not exist")]
    UnitNotFound(UnitId),
    #[error("Unit {0} already exists")]
    UnitExists(UnitId),
    #[error("Storage is closed")]
    Closed,
    #[error("Storage is already open")]
    AlreadyOpen,
    #[error("Buffer of {actual} bytes cannot hold {count} blocks of {block_size} bytes")]
    BufferSize { actual: usize, count: usize, block_size: usize },
    #[error("Metadata error: {0}")]
    Metadata(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
