use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::StorageError;
use crate::transaction::concurrency::TransactionError;
use crate::transaction::wal::LogManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Buffer pool is already open")]
    AlreadyOpen,
    #[error("Buffer pool is not open")]
    NotOpen,
    #[error("Buffer pool exhausted: all frames are fixed")]
    PoolExhausted,
    #[error("Storage failure while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: StorageError,
    },
    #[error("Page {0} is already mapped")]
    PageAlreadyMapped(PageId),
    #[error("Page {0} not found")]
    PageNotFound(PageId),
    #[error("Page {0} is fixed")]
    PageFixed(PageId),
    #[error("Cannot close with {0} outstanding fixes")]
    PendingFixes(usize),
    #[error("Log error: {0}")]
    Log(#[from] LogManagerError),
    #[error("Transaction error: {0}")]
    Transaction(Box<TransactionError>),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl BufferPoolError {
    pub(crate) fn storage(context: impl Into<String>, source: StorageError) -> Self {
        BufferPoolError::Storage {
            context: context.into(),
            source,
        }
    }

    /// True when the target page no longer exists in storage
    pub fn is_page_not_found(&self) -> bool {
        matches!(
            self,
            BufferPoolError::PageNotFound(_)
                | BufferPoolError::Storage {
                    source: StorageError::BlockNotAllocated(_),
                    ..
                }
        )
    }
}

impl From<TransactionError> for BufferPoolError {
    fn from(e: TransactionError) -> Self {
        BufferPoolError::Transaction(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, BufferPoolError>;
