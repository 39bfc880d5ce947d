//! Log operations: the redo/undo payloads carried by log records.
//!
//! Each operation serializes itself behind a one-byte type tag. The
//! [`OperationRegistry`] maps tags back to decoders, so higher layers can
//! register their own operations next to the built-in [`StorageOperation`]s.

pub mod storage_ops;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use parking_lot::RwLock;

use crate::common::types::Lsn;
use crate::transaction::concurrency::{Result, Transaction, TransactionError};
use crate::transaction::wal::OperationPayload;

pub use storage_ops::StorageOperation;

/// Tags below this value are reserved for built-in operations
pub const FIRST_EXTERNAL_TAG: u8 = 64;

/// A redoable and undoable change recorded in the log
pub trait LogOperation: Send + Sync + fmt::Debug {
    fn type_tag(&self) -> u8;

    /// Reapply the change recorded at `lsn`. Must be idempotent.
    fn redo(&self, tx: &Transaction, lsn: Lsn) -> Result<()>;

    /// Revert the change recorded at `lsn`, logging a compensation record
    /// whose undo-next pointer is `undo_next`
    fn undo(&self, tx: &Transaction, lsn: Lsn, undo_next: Lsn) -> Result<()>;

    /// Serialized size in bytes
    fn size(&self) -> usize;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<()>;
}

/// Encode an operation into the payload stored in a log record
pub fn encode_operation(op: &dyn LogOperation) -> Result<OperationPayload> {
    let mut data = Vec::with_capacity(op.size());
    op.serialize(&mut data)?;
    Ok(OperationPayload {
        tag: op.type_tag(),
        data,
    })
}

pub type OperationDecoder = fn(&[u8]) -> Result<Box<dyn LogOperation>>;

/// Type tag registry used to decode operation payloads.
///
/// Cloning shares the underlying table.
#[derive(Clone)]
pub struct OperationRegistry {
    decoders: Arc<RwLock<HashMap<u8, OperationDecoder>>>,
}

impl OperationRegistry {
    /// A registry holding the built-in storage operations
    pub fn new() -> Self {
        let mut decoders: HashMap<u8, OperationDecoder> = HashMap::new();
        for tag in StorageOperation::TAGS {
            decoders.insert(tag, StorageOperation::decode);
        }
        Self {
            decoders: Arc::new(RwLock::new(decoders)),
        }
    }

    /// Register a decoder for an externally defined operation
    pub fn register(&self, tag: u8, decoder: OperationDecoder) -> Result<()> {
        if tag < FIRST_EXTERNAL_TAG {
            return Err(TransactionError::InvalidOperation(format!(
                "tag {} is reserved for built-in operations",
                tag
            )));
        }
        let mut decoders = self.decoders.write();
        if decoders.contains_key(&tag) {
            return Err(TransactionError::InvalidOperation(format!("tag {} is already registered", tag)));
        }
        decoders.insert(tag, decoder);
        Ok(())
    }

    pub fn is_registered(&self, tag: u8) -> bool {
        self.decoders.read().contains_key(&tag)
    }

    pub fn decode(&self, payload: &OperationPayload) -> Result<Box<dyn LogOperation>> {
        let decoder = self
            .decoders
            .read()
            .get(&payload.tag)
            .copied()
            .ok_or(TransactionError::UnknownOperation(payload.tag))?;
        decoder(&payload.data)
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
