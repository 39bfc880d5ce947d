use thiserror::Error;
use serde::{Serialize, Deserialize};
use bincode::{serialize, deserialize};

use crate::common::types::{Lsn, TxnId, INVALID_LSN};

/// Error type for log record operations
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("Failed to serialize log record: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize log record: {0}")]
    DeserializationError(String),
}

/// Result type for log record operations
pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Types of log records supported by the WAL system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    /// A regular, undoable change
    Update,
    /// Compensation record written while undoing; never undone itself
    Clr,
    /// Redo-only change that the undo chain steps over
    UpdateSpecial,
    /// Compensation record without payload, only moves the undo chain
    Dummy,
    /// End of transaction, written after commit or complete rollback
    Eot,
}

/// Serialized form of a [`LogOperation`](crate::transaction::operation::LogOperation):
/// the registry tag plus the operation's own bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub tag: u8,
    pub data: Vec<u8>,
}

/// Main log record structure
///
/// The LSN is not part of the serialized body: it is the position of the
/// record in the log stream and is filled in when the record is appended or read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(skip)]
    pub lsn: Lsn,
    /// Transaction ID that generated this log record
    pub txn_id: TxnId,
    pub record_type: LogRecordType,
    /// LSN of the previous log record in this transaction
    pub prev_lsn: Lsn,
    /// Next record to undo; only meaningful for CLR, DUMMY and UPDATE_SPECIAL
    pub undo_next_lsn: Lsn,
    pub payload: Option<OperationPayload>,
}

impl LogRecord {
    pub fn new(
        txn_id: TxnId,
        record_type: LogRecordType,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        payload: Option<OperationPayload>,
    ) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            record_type,
            prev_lsn,
            undo_next_lsn,
            payload,
        }
    }

    pub fn new_update(txn_id: TxnId, prev_lsn: Lsn, payload: OperationPayload) -> Self {
        Self::new(txn_id, LogRecordType::Update, prev_lsn, INVALID_LSN, Some(payload))
    }

    pub fn new_clr(txn_id: TxnId, prev_lsn: Lsn, undo_next_lsn: Lsn, payload: OperationPayload) -> Self {
        Self::new(txn_id, LogRecordType::Clr, prev_lsn, undo_next_lsn, Some(payload))
    }

    pub fn new_update_special(txn_id: TxnId, prev_lsn: Lsn, payload: OperationPayload) -> Self {
        // The undo chain skips this record and continues at its predecessor
        Self::new(txn_id, LogRecordType::UpdateSpecial, prev_lsn, prev_lsn, Some(payload))
    }

    pub fn new_dummy(txn_id: TxnId, prev_lsn: Lsn, undo_next_lsn: Lsn) -> Self {
        Self::new(txn_id, LogRecordType::Dummy, prev_lsn, undo_next_lsn, None)
    }

    pub fn new_eot(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, LogRecordType::Eot, prev_lsn, INVALID_LSN, None)
    }

    /// True for records that are never undone
    pub fn is_compensation(&self) -> bool {
        matches!(
            self.record_type,
            LogRecordType::Clr | LogRecordType::UpdateSpecial | LogRecordType::Dummy
        )
    }

    /// Serialize the log record body (everything except the LSN)
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self).map_err(|e| LogRecordError::SerializationError(e.to_string()))
    }

    /// Size of the serialized body in bytes
    pub fn body_len(&self) -> Result<u64> {
        bincode::serialized_size(self).map_err(|e| LogRecordError::SerializationError(e.to_string()))
    }

    /// Deserialize a log record body read at `lsn`
    pub fn deserialize(lsn: Lsn, data: &[u8]) -> Result<Self> {
        let mut record: LogRecord = deserialize(data)
            .map_err(|e| LogRecordError::DeserializationError(e.to_string()))?;
        record.lsn = lsn;
        Ok(record)
    }
}
