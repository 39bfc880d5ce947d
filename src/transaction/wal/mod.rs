// Write-ahead log: record format, in-memory tail buffer and segment files

pub mod log_record;
pub mod log_buffer;
pub mod log_file;
pub mod log_manager;

pub use log_buffer::LogBufferConfig;
pub use log_manager::{LogIterator, LogManager, LogManagerConfig, LogManagerError, Result};
pub use log_record::{LogRecord, LogRecordType, OperationPayload};
