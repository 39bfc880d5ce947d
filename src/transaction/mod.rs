// Transaction management: WAL, transactions, log operations and restart recovery

pub mod concurrency;
pub mod operation;
pub mod recovery;
pub mod wal;

// Public exports
pub use concurrency::{Transaction, TransactionError, TransactionManager};
pub use operation::{LogOperation, OperationRegistry, StorageOperation};
pub use wal::{LogManager, LogRecord, LogRecordType};
