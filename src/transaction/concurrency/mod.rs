// Transaction concurrency module exports

pub mod executor;
pub mod hooks;
pub mod join;
pub mod lock;
pub mod transaction;
pub mod transaction_manager;

// Public exports
pub use hooks::{PostCommitHook, PostRedoHook, PreCommitHook};
pub use join::JoinGuard;
pub use lock::{LockService, NoLocking};
pub use transaction::{IsolationLevel, Result, Transaction, TransactionError, TransactionState, UNDO_RETRY_LIMIT};
pub use transaction_manager::TransactionManager;
