use std::sync::Arc;

use super::transaction::{Result, Transaction};

/// Runs while a transaction commits, before its EOT record is written.
///
/// Hooks registered under the same group key are coalesced into one instance
/// per transaction (see [`Transaction::pre_commit_hook_for`]).
pub trait PreCommitHook: Send + Sync {
    /// Called in registration order. An error rolls the transaction back.
    fn prepare(&self, tx: &Transaction) -> Result<()>;

    /// Called when the transaction rolls back instead
    fn abort(&self, tx: &Transaction);

    /// Work left over when restart finds the transaction committed, to run
    /// once redo has finished
    fn recovered_commit(&self) -> Option<Arc<dyn PostRedoHook>> {
        None
    }
}

/// Runs after a durable commit, inside a fresh nested transaction
pub trait PostCommitHook: Send + Sync {
    fn execute(&self, tx: &Transaction) -> Result<()>;
}

/// Runs once at restart, after the redo pass
pub trait PostRedoHook: Send + Sync {
    fn execute(&self) -> Result<()>;
}
