use crate::common::types::TxnId;

/// The external lock manager, as far as transaction completion is concerned
pub trait LockService: Send + Sync {
    /// Release every lock held by `txn_id`
    fn release_all(&self, txn_id: TxnId);
}

/// Lock service for callers without transactional locking
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocking;

impl LockService for NoLocking {
    fn release_all(&self, _txn_id: TxnId) {}
}
