//! Background worker running post-commit hooks

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use crossbeam::channel::{self, Sender};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::common::types::TxnId;
use super::hooks::PostCommitHook;
use super::transaction::IsolationLevel;
use super::transaction_manager::TxManagerShared;

pub(crate) struct PostCommitJob {
    pub txn_id: TxnId,
    pub isolation_level: IsolationLevel,
    pub hooks: Vec<Arc<dyn PostCommitHook>>,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Runs queued post-commit jobs one after another on a dedicated thread
pub(crate) struct PostCommitExecutor {
    sender: Mutex<Option<Sender<PostCommitJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl PostCommitExecutor {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            pending: Arc::new(Pending::default()),
        }
    }

    /// Spawn the worker. Without a worker, jobs run on the submitting thread.
    pub fn start(&self, shared: Weak<TxManagerShared>) {
        let (sender, receiver) = channel::unbounded::<PostCommitJob>();
        let pending = Arc::clone(&self.pending);
        let spawned = thread::Builder::new()
            .name("post-commit".to_string())
            .spawn(move || {
                for job in receiver {
                    match shared.upgrade() {
                        Some(shared) => run_job(&shared, job),
                        None => debug!("Dropping post-commit work of transaction {}", job.txn_id),
                    }
                    pending.done();
                }
            });
        match spawned {
            Ok(handle) => {
                *self.sender.lock() = Some(sender);
                *self.worker.lock() = Some(handle);
            }
            Err(e) => error!("Could not start post-commit worker, running hooks inline: {}", e),
        }
    }

    pub fn submit(&self, shared: &Arc<TxManagerShared>, job: PostCommitJob) {
        self.pending.add();
        let job = match self.sender.lock().as_ref() {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(unsent) => unsent.into_inner(),
            },
            None => job,
        };
        run_job(shared, job);
        self.pending.done();
    }

    /// Block until every submitted job has run
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Stop accepting jobs, let the worker drain its queue and join it
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("Post-commit worker panicked");
            }
        }
    }
}

/// Run each hook of a committed transaction in its own nested transaction
fn run_job(shared: &Arc<TxManagerShared>, job: PostCommitJob) {
    for hook in job.hooks {
        let nested = TxManagerShared::begin(shared, job.isolation_level, false);
        match hook.execute(&nested) {
            Ok(()) => {
                if let Err(e) = nested.commit() {
                    error!(
                        "Nested transaction {} of post-commit hook for transaction {} failed to commit: {}",
                        nested.id(),
                        job.txn_id,
                        e
                    );
                }
            }
            Err(e) => {
                error!("Post-commit hook of transaction {} failed: {}", job.txn_id, e);
                if let Err(e) = nested.rollback() {
                    error!("Rollback of nested transaction {} failed: {}", nested.id(), e);
                }
            }
        }
    }
}
