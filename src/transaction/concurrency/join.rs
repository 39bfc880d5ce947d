use std::collections::HashMap;
use std::thread::{self, ThreadId};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Vote {
    Commit,
    Rollback,
}

pub(crate) enum VoteOutcome {
    /// This caller finishes the transaction
    Lead,
    /// Another caller finished it
    Follow { agreed: bool, succeeded: bool },
    /// The transaction was finished before this vote was cast
    Finished,
}

struct JoinState {
    joined: HashMap<ThreadId, usize>,
    vote: Option<Vote>,
    outcome: Option<bool>,
    followers: usize,
}

/// Barrier over the threads cooperatively working on one transaction.
///
/// The first vote wins: it waits until no thread is joined any more and
/// then finishes the transaction exactly once. Later votes wait for that
/// finish and learn its outcome.
pub(crate) struct JoinBarrier {
    state: Mutex<JoinState>,
    changed: Condvar,
}

impl JoinBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JoinState {
                joined: HashMap::new(),
                vote: None,
                outcome: None,
                followers: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn join(&self) -> JoinGuard<'_> {
        let thread = thread::current().id();
        *self.state.lock().joined.entry(thread).or_insert(0) += 1;
        JoinGuard { barrier: self, thread }
    }

    fn leave(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if let Some(count) = state.joined.get_mut(&thread) {
            *count -= 1;
            if *count == 0 {
                state.joined.remove(&thread);
            }
        }
        self.changed.notify_all();
    }

    pub fn joined_count(&self) -> usize {
        self.state.lock().joined.values().sum()
    }

    /// Votes waiting for the winning vote to finish
    pub fn waiting_followers(&self) -> usize {
        self.state.lock().followers
    }

    /// Cast a vote.
    ///
    /// # Panics
    ///
    /// If the calling thread is still joined; it would wait for itself.
    pub fn vote(&self, vote: Vote) -> VoteOutcome {
        let thread = thread::current().id();
        let mut state = self.state.lock();
        if state.joined.contains_key(&thread) {
            panic!("thread {:?} voted while still joined to the transaction", thread);
        }

        match state.vote {
            None => {
                state.vote = Some(vote);
                state.outcome = None;
                while !state.joined.is_empty() {
                    self.changed.wait(&mut state);
                }
                VoteOutcome::Lead
            }
            Some(_) if state.outcome.is_some() => VoteOutcome::Finished,
            Some(first) => {
                state.followers += 1;
                let succeeded = loop {
                    if let Some(succeeded) = state.outcome {
                        break succeeded;
                    }
                    self.changed.wait(&mut state);
                };
                state.followers -= 1;
                VoteOutcome::Follow {
                    agreed: first == vote,
                    succeeded,
                }
            }
        }
    }

    /// Publish the outcome of the winning vote
    pub fn complete(&self, succeeded: bool) {
        self.state.lock().outcome = Some(succeeded);
        self.changed.notify_all();
    }

    /// Publish a failed finish that left the transaction open; the next
    /// vote leads again
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.vote = None;
        state.outcome = Some(false);
        self.changed.notify_all();
    }
}

/// Membership of the current thread in a transaction; leaves on drop
pub struct JoinGuard<'a> {
    barrier: &'a JoinBarrier,
    thread: ThreadId,
}

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.barrier.leave(self.thread);
    }
}
