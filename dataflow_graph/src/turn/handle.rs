use super::TurnId;
use crate::error::TurnError;
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Shared state between a [`CommitHandle`] and the turn that resolves it.
///
/// Wakes both blocking waiters (condvar) and async waiters (`AtomicWaker`),
/// so the same handle can be `wait()`ed on a thread or `.await`ed in a task.
pub(crate) struct HandleShared {
    state: Mutex<CommitState>,
    done: Condvar,
    waker: AtomicWaker,
}

enum CommitState {
    Queued,
    Running,
    Done(Result<TurnId, TurnError>),
}

impl HandleShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CommitState::Queued),
            done: Condvar::new(),
            waker: AtomicWaker::new(),
        })
    }

    /// Claims the turn for execution. Returns `false` if the handle was
    /// cancelled while queued.
    pub fn begin(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CommitState::Queued => {
                *state = CommitState::Running;
                true
            }
            _ => false,
        }
    }

    pub fn resolve(&self, result: Result<TurnId, TurnError>) {
        {
            let mut state = self.state.lock();
            if matches!(*state, CommitState::Done(_)) {
                return;
            }
            *state = CommitState::Done(result);
        }
        self.done.notify_all();
        self.waker.wake();
    }

    fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            match *state {
                CommitState::Queued => {
                    *state = CommitState::Done(Err(TurnError::Cancelled));
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            self.done.notify_all();
            self.waker.wake();
        }
        cancelled
    }

    fn result(&self) -> Option<Result<TurnId, TurnError>> {
        match &*self.state.lock() {
            CommitState::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    fn wait(&self) -> Result<TurnId, TurnError> {
        let mut state = self.state.lock();
        loop {
            if let CommitState::Done(result) = &*state {
                return result.clone();
            }
            self.done.wait(&mut state);
        }
    }
}

/// A handle to the commit of one transaction.
///
/// Resolves once the turn has committed (or was cancelled). Blocking callers
/// use [`wait`](CommitHandle::wait); async callers can `.await` the handle
/// directly.
///
/// Do not call `wait` from inside an observer callback of the same domain:
/// the observer runs while the turn it belongs to is still committing, so
/// the wait could never finish.
#[derive(Clone)]
pub struct CommitHandle {
    shared: Arc<HandleShared>,
}

impl CommitHandle {
    pub(crate) fn new() -> (Self, Arc<HandleShared>) {
        let shared = HandleShared::new();
        (
            Self {
                shared: Arc::clone(&shared),
            },
            shared,
        )
    }

    /// A handle that is already resolved; used when a transaction is
    /// rejected before it can even be queued.
    pub(crate) fn resolved(result: Result<TurnId, TurnError>) -> Self {
        let (handle, shared) = Self::new();
        shared.resolve(result);
        handle
    }

    /// Blocks the calling thread until the turn commits, then returns the
    /// committed turn id or the aggregated failure report.
    pub fn wait(&self) -> Result<TurnId, TurnError> {
        self.shared.wait()
    }

    /// Returns the commit result if the turn has already finished.
    pub fn try_result(&self) -> Option<Result<TurnId, TurnError>> {
        self.shared.result()
    }

    /// Whether the turn has committed, failed, or been cancelled.
    pub fn is_done(&self) -> bool {
        self.shared.result().is_some()
    }

    /// Cancels the transaction if it has not started running.
    ///
    /// Once propagation has begun the turn always runs to completion (a
    /// half-propagated graph would be observable as a glitch), so `cancel`
    /// returns `false` in that case.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }
}

impl Future for CommitHandle {
    type Output = Result<TurnId, TurnError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.waker.register(cx.waker());
        match self.shared.result() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHandle")
            .field("done", &self.is_done())
            .finish()
    }
}
