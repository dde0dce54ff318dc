use super::{HandleShared, TurnBody};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A queued asynchronous transaction: staged bodies paired with the commit
/// handles they resolve. A coalesced (merged) item carries several pairs;
/// they all commit in one turn.
pub(crate) struct QueuedTurn {
    pub parts: Vec<(TurnBody, Arc<HandleShared>)>,
    pub mergeable: bool,
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<QueuedTurn>,
    driver_running: bool,
    busy: bool,
}

/// The FIFO of pending async turns, drained by the domain's driver thread.
#[derive(Default)]
pub(crate) struct TurnQueue {
    inner: Mutex<QueueInner>,
    wake: Condvar,
}

impl TurnQueue {
    /// Enqueues a turn. With `merge_adjacent`, a mergeable item coalesces
    /// into a mergeable tail that has not started running yet.
    pub fn push(&self, mut item: QueuedTurn, merge_adjacent: bool) {
        let mut inner = self.inner.lock();
        if merge_adjacent && item.mergeable {
            if let Some(tail) = inner.items.back_mut() {
                if tail.mergeable {
                    tail.parts.append(&mut item.parts);
                    drop(inner);
                    self.wake.notify_all();
                    return;
                }
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.wake.notify_all();
    }

    /// Marks the driver as running; returns `false` if one already is.
    pub fn claim_driver(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.driver_running {
            false
        } else {
            inner.driver_running = true;
            true
        }
    }

    /// Driver side: waits up to `timeout` for the next item. Marks the
    /// queue busy while an item is out being executed.
    pub fn pop_wait(&self, timeout: Duration) -> Option<QueuedTurn> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            let _ = self.wake.wait_for(&mut inner, timeout);
        }
        let item = inner.items.pop_front();
        if item.is_some() {
            inner.busy = true;
        }
        item
    }

    pub fn mark_idle(&self) {
        self.inner.lock().busy = false;
        self.wake.notify_all();
    }

    /// Blocks until every queued turn has been executed and the driver is
    /// between items.
    pub fn wait_idle(&self) {
        let mut inner = self.inner.lock();
        while !inner.items.is_empty() || inner.busy {
            self.wake.wait(&mut inner);
        }
    }
}
