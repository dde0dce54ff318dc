//! Thread-local turn frames.
//!
//! While a transaction body runs on a thread, a staging frame for its domain
//! sits on that thread's frame stack; input mutations find the frame and
//! stage onto it instead of opening a turn of their own. During the commit
//! phase the frame is in the commit state, and anything that looks like a
//! new transaction (including a bare `set`) is captured as a continuation
//! turn instead.
//!
//! Frames are keyed by domain, so a body or observer is free to run
//! synchronous transactions against *other* domains while one is open here.

use super::{HandleShared, TurnBody};
use crate::graph::{AnyNode, NodeId};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnPhase {
    Staging,
    Commit,
}

pub(crate) struct Frame {
    key: usize,
    phase: TurnPhase,
    /// Inputs staged during this frame, with the node objects so staged
    /// state can be discarded if the body unwinds.
    pub staged: Vec<(NodeId, Arc<dyn AnyNode>)>,
    /// Follow-up transactions enqueued during the commit phase.
    pub continuations: Vec<(TurnBody, Arc<HandleShared>)>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static IN_TICK: Cell<bool> = const { Cell::new(false) };
}

/// Pushes a frame for `key`; popping happens when the guard is finished or
/// dropped. If the guard drops during an unwind, every input staged under
/// the frame is cleared so a later turn cannot pick up half a transaction.
pub(crate) fn push_frame(key: usize, phase: TurnPhase) -> FrameGuard {
    FRAMES.with_borrow_mut(|frames| {
        frames.push(Frame {
            key,
            phase,
            staged: Vec::new(),
            continuations: Vec::new(),
        })
    });
    FrameGuard { finished: false }
}

pub(crate) struct FrameGuard {
    finished: bool,
}

impl FrameGuard {
    pub fn finish(mut self) -> Frame {
        self.finished = true;
        FRAMES
            .with_borrow_mut(|frames| frames.pop())
            .expect("turn frame stack underflow")
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(frame) = FRAMES.with_borrow_mut(|frames| frames.pop()) {
            for (_, node) in frame.staged {
                node.clear_staged();
            }
        }
    }
}

/// The phase of the innermost frame for `key` on this thread, if any.
pub(crate) fn frame_phase(key: usize) -> Option<TurnPhase> {
    FRAMES.with_borrow(|frames| {
        frames.iter().rev().find(|f| f.key == key).map(|f| f.phase)
    })
}

/// Records a staged input on the innermost staging frame for `key`.
pub(crate) fn record_staged(key: usize, id: NodeId, node: Arc<dyn AnyNode>) {
    FRAMES.with_borrow_mut(|frames| {
        let frame = frames
            .iter_mut()
            .rev()
            .find(|f| f.key == key)
            .expect("staged an input with no open turn frame");
        debug_assert_eq!(frame.phase, TurnPhase::Staging);
        frame.staged.push((id, node));
    });
}

/// Appends a continuation to the innermost commit frame for `key`.
/// Returns `false` if no such frame exists.
pub(crate) fn push_continuation(
    key: usize,
    body: TurnBody,
    handle: Arc<HandleShared>,
) -> bool {
    FRAMES.with_borrow_mut(|frames| {
        match frames
            .iter_mut()
            .rev()
            .find(|f| f.key == key && f.phase == TurnPhase::Commit)
        {
            Some(frame) => {
                frame.continuations.push((body, handle));
                true
            }
            None => false,
        }
    })
}

/// Whether the current thread is inside a node computation. Input mutations
/// and structural surgery are rejected there: a tick must stay pure with
/// respect to the graph it is part of.
pub(crate) fn in_tick() -> bool {
    IN_TICK.with(|flag| flag.get())
}

pub(crate) struct TickGuard {
    prev: bool,
}

pub(crate) fn enter_tick() -> TickGuard {
    let prev = IN_TICK.with(|flag| flag.replace(true));
    TickGuard { prev }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        IN_TICK.with(|flag| flag.set(prev));
    }
}
