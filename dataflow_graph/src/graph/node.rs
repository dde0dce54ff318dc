use crate::engine::ResolvedSet;
use crate::turn::TurnId;
use std::sync::Arc;

slotmap::new_key_type! {
    /// Unique identifier for a node within its domain's node table.
    pub struct NodeId;
}

/// What a node is, from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRole {
    /// An externally mutated node (variable or event source). Inputs are
    /// flushed at the start of a turn and never ticked.
    Input,
    /// A value-carrying node recomputed from its inputs.
    Signal,
    /// An event-carrying node with a per-turn buffer.
    Stream,
    /// A sink whose callback is deferred to the commit phase.
    Observer,
}

/// The result of ticking one node within a turn.
pub(crate) enum TickOutcome {
    /// The node recomputed and its value (or buffer) differs from before.
    ///
    /// `retrack` carries the full input set a dynamically tracked node read
    /// during this tick, so the scheduler can rewrite its edges.
    Changed { retrack: Option<Vec<NodeId>> },
    /// The node recomputed to an equal value, or had nothing to do.
    Unchanged { retrack: Option<Vec<NodeId>> },
    /// The node read an input that is scheduled this turn but not yet
    /// resolved. No value was produced; the scheduler must attach the
    /// wanted inputs, re-level, and queue the node behind them.
    Reattach { want: Vec<NodeId> },
    /// The node's user computation panicked. The previous value is kept.
    Failed { message: String },
}

/// Per-tick context handed to [`AnyNode::tick`].
pub(crate) struct TickCx {
    /// The turn this tick belongs to.
    #[allow(dead_code)]
    pub turn: TurnId,
    /// Membership and resolution state for the current turn, consulted by
    /// dynamically tracked nodes before reading a value.
    pub resolved: Arc<ResolvedSet>,
}

/// The node contract: the small capability set every node kind implements.
///
/// A node kind is plain data plus a pure-ish tick function; the engine never
/// sees anything richer than this trait object.
pub(crate) trait AnyNode: Send + Sync {
    fn role(&self) -> NodeRole;

    /// Recomputes the node from its inputs. Runs at most once per turn, and
    /// only after every scheduled input has resolved.
    fn tick(&self, cx: &TickCx) -> TickOutcome;

    /// Applies externally staged state (a pending `set` or emitted events).
    /// Inputs only. Returns whether the node actually changed.
    fn flush_staged(&self) -> bool {
        false
    }

    /// Discards externally staged state without applying it.
    fn clear_staged(&self) {}

    /// Called once at the end of every turn the node took part in.
    /// Streams clear their per-turn buffers here.
    fn end_turn(&self) {}

    /// The commit-phase entry point, present only on observer nodes.
    fn as_observer(&self) -> Option<&dyn ObserverInvoke> {
        None
    }
}

/// Commit-phase invocation of an observer's side-effect callback.
pub(crate) trait ObserverInvoke: Send + Sync {
    /// Runs the callback, capturing a panic as an error message.
    fn invoke(&self) -> Result<(), String>;
}

/// Runs a user computation, converting a panic into an error value so the
/// rest of the turn keeps propagating.
pub(crate) fn catch_user<R>(
    f: impl FnOnce() -> R,
) -> Result<R, Box<dyn std::any::Any + Send>> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
}

/// Extracts a printable message from a captured panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "the computation panicked".to_owned()
    }
}
