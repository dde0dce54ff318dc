//! Propagation engines.
//!
//! A turn's propagation is driven by a coordinator (the thread that opened
//! the turn). The coordinator owns all scheduling state — membership,
//! pending counts, the level-ordered ready queue — so that state needs no
//! synchronization at all. The engines differ only in *where* ticks run:
//! the sequential engine ticks inline; the parallel engine ships ticks to a
//! worker pool and applies the outcomes as they come back.

mod membership;
mod parallel;
mod pool;
mod sequential;

pub(crate) use membership::*;
pub(crate) use parallel::*;
pub(crate) use pool::*;
pub(crate) use sequential::*;

use crate::graph::{
    AnyNode, GraphState, NodeRole, TickCx, TickOutcome,
};
use crate::turn::{self, TurnId};
use parking_lot::RwLock;
use std::sync::Arc;

/// An engine-internal invariant violation. Poisons the domain.
#[derive(Debug)]
pub(crate) struct EngineFault {
    pub message: String,
}

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything an engine needs to run one turn to quiescence.
pub(crate) struct PropagationCx<'a> {
    pub graph: &'a RwLock<GraphState>,
    pub sched: &'a mut Schedule,
    pub turn: TurnId,
}

/// The seam between the turn machinery and a propagation strategy.
pub(crate) trait PropagationEngine: Send + Sync {
    fn propagate(&self, cx: PropagationCx<'_>) -> Result<(), EngineFault>;
}

/// Ticks one node with the in-tick guard held.
pub(crate) fn tick_node(
    node: &Arc<dyn AnyNode>,
    turn: TurnId,
    resolved: Arc<ResolvedSet>,
) -> TickOutcome {
    let _guard = turn::enter_tick();
    let cx = TickCx { turn, resolved };
    node.tick(&cx)
}

/// Resolves one ready node: skips it if nothing upstream changed, defers it
/// if it is an observer, ticks it otherwise. Shared by both engines for the
/// paths that stay on the coordinator.
pub(crate) fn step(
    cx: &mut PropagationCx<'_>,
    id: crate::graph::NodeId,
) -> Result<(), EngineFault> {
    let (role, node) = {
        let g = cx.graph.read();
        (g.role(id), g.node(id))
    };
    let (Some(role), Some(node)) = (role, node) else {
        return Err(EngineFault::new("a scheduled node vanished mid-turn"));
    };

    if role == NodeRole::Observer {
        if cx.sched.any_changed(id) {
            cx.sched.note_observer(id);
        }
        let g = cx.graph.read();
        return cx.sched.settle(&g, id, false);
    }

    if !cx.sched.any_changed(id) {
        // every scheduled input resolved without a real change
        let g = cx.graph.read();
        return cx.sched.settle(&g, id, false);
    }

    let outcome = tick_node(&node, cx.turn, cx.sched.resolved_handle());
    apply_outcome(cx, id, outcome)
}

/// Applies a tick outcome to the schedule: edge rewrites for dynamically
/// tracked nodes, failure capture, and downstream pending-count updates.
pub(crate) fn apply_outcome(
    cx: &mut PropagationCx<'_>,
    id: crate::graph::NodeId,
    outcome: TickOutcome,
) -> Result<(), EngineFault> {
    match outcome {
        TickOutcome::Changed { retrack } => {
            if let Some(want) = retrack {
                apply_retrack(cx, id, &want);
            }
            let g = cx.graph.read();
            cx.sched.settle(&g, id, true)
        }
        TickOutcome::Unchanged { retrack } => {
            if let Some(want) = retrack {
                apply_retrack(cx, id, &want);
            }
            let g = cx.graph.read();
            cx.sched.settle(&g, id, false)
        }
        TickOutcome::Failed { message } => {
            cx.sched.note_failure(id, message);
            let g = cx.graph.read();
            cx.sched.settle(&g, id, false)
        }
        TickOutcome::Reattach { want } => {
            // The node read an input it was not wired to, and that input is
            // still pending this turn. Wire the new inputs in (lifting the
            // node's level past them), then queue the node behind them.
            {
                let mut g = cx.graph.write();
                for &p in &want {
                    if !g.is_pred(p, id) {
                        if let Err(err) = g.attach(p, id) {
                            drop(g);
                            cx.sched.note_failure(
                                id,
                                format!("dynamic input rejected: {err}"),
                            );
                            let g = cx.graph.read();
                            return cx.sched.settle(&g, id, false);
                        }
                    }
                }
            }
            let g = cx.graph.read();
            cx.sched.requeue_after_reattach(&g, id, &want);
            Ok(())
        }
    }
}

/// Rewrites a dynamically tracked node's input set to exactly what its
/// completed tick read.
fn apply_retrack(
    cx: &mut PropagationCx<'_>,
    id: crate::graph::NodeId,
    want: &[crate::graph::NodeId],
) {
    let mut g = cx.graph.write();
    let current: Vec<_> = g.preds(id).to_vec();
    for p in current {
        if !want.contains(&p) {
            while g.is_pred(p, id) {
                let _ = g.detach(p, id);
            }
        }
    }
    let mut rejected = Vec::new();
    for &p in want {
        if !g.is_pred(p, id) {
            if let Err(err) = g.attach(p, id) {
                rejected.push((p, err));
            }
        }
    }
    drop(g);
    for (_, err) in rejected {
        cx.sched
            .note_failure(id, format!("dynamic input rejected: {err}"));
    }
}
