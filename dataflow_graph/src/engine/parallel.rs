use super::{
    apply_outcome, step, tick_node, EngineFault, PropagationCx,
    PropagationEngine, WorkerPool,
};
use crate::graph::{AnyNode, NodeId, NodeRole, TickOutcome};
use std::sync::mpsc;
use std::sync::Arc;

/// The worker-pool engine.
///
/// Every node of one level is independent of every other — edges strictly
/// increase level — so a whole level can tick concurrently. In the default
/// mode the coordinator drains level L to completion before admitting level
/// L+1; completing a level happens-before dispatching the next one (the
/// result channel provides the ordering), so a tick only ever reads values
/// settled in this turn or committed before it.
///
/// In relaxed mode the level barrier is skipped and a node is dispatched the
/// moment its own inputs have resolved. That keeps the same per-node
/// guarantees but removes the barrier between unrelated branches; user
/// computations must not read nodes they are not wired to (dynamically
/// tracked reads excepted, which re-wire and retry).
pub(crate) struct ParallelEngine {
    pool: WorkerPool,
    relaxed: bool,
}

impl ParallelEngine {
    pub fn new(worker_count: usize, relaxed: bool) -> Self {
        Self {
            pool: WorkerPool::new(worker_count),
            relaxed,
        }
    }

    #[allow(dead_code)]
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    fn dispatch(
        &self,
        cx: &PropagationCx<'_>,
        id: NodeId,
        node: Arc<dyn AnyNode>,
        tx: &mpsc::Sender<(NodeId, TickOutcome)>,
    ) {
        let tx = tx.clone();
        let turn = cx.turn;
        let resolved = cx.sched.resolved_handle();
        self.pool.submit(Box::new(move || {
            let outcome = tick_node(&node, turn, resolved);
            let _ = tx.send((id, outcome));
        }));
    }

    fn propagate_with_barrier(
        &self,
        cx: &mut PropagationCx<'_>,
    ) -> Result<(), EngineFault> {
        loop {
            let batch = {
                let g = cx.graph.read();
                cx.sched.pop_level_batch(&g)
            };
            let Some(batch) = batch else { break };

            let mut ticking = Vec::new();
            let mut inline = Vec::new();
            {
                let g = cx.graph.read();
                for id in batch {
                    let needs_tick = cx.sched.any_changed(id)
                        && g.role(id) != Some(NodeRole::Observer);
                    if needs_tick {
                        let node = g.node(id).ok_or_else(|| {
                            EngineFault::new("a scheduled node vanished mid-turn")
                        })?;
                        ticking.push((id, node));
                    } else {
                        inline.push(id);
                    }
                }
            }

            for id in inline {
                step(cx, id)?;
            }

            match ticking.len() {
                0 => {}
                1 => {
                    let (id, node) =
                        ticking.pop().expect("batch length just checked");
                    let outcome = tick_node(
                        &node,
                        cx.turn,
                        cx.sched.resolved_handle(),
                    );
                    apply_outcome(cx, id, outcome)?;
                }
                n => {
                    let (tx, rx) = mpsc::channel();
                    for (id, node) in ticking {
                        self.dispatch(cx, id, node, &tx);
                    }
                    drop(tx);
                    // the level barrier: nothing past this loop until every
                    // tick of this level has reported back
                    let mut seen = 0;
                    while seen < n {
                        let (id, outcome) = rx.recv().map_err(|_| {
                            EngineFault::new("a propagation worker died")
                        })?;
                        apply_outcome(cx, id, outcome)?;
                        seen += 1;
                    }
                }
            }
        }
        cx.sched.finish()
    }

    fn propagate_relaxed(
        &self,
        cx: &mut PropagationCx<'_>,
    ) -> Result<(), EngineFault> {
        let (tx, rx) = mpsc::channel();
        let mut in_flight = 0usize;
        loop {
            loop {
                let next = {
                    let g = cx.graph.read();
                    cx.sched.pop_ready(&g)
                };
                let Some(id) = next else { break };

                let to_tick = {
                    let g = cx.graph.read();
                    (cx.sched.any_changed(id)
                        && g.role(id) != Some(NodeRole::Observer))
                    .then(|| g.node(id))
                    .flatten()
                };
                match to_tick {
                    Some(node) => {
                        in_flight += 1;
                        self.dispatch(cx, id, node, &tx);
                    }
                    None => step(cx, id)?,
                }
            }

            if in_flight == 0 {
                break;
            }
            let (id, outcome) = rx
                .recv()
                .map_err(|_| EngineFault::new("a propagation worker died"))?;
            in_flight -= 1;
            apply_outcome(cx, id, outcome)?;
        }
        cx.sched.finish()
    }
}

impl PropagationEngine for ParallelEngine {
    fn propagate(&self, mut cx: PropagationCx<'_>) -> Result<(), EngineFault> {
        if self.relaxed {
            self.propagate_relaxed(&mut cx)
        } else {
            self.propagate_with_barrier(&mut cx)
        }
    }
}
