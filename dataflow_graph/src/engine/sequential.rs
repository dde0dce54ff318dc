use super::{step, EngineFault, PropagationCx, PropagationEngine};

/// The single-threaded reference engine.
///
/// Visits ready nodes in ascending level order, FIFO within a level, on the
/// caller's thread. This order is fully deterministic, which makes this
/// engine the oracle the parallel engine is tested against.
pub(crate) struct SequentialEngine;

impl PropagationEngine for SequentialEngine {
    fn propagate(&self, mut cx: PropagationCx<'_>) -> Result<(), EngineFault> {
        loop {
            let next = {
                let g = cx.graph.read();
                cx.sched.pop_ready(&g)
            };
            let Some(id) = next else { break };
            step(&mut cx, id)?;
        }
        cx.sched.finish()
    }
}
