//! Turn membership and the level-ordered ready queue.
//!
//! The membership pass walks successor edges from every input that really
//! changed and records each reachable node exactly once, however many
//! changed inputs share it. A member becomes ready when its pending count —
//! the number of its *distinct* member inputs not yet resolved — reaches
//! zero, and it ticks only if at least one resolved input reported a change.

use super::EngineFault;
use crate::error::NodeFailure;
use crate::graph::{GraphState, NodeId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The turn's membership, shared with worker threads.
///
/// Dynamically tracked computations consult this before reading a value: a
/// member that has not resolved yet must not be read, or the reader would
/// see last turn's value next to this turn's values.
pub(crate) struct ResolvedSet {
    domain_key: usize,
    members: FxHashMap<NodeId, AtomicBool>,
}

impl ResolvedSet {
    fn new(domain_key: usize, members: impl Iterator<Item = NodeId>) -> Self {
        Self {
            domain_key,
            members: members.map(|id| (id, AtomicBool::new(false))).collect(),
        }
    }

    /// An empty set: nothing is scheduled, every read is consistent.
    pub fn idle(domain_key: usize) -> Self {
        Self {
            domain_key,
            members: FxHashMap::default(),
        }
    }

    pub fn domain_key(&self) -> usize {
        self.domain_key
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    /// Whether `id` may be read right now: either it is not scheduled this
    /// turn, or its tick has completed.
    pub fn is_settled(&self, id: NodeId) -> bool {
        self.members
            .get(&id)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    fn mark_settled(&self, id: NodeId) {
        if let Some(flag) = self.members.get(&id) {
            flag.store(true, Ordering::Release);
        }
    }
}

#[derive(Default)]
struct SchedEntry {
    pending: u32,
    any_changed: bool,
    resolved: bool,
}

/// Coordinator-owned scheduling state for one turn.
pub(crate) struct Schedule {
    entries: FxHashMap<NodeId, SchedEntry>,
    /// Members in discovery order; drives deterministic seeding.
    members: Vec<NodeId>,
    ready: BTreeMap<u32, VecDeque<NodeId>>,
    resolved: Arc<ResolvedSet>,
    observers_hit: Vec<NodeId>,
    failures: Vec<NodeFailure>,
    unresolved: usize,
}

impl Schedule {
    /// The reachability pass: membership, pending counts, change seeds, and
    /// the initial ready set.
    pub fn build(
        g: &GraphState,
        changed_inputs: &[NodeId],
        domain_key: usize,
    ) -> Self {
        let mut entries: FxHashMap<NodeId, SchedEntry> = FxHashMap::default();
        let mut members = Vec::new();

        let mut visit: VecDeque<NodeId> = changed_inputs.iter().copied().collect();
        while let Some(n) = visit.pop_front() {
            for s in g.succs(n) {
                if !entries.contains_key(&s) {
                    entries.insert(s, SchedEntry::default());
                    members.push(s);
                    visit.push_back(s);
                }
            }
        }

        for &m in &members {
            let distinct: FxHashSet<NodeId> = g
                .preds(m)
                .iter()
                .copied()
                .filter(|p| entries.contains_key(p))
                .collect();
            if let Some(e) = entries.get_mut(&m) {
                e.pending = distinct.len() as u32;
            }
        }

        for &input in changed_inputs {
            for s in g.succs(input) {
                if let Some(e) = entries.get_mut(&s) {
                    e.any_changed = true;
                }
            }
        }

        let mut ready: BTreeMap<u32, VecDeque<NodeId>> = BTreeMap::new();
        for &m in &members {
            if entries[&m].pending == 0 {
                ready.entry(g.level(m)).or_default().push_back(m);
            }
        }

        let unresolved = members.len();
        let resolved =
            Arc::new(ResolvedSet::new(domain_key, members.iter().copied()));
        Self {
            entries,
            members,
            ready,
            resolved,
            observers_hit: Vec::new(),
            failures: Vec::new(),
            unresolved,
        }
    }

    pub fn resolved_handle(&self) -> Arc<ResolvedSet> {
        Arc::clone(&self.resolved)
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn any_changed(&self, id: NodeId) -> bool {
        self.entries.get(&id).map(|e| e.any_changed).unwrap_or(false)
    }

    /// Pops the next ready node: lowest level first, FIFO within a level.
    ///
    /// A node whose level was lifted after it was queued is silently
    /// re-queued at its current level.
    pub fn pop_ready(&mut self, g: &GraphState) -> Option<NodeId> {
        loop {
            let (&level, bucket) = self.ready.iter_mut().next()?;
            let Some(id) = bucket.pop_front() else {
                self.ready.remove(&level);
                continue;
            };
            let now = g.level(id);
            if now != level {
                self.ready.entry(now).or_default().push_back(id);
                continue;
            }
            return Some(id);
        }
    }

    /// Drains every ready node of the lowest populated level in one batch.
    pub fn pop_level_batch(&mut self, g: &GraphState) -> Option<Vec<NodeId>> {
        loop {
            let (&level, bucket) = self.ready.iter_mut().next()?;
            let drained: Vec<NodeId> = bucket.drain(..).collect();
            self.ready.remove(&level);
            let mut batch = Vec::with_capacity(drained.len());
            for id in drained {
                let now = g.level(id);
                if now != level {
                    self.ready.entry(now).or_default().push_back(id);
                } else {
                    batch.push(id);
                }
            }
            if !batch.is_empty() {
                return Some(batch);
            }
        }
    }

    /// Marks `id` resolved with the given change flag and updates its
    /// successors' pending counts, readying any that hit zero.
    pub fn settle(
        &mut self,
        g: &GraphState,
        id: NodeId,
        changed: bool,
    ) -> Result<(), EngineFault> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| EngineFault::new("settled a node outside the turn"))?;
        if entry.resolved {
            return Err(EngineFault::new("a node resolved twice in one turn"));
        }
        entry.resolved = true;
        self.resolved.mark_settled(id);
        self.unresolved -= 1;

        for s in g.succs(id) {
            let Some(e) = self.entries.get_mut(&s) else {
                continue;
            };
            if e.resolved {
                continue;
            }
            if changed {
                e.any_changed = true;
            }
            if e.pending == 0 {
                return Err(EngineFault::new("pending count underflow"));
            }
            e.pending -= 1;
            if e.pending == 0 {
                self.ready.entry(g.level(s)).or_default().push_back(s);
            }
        }
        Ok(())
    }

    /// Re-queues a node that returned a reattach request: its pending count
    /// becomes the number of wanted inputs still unresolved this turn.
    pub fn requeue_after_reattach(
        &mut self,
        g: &GraphState,
        id: NodeId,
        want: &[NodeId],
    ) {
        let distinct: FxHashSet<NodeId> = want
            .iter()
            .copied()
            .filter(|&p| {
                self.resolved.is_member(p) && !self.resolved.is_settled(p)
            })
            .collect();
        let pending = distinct.len() as u32;
        if let Some(e) = self.entries.get_mut(&id) {
            e.pending = pending;
        }
        if pending == 0 {
            self.ready.entry(g.level(id)).or_default().push_back(id);
        }
    }

    pub fn note_observer(&mut self, id: NodeId) {
        self.observers_hit.push(id);
    }

    pub fn note_failure(&mut self, id: NodeId, message: String) {
        self.failures.push(NodeFailure { node: id, message });
    }

    pub fn take_failures(&mut self) -> Vec<NodeFailure> {
        std::mem::take(&mut self.failures)
    }

    pub fn take_observers(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.observers_hit)
    }

    /// Verifies the turn drained: every member resolved exactly once.
    pub fn finish(&self) -> Result<(), EngineFault> {
        if self.unresolved == 0 {
            Ok(())
        } else {
            Err(EngineFault::new(format!(
                "{} scheduled node(s) never resolved",
                self.unresolved
            )))
        }
    }
}
