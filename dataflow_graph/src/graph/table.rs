use super::{AnyNode, NodeId, NodeRole, PredecessorList, SuccessorSet};
use crate::error::GraphError;
use slotmap::SlotMap;
use std::sync::Arc;

/// One entry in the domain's node table.
///
/// The table entry is the single strong owner of the node's behavior object.
/// Successor edges are ids only — back-references resolved through the table
/// — while the strong lifetime tie from a dependent to its inputs runs
/// through the input handles captured inside the dependent's state (its
/// closure or input list), each of which carries a handle guard.
pub(crate) struct NodeEntry {
    pub node: Arc<dyn AnyNode>,
    pub role: NodeRole,
    pub level: u32,
    pub preds: PredecessorList,
    pub succs: SuccessorSet,
    /// Live external handle guards. An entry is removed once this reaches
    /// zero and the node has no successors.
    pub handles: usize,
    /// Registration index for observers; drives commit-phase ordering.
    pub observer_index: Option<usize>,
}

/// The dependency graph owned by one domain, behind its structural lock.
#[derive(Default)]
pub(crate) struct GraphState {
    nodes: SlotMap<NodeId, NodeEntry>,
    /// Total observers ever registered; the next registration index.
    observer_count: usize,
}

impl GraphState {
    /// Inserts a node whose input set is known up front.
    ///
    /// Every input must already exist in this table. The new node's level is
    /// one above its highest input, so the level invariant holds by
    /// construction and no cycle is possible through a brand-new node.
    pub fn insert(
        &mut self,
        node: Arc<dyn AnyNode>,
        role: NodeRole,
        preds: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        let mut level = 0;
        for &p in preds {
            let pred = self.nodes.get(p).ok_or(GraphError::NodeGone)?;
            level = level.max(pred.level + 1);
        }

        let observer_index = (role == NodeRole::Observer).then(|| {
            let index = self.observer_count;
            self.observer_count += 1;
            index
        });

        let id = self.nodes.insert(NodeEntry {
            node,
            role,
            level,
            preds: PredecessorList::default(),
            succs: SuccessorSet::default(),
            handles: 1,
            observer_index,
        });

        for &p in preds {
            self.nodes[p].succs.insert(id);
            self.nodes[id].preds.push(p);
        }

        Ok(id)
    }

    /// Adds the edge `pred → succ`, re-leveling eagerly if the new input
    /// sits at or above the dependent.
    ///
    /// Fails without touching the graph if the edge would close a cycle.
    pub fn attach(&mut self, pred: NodeId, succ: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(pred) || !self.nodes.contains_key(succ) {
            return Err(GraphError::NodeGone);
        }
        if pred == succ || self.reaches(succ, pred) {
            return Err(GraphError::WouldCycle);
        }

        self.nodes[pred].succs.insert(succ);
        self.nodes[succ].preds.push(pred);

        let want = self.nodes[pred].level + 1;
        if self.nodes[succ].level < want {
            self.lift_levels(succ, want);
        }
        Ok(())
    }

    /// Removes one `pred → succ` edge.
    pub fn detach(&mut self, pred: NodeId, succ: NodeId) -> Result<(), GraphError> {
        let entry = self.nodes.get_mut(succ).ok_or(GraphError::NodeGone)?;
        if !entry.preds.remove_one(pred) {
            return Err(GraphError::NotAnInput);
        }
        // The same input may be wired in more than once; the reverse edge
        // goes away only with the last occurrence.
        let still_wired = entry.preds.contains(pred);
        if !still_wired {
            if let Some(p) = self.nodes.get_mut(pred) {
                p.succs.remove(succ);
            }
        }
        Ok(())
    }

    /// Depth-first reachability over successor edges.
    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        if from == target {
            return true;
        }
        let mut stack = vec![from];
        let mut seen = rustc_hash::FxHashSet::default();
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if let Some(entry) = self.nodes.get(n) {
                for s in entry.succs.iter() {
                    if s == target {
                        return true;
                    }
                    stack.push(s);
                }
            }
        }
        false
    }

    /// Lifts `start` to at least `want` and propagates the increase through
    /// its successors. The caller has already ruled out cycles, so this walk
    /// terminates.
    fn lift_levels(&mut self, start: NodeId, want: u32) {
        let mut stack = vec![(start, want)];
        while let Some((id, want)) = stack.pop() {
            let entry = match self.nodes.get_mut(id) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.level >= want {
                continue;
            }
            entry.level = want;
            let next = entry.level + 1;
            let succs: Vec<_> = entry.succs.iter().collect();
            for s in succs {
                stack.push((s, next));
            }
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<dyn AnyNode>> {
        self.nodes.get(id).map(|e| Arc::clone(&e.node))
    }

    pub fn role(&self, id: NodeId) -> Option<NodeRole> {
        self.nodes.get(id).map(|e| e.role)
    }

    pub fn level(&self, id: NodeId) -> u32 {
        self.nodes.get(id).map(|e| e.level).unwrap_or(0)
    }

    pub fn preds(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|e| e.preds.as_slice())
            .unwrap_or(&[])
    }

    pub fn succs(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(id)
            .map(|e| e.succs.iter().collect())
            .unwrap_or_default()
    }

    pub fn is_pred(&self, pred: NodeId, succ: NodeId) -> bool {
        self.nodes
            .get(succ)
            .map(|e| e.preds.contains(pred))
            .unwrap_or(false)
    }

    pub fn observer_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.get(id).and_then(|e| e.observer_index)
    }

    /// Drops one handle guard for `id`.
    pub fn release_handle(&mut self, id: NodeId) {
        if let Some(entry) = self.nodes.get_mut(id) {
            entry.handles = entry.handles.saturating_sub(1);
        }
    }

    /// Removes `id` if nothing keeps it alive, collecting the removed
    /// entries into `out`.
    ///
    /// Removal detaches the node from its inputs; an input that had already
    /// lost its last handle and now loses its last successor is collected in
    /// the same pass. Entries must be dropped by the caller *after* the
    /// structural lock is released, because dropping a node state drops the
    /// input handles captured inside it, and each of those re-enters the
    /// lock to release its guard.
    pub fn try_collect(&mut self, id: NodeId, out: &mut Vec<NodeEntry>) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let removable = self
                .nodes
                .get(id)
                .map(|e| e.handles == 0 && e.succs.is_empty())
                .unwrap_or(false);
            if !removable {
                continue;
            }
            let entry = self.nodes.remove(id).expect("entry vanished during collect");
            for p in entry.preds.iter() {
                if let Some(pred) = self.nodes.get_mut(p) {
                    pred.succs.remove(id);
                    if pred.handles == 0 && pred.succs.is_empty() {
                        work.push(p);
                    }
                }
            }
            out.push(entry);
        }
    }
}
