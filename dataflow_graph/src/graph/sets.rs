//! Edge sets attached to each node table entry.
//!
//! Successor sets are insertion-ordered: the order in which dependents
//! attached is the order the scheduler visits them, which keeps the
//! sequential engine deterministic. Predecessors are a plain list because a
//! node may legitimately depend on the same input more than once (a merge of
//! a stream with itself sees each event twice).

use super::NodeId;
use indexmap::IndexSet;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub(crate) type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

#[derive(Debug, Default, Clone)]
pub(crate) struct SuccessorSet(FxIndexSet<NodeId>);

impl SuccessorSet {
    pub fn insert(&mut self, succ: NodeId) {
        self.0.insert(succ);
    }

    pub fn remove(&mut self, succ: NodeId) {
        // `shift_remove`, not `swap_remove`: removal must not reorder the
        // remaining successors, or the sequential visit order would depend
        // on detach history.
        self.0.shift_remove(&succ);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct PredecessorList(Vec<NodeId>);

impl PredecessorList {
    pub fn push(&mut self, pred: NodeId) {
        self.0.push(pred);
    }

    /// Removes one occurrence of `pred`. Returns whether it was present.
    pub fn remove_one(&mut self, pred: NodeId) -> bool {
        if let Some(pos) = self.0.iter().position(|&p| p == pred) {
            self.0.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, pred: NodeId) -> bool {
        self.0.contains(&pred)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}
