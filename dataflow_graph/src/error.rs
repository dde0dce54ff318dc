//! Error types surfaced by the engine.
//!
//! Structural errors ([`GraphError`]) reject a single graph mutation and leave
//! the graph untouched. Turn errors ([`TurnError`]) are delivered at commit
//! time and aggregate every per-node and per-observer failure that occurred
//! during one propagation cycle.

use crate::graph::NodeId;
use crate::turn::TurnId;
use thiserror::Error;

/// An error produced by a structural mutation of the dependency graph.
///
/// A failed mutation has no effect: edges, levels, and node values are
/// exactly what they were before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The requested edge would make the dependency relation cyclic.
    #[error("attaching this input would create a dependency cycle")]
    WouldCycle,

    /// A detach was requested for a node that is not currently an input.
    #[error("the node is not an input of this node")]
    NotAnInput,

    /// The two nodes belong to different domains.
    #[error("nodes belong to different domains")]
    CrossDomain,

    /// The node has already been removed from its domain.
    #[error("the node has been removed from its domain")]
    NodeGone,

    /// The domain hit an internal invariant violation and rejects all
    /// further operations.
    #[error("the domain is poisoned and rejects further operations")]
    Poisoned,
}

/// A user computation that failed while its node was being ticked.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// The node whose recompute function failed.
    pub node: NodeId,
    /// The panic message captured from the computation.
    pub message: String,
}

/// An observer callback that failed during the commit phase.
#[derive(Debug, Clone)]
pub struct ObserverFailure {
    /// The observer node whose callback failed.
    pub observer: NodeId,
    /// The panic message captured from the callback.
    pub message: String,
}

/// Everything that went wrong during one turn.
///
/// A non-empty report does not mean the turn was lost: propagation continued
/// around each failed node, every unrelated branch committed normally, and
/// failed nodes simply kept their previous values.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    /// Failures of signal/stream recompute functions.
    pub node_failures: Vec<NodeFailure>,
    /// Failures of observer callbacks.
    pub observer_failures: Vec<ObserverFailure>,
}

impl TurnReport {
    /// Whether the turn completed without any captured failure.
    pub fn is_clean(&self) -> bool {
        self.node_failures.is_empty() && self.observer_failures.is_empty()
    }
}

/// An error delivered with the commit of a turn.
#[derive(Debug, Clone, Error)]
pub enum TurnError {
    /// The turn committed, but one or more user computations failed.
    #[error(
        "{turn} committed with {} node failure(s) and {} observer failure(s)",
        .report.node_failures.len(),
        .report.observer_failures.len()
    )]
    Failed {
        /// The turn that produced the report.
        turn: TurnId,
        /// The aggregated failures.
        report: TurnReport,
    },

    /// The transaction was cancelled before its body ran.
    #[error("the transaction was cancelled before it ran")]
    Cancelled,

    /// The transaction body itself panicked; nothing was applied.
    #[error("the transaction body panicked: {message}")]
    BodyPanicked {
        /// The captured panic message.
        message: String,
    },

    /// The domain is poisoned and no longer accepts turns.
    #[error("the domain is poisoned and rejects further operations")]
    Poisoned,
}
