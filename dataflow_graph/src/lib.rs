//! A reactive dataflow engine.
//!
//! This crate maintains a directed acyclic graph of interdependent values
//! and re-evaluates dependents automatically when inputs change. Three
//! kinds of reactive primitives are composed together:
//! 1. **Input nodes**: variables ([`Var`](signal::Var)) and event sources
//!    ([`EventSource`](stream::EventSource)), mutated from outside the
//!    graph.
//! 2. **Computed nodes**: signals lifted over other values
//!    ([`Signal`](signal::Signal)), stream combinators (merge, filter,
//!    map), and folds of streams into state.
//! 3. **Observers**: side effects that synchronize the graph with the
//!    world outside it, run at commit time.
//!
//! All mutations flow through **turns**: atomic update cycles opened with
//! [`Domain::do_transaction`] (or implicitly by a bare `set`/`emit`). The
//! engine guarantees, per turn:
//! - **Update minimality** — a node recomputes at most once, and only if
//!   an input actually changed. Setting a variable to an equal value
//!   schedules nothing at all.
//! - **Glitch freedom** — nodes are visited in dependency-level order, so
//!   a computation never observes a mix of old and new input values.
//! - **Data-race freedom under parallel evaluation** — with the parallel
//!   engine, all nodes of one level may tick concurrently on a worker
//!   pool; a level barrier orders levels, and all bookkeeping stays on
//!   the coordinating thread.
//!
//! ```
//! use dataflow_graph::prelude::*;
//! use dataflow_graph::{Domain, DomainConfig, TurnMode};
//!
//! let domain = Domain::new(DomainConfig::default());
//! let ticks = domain.event_source::<u64>();
//! let total = domain.fold(&ticks, 0u64, |sum, t| sum + t);
//!
//! domain
//!     .do_transaction(TurnMode::Sync, {
//!         let ticks = ticks.clone();
//!         move || {
//!             ticks.emit(2);
//!             ticks.emit(3);
//!         }
//!     })
//!     .wait()
//!     .unwrap();
//! assert_eq!(total.get(), 5);
//! ```
//!
//! ## Design notes
//! - **Domains are values.** A [`Domain`] owns its node table, turn
//!   counter, and engine; multiple domains coexist and never share nodes.
//! - **Ownership runs upstream.** A computed node's closure captures the
//!   read handles of its inputs, so inputs outlive their dependents;
//!   successor edges are plain ids resolved through the domain's node
//!   table.
//! - **Failures are contained.** A panicking computation leaves its node's
//!   previous value in place and is reported, aggregated, with the turn's
//!   commit; unrelated branches keep propagating.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod domain;
mod engine;
pub mod error;
pub mod graph;
pub mod observer;
pub mod signal;
pub mod stream;
pub mod traits;
pub mod turn;

pub use domain::{Domain, DomainConfig, EngineKind, MergePolicy};
pub use error::{
    GraphError, NodeFailure, ObserverFailure, TurnError, TurnReport,
};
pub use graph::NodeId;
pub use observer::ObserverHandle;
pub use signal::{DynScope, Signal, Var};
pub use stream::{EventSource, EventStream, Merge};
pub use turn::{CommitHandle, TurnId, TurnMode};

/// Reexports the traits needed to read signals and wire up dependencies.
pub mod prelude {
    pub use crate::traits::{AsStream, Dependencies, Dependency, SignalRead};
}
