//! Dynamically tracked computations.
//!
//! A dynamic signal does not declare its inputs up front; its closure reads
//! values through a [`DynScope`], and every read is recorded. After a
//! completed evaluation the recorded set *is* the node's input set: inputs
//! it stopped reading are detached, new ones attached, levels lifted as
//! needed.
//!
//! The interesting case is a read of a node that is scheduled in the
//! current turn but has not settled yet — its value still belongs to the
//! previous turn, and returning it would hand the closure a mix of old and
//! new inputs. The scope aborts the evaluation instead (no value is
//! produced), the scheduler wires the node behind the offending input and
//! lifts it past it, and the closure runs again once everything it reached
//! for has settled. Each retry discovers at least one new input, so the
//! process terminates, and the single *completed* evaluation per turn is
//! what dependents observe.

use super::lift::SignalValue;
use crate::engine::ResolvedSet;
use crate::graph::{
    catch_user, panic_message, AnyNode, NodeId, NodeRole, TickCx, TickOutcome,
};
use crate::traits::SignalRead;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The read scope handed to a dynamic signal's closure.
pub struct DynScope<'a> {
    resolved: &'a ResolvedSet,
    tracked: RefCell<Vec<NodeId>>,
}

/// Unwind payload for an inconsistent read; caught by the node's tick and
/// turned into a reattach request.
pub(crate) struct DynAbort;

impl<'a> DynScope<'a> {
    pub(crate) fn new(resolved: &'a ResolvedSet) -> Self {
        Self {
            resolved,
            tracked: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn into_tracked(self) -> Vec<NodeId> {
        self.tracked.into_inner()
    }

    /// Reads a signal, recording it as an input of the running computation.
    pub fn get<T, S>(&self, signal: &S) -> T
    where
        T: Clone,
        S: SignalRead<T>,
    {
        self.with(signal, T::clone)
    }

    /// Applies `f` to a signal's value, recording the signal as an input of
    /// the running computation.
    pub fn with<T, U, S>(&self, signal: &S, f: impl FnOnce(&T) -> U) -> U
    where
        S: SignalRead<T>,
    {
        let dep = signal.dep_ref();
        assert_eq!(
            dep.domain_key(),
            self.resolved.domain_key(),
            "a dynamic computation read a value that belongs to another domain"
        );
        {
            let mut tracked = self.tracked.borrow_mut();
            if !tracked.contains(&dep.id) {
                tracked.push(dep.id);
            }
        }
        if !self.resolved.is_settled(dep.id) {
            std::panic::panic_any(DynAbort);
        }
        signal.with(f)
    }
}

/// A computed signal whose input set follows what its closure actually
/// reads.
pub(crate) struct DynState<T> {
    value: RwLock<Option<T>>,
    recompute: Box<dyn Fn(&DynScope) -> T + Send + Sync>,
    is_same: fn(&T, &T) -> bool,
    ticks: AtomicUsize,
}

impl<T> DynState<T> {
    pub fn new(
        recompute: Box<dyn Fn(&DynScope) -> T + Send + Sync>,
        is_same: fn(&T, &T) -> bool,
    ) -> Self {
        Self {
            value: RwLock::new(None),
            recompute,
            is_same,
            ticks: AtomicUsize::new(0),
        }
    }

    /// Construction-time evaluation; returns the initial input set.
    pub fn prime(&self, domain_key: usize) -> Vec<NodeId> {
        let idle = ResolvedSet::idle(domain_key);
        let scope = DynScope::new(&idle);
        let value = (self.recompute)(&scope);
        *self.value.write() = Some(value);
        scope.into_tracked()
    }
}

impl<T: Send + Sync + 'static> AnyNode for DynState<T> {
    fn role(&self) -> NodeRole {
        NodeRole::Signal
    }

    fn tick(&self, cx: &TickCx) -> TickOutcome {
        let scope = DynScope::new(&cx.resolved);
        let result = catch_user(|| (self.recompute)(&scope));
        let tracked = scope.into_tracked();
        match result {
            Ok(new_value) => {
                let changed = {
                    let mut slot = self.value.write();
                    let changed = match slot.as_ref() {
                        Some(old) => !(self.is_same)(old, &new_value),
                        None => true,
                    };
                    *slot = Some(new_value);
                    changed
                };
                self.ticks.fetch_add(1, Ordering::Relaxed);
                if changed {
                    TickOutcome::Changed {
                        retrack: Some(tracked),
                    }
                } else {
                    TickOutcome::Unchanged {
                        retrack: Some(tracked),
                    }
                }
            }
            Err(payload) if payload.is::<DynAbort>() => {
                TickOutcome::Reattach { want: tracked }
            }
            Err(payload) => TickOutcome::Failed {
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

impl<T: Send + Sync + 'static> SignalValue<T> for DynState<T> {
    fn read_with(&self, f: &mut dyn FnMut(&T)) {
        let slot = self.value.read();
        let value = slot
            .as_ref()
            .expect("signal read before its first evaluation");
        f(value);
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}
