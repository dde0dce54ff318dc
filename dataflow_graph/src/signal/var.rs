use super::lift::SignalValue;
use crate::domain::Link;
use crate::graph::{AnyNode, NodeId, NodeRole, TickCx, TickOutcome};
use crate::traits::{DepRef, Dependency, SignalRead};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Backing state of an input variable: the committed value plus at most one
/// staged replacement, applied when the enclosing turn begins propagation.
pub(crate) struct VarState<T> {
    value: RwLock<T>,
    staged: Mutex<Option<T>>,
    is_same: fn(&T, &T) -> bool,
    ticks: AtomicUsize,
}

impl<T> VarState<T> {
    pub fn new(value: T, is_same: fn(&T, &T) -> bool) -> Self {
        Self {
            value: RwLock::new(value),
            staged: Mutex::new(None),
            is_same,
            ticks: AtomicUsize::new(0),
        }
    }

    pub fn stage(&self, value: T) {
        *self.staged.lock() = Some(value);
    }

    pub fn staged_or_current(&self) -> T
    where
        T: Clone,
    {
        if let Some(staged) = &*self.staged.lock() {
            return staged.clone();
        }
        self.value.read().clone()
    }
}

impl<T: Send + Sync + 'static> AnyNode for VarState<T> {
    fn role(&self) -> NodeRole {
        NodeRole::Input
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        // inputs are flushed at the start of the turn, never ticked
        TickOutcome::Unchanged { retrack: None }
    }

    fn flush_staged(&self) -> bool {
        let Some(next) = self.staged.lock().take() else {
            return false;
        };
        let mut value = self.value.write();
        let changed = !(self.is_same)(&value, &next);
        *value = next;
        if changed {
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    fn clear_staged(&self) {
        self.staged.lock().take();
    }
}

impl<T: Send + Sync + 'static> SignalValue<T> for VarState<T> {
    fn read_with(&self, f: &mut dyn FnMut(&T)) {
        f(&self.value.read());
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// An input signal: holds a value, mutated only through [`set`](Var::set)
/// and [`update`](Var::update).
///
/// A `set` inside a transaction body is staged on that turn; a bare `set`
/// opens (and commits) a single-change synchronous turn of its own.
pub struct Var<T> {
    pub(crate) state: Arc<VarState<T>>,
    pub(crate) link: Link,
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            link: self.link.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Var")
            .field("type", &std::any::type_name::<T>())
            .field("node", &self.link.id)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Var<T> {
    /// Stages `value` as this variable's next value.
    ///
    /// The change takes effect when the surrounding transaction commits. If
    /// the staged value compares equal to the current one, dependents are
    /// not even scheduled.
    pub fn set(&self, value: T) {
        let state = Arc::clone(&self.state);
        let node = Arc::clone(&self.state) as Arc<dyn AnyNode>;
        let id = self.link.id;
        let domain = self.link.upgrade();
        domain.with_staging(id, node, move || state.stage(value));
    }

    /// Read-modify-write convenience over [`set`](Var::set). Starts from the
    /// staged value when one exists, so repeated updates inside one
    /// transaction compose.
    pub fn update(&self, f: impl FnOnce(&mut T))
    where
        T: Clone,
    {
        let mut next = self.state.staged_or_current();
        f(&mut next);
        self.set(next);
    }

    /// How many turns have actually changed this variable.
    pub fn times_ticked(&self) -> usize {
        self.state.ticks.load(Ordering::Relaxed)
    }

    /// The identity of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.link.id
    }
}

impl<T> Dependency for Var<T> {
    fn dep_ref(&self) -> DepRef {
        self.link.dep_ref()
    }
}

impl<T> SignalRead<T> for Var<T> {
    fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        f(&self.state.value.read())
    }
}
