use crate::domain::Link;
use crate::graph::{
    catch_user, panic_message, AnyNode, NodeId, NodeRole, TickCx, TickOutcome,
};
use crate::traits::{DepRef, Dependency, SignalRead};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Typed value access used by the generic [`Signal`] handle. Implemented by
/// every value-carrying node state (variables, lifts, dynamic lifts, folds).
pub(crate) trait SignalValue<T>: Send + Sync {
    fn read_with(&self, f: &mut dyn FnMut(&T));
    fn ticks(&self) -> usize;
}

/// A computed signal with a fixed input list.
///
/// The recompute closure captures the read handles of the values it uses;
/// those captured handles are what keeps the inputs alive for as long as
/// this node exists.
pub(crate) struct LiftState<T> {
    value: RwLock<Option<T>>,
    recompute: Box<dyn Fn() -> T + Send + Sync>,
    is_same: fn(&T, &T) -> bool,
    ticks: AtomicUsize,
}

impl<T> LiftState<T> {
    pub fn new(
        recompute: Box<dyn Fn() -> T + Send + Sync>,
        is_same: fn(&T, &T) -> bool,
    ) -> Self {
        Self {
            value: RwLock::new(None),
            recompute,
            is_same,
            ticks: AtomicUsize::new(0),
        }
    }

    /// The construction-time evaluation. A signal always has a value.
    pub fn prime(&self) {
        let value = (self.recompute)();
        *self.value.write() = Some(value);
    }

    fn store(&self, new_value: T) -> bool {
        let mut slot = self.value.write();
        let changed = match slot.as_ref() {
            Some(old) => !(self.is_same)(old, &new_value),
            None => true,
        };
        *slot = Some(new_value);
        changed
    }
}

impl<T: Send + Sync + 'static> AnyNode for LiftState<T> {
    fn role(&self) -> NodeRole {
        NodeRole::Signal
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        match catch_user(|| (self.recompute)()) {
            Ok(new_value) => {
                let changed = self.store(new_value);
                self.ticks.fetch_add(1, Ordering::Relaxed);
                if changed {
                    TickOutcome::Changed { retrack: None }
                } else {
                    TickOutcome::Unchanged { retrack: None }
                }
            }
            Err(payload) => TickOutcome::Failed {
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

impl<T: Send + Sync + 'static> SignalValue<T> for LiftState<T> {
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

/// A read handle to any value-carrying node.
pub struct Signal<T> {
    pub(crate) node: Arc<dyn SignalValue<T>>,
    pub(crate) link: Link,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            link: self.link.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("type", &std::any::type_name::<T>())
            .field("node", &self.link.id)
            .finish()
    }
}

impl<T> Signal<T> {
    /// How many times this signal has recomputed since it was created (the
    /// construction-time evaluation not included).
    pub fn times_ticked(&self) -> usize {
        self.node.ticks()
    }

    /// The identity of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.link.id
    }
}

impl<T> Dependency for Signal<T> {
    fn dep_ref(&self) -> DepRef {
        self.link.dep_ref()
    }
}

impl<T> SignalRead<T> for Signal<T> {
    fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        let mut f = Some(f);
        let mut out = None;
        self.node.read_with(&mut |value| {
            if let Some(f) = f.take() {
                out = Some(f(value));
            }
        });
        out.expect("signal value access produced no result")
    }
}
