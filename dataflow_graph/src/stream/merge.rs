use super::{EventStream, StreamBuffer};
use crate::domain::Link;
use crate::error::GraphError;
use crate::graph::{AnyNode, NodeId, NodeRole, TickCx, TickOutcome};
use crate::traits::{AsStream, DepRef, Dependency};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The union of several event streams. The per-turn buffer concatenates the
/// input buffers in input order, so events from earlier inputs sort first
/// within a turn.
pub(crate) struct MergeState<T> {
    buffer: RwLock<Vec<T>>,
    inputs: RwLock<Vec<EventStream<T>>>,
    ticks: AtomicUsize,
}

impl<T> MergeState<T> {
    pub fn new(inputs: Vec<EventStream<T>>) -> Self {
        Self {
            buffer: RwLock::new(Vec::new()),
            inputs: RwLock::new(inputs),
            ticks: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> AnyNode for MergeState<T> {
    fn role(&self) -> NodeRole {
        NodeRole::Stream
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        let mut union = Vec::new();
        for input in self.inputs.read().iter() {
            input.with_buffer(&mut |events| union.extend_from_slice(events));
        }
        let changed = !union.is_empty();
        *self.buffer.write() = union;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if changed {
            TickOutcome::Changed { retrack: None }
        } else {
            TickOutcome::Unchanged { retrack: None }
        }
    }

    fn end_turn(&self) {
        self.buffer.write().clear();
    }
}

impl<T: Clone + Send + Sync + 'static> StreamBuffer<T> for MergeState<T> {
    fn with_buffer(&self, f: &mut dyn FnMut(&[T])) {
        f(&self.buffer.read());
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// A stream union with a mutable input list.
///
/// [`push_input`](Merge::push_input) and [`remove_input`](Merge::remove_input)
/// are the runtime graph-surgery surface: this is where structural errors —
/// cycles, cross-domain edges, detaching something never attached — come
/// back to the caller, with the graph left untouched.
pub struct Merge<T> {
    pub(crate) state: Arc<MergeState<T>>,
    pub(crate) link: Link,
}

impl<T> Clone for Merge<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            link: self.link.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Merge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merge")
            .field("type", &std::any::type_name::<T>())
            .field("node", &self.link.id)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Merge<T> {
    /// Attaches another input to the union.
    pub fn push_input(&self, input: &impl AsStream<T>) -> Result<(), GraphError> {
        let stream = input.as_stream();
        if stream.link.domain_key() != self.link.domain_key() {
            return Err(GraphError::CrossDomain);
        }
        let domain = self.link.upgrade();
        domain.structural_edit(|g| g.attach(stream.link.id, self.link.id))?;
        self.state.inputs.write().push(stream);
        Ok(())
    }

    /// Detaches an input from the union.
    pub fn remove_input(
        &self,
        input: &impl AsStream<T>,
    ) -> Result<(), GraphError> {
        let stream = input.as_stream();
        if stream.link.domain_key() != self.link.domain_key() {
            return Err(GraphError::CrossDomain);
        }
        let domain = self.link.upgrade();
        domain.structural_edit(|g| g.detach(stream.link.id, self.link.id))?;
        let mut inputs = self.state.inputs.write();
        if let Some(pos) = inputs
            .iter()
            .position(|existing| existing.link.id == stream.link.id)
        {
            inputs.remove(pos);
        }
        Ok(())
    }

    /// This union viewed as a plain event stream.
    pub fn stream(&self) -> EventStream<T> {
        EventStream {
            node: Arc::clone(&self.state) as Arc<dyn StreamBuffer<T>>,
            link: self.link.clone(),
        }
    }

    /// How many turns this union has recomputed in.
    pub fn times_ticked(&self) -> usize {
        self.state.ticks.load(Ordering::Relaxed)
    }

    /// The identity of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.link.id
    }
}

impl<T> Dependency for Merge<T> {
    fn dep_ref(&self) -> DepRef {
        self.link.dep_ref()
    }
}

impl<T: Clone + Send + Sync + 'static> AsStream<T> for Merge<T> {
    fn as_stream(&self) -> EventStream<T> {
        self.stream()
    }
}
