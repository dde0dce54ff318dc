use super::{EventStream, StreamBuffer};
use crate::domain::Link;
use crate::graph::{AnyNode, NodeId, NodeRole, TickCx, TickOutcome};
use crate::traits::{AsStream, DepRef, Dependency};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Backing state of an event source: the events staged for the next turn
/// and the buffer carried during the current one.
pub(crate) struct SourceState<T> {
    buffer: RwLock<Vec<T>>,
    staged: Mutex<Vec<T>>,
    ticks: AtomicUsize,
}

impl<T> SourceState<T> {
    pub fn new() -> Self {
        Self {
            buffer: RwLock::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
            ticks: AtomicUsize::new(0),
        }
    }

    pub fn stage(&self, event: T) {
        self.staged.lock().push(event);
    }
}

impl<T: Send + Sync + 'static> AnyNode for SourceState<T> {
    fn role(&self) -> NodeRole {
        NodeRole::Input
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        // inputs are flushed at the start of the turn, never ticked
        TickOutcome::Unchanged { retrack: None }
    }

    fn flush_staged(&self) -> bool {
        let mut staged = self.staged.lock();
        if staged.is_empty() {
            return false;
        }
        self.buffer.write().append(&mut staged);
        self.ticks.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn clear_staged(&self) {
        self.staged.lock().clear();
    }

    fn end_turn(&self) {
        self.buffer.write().clear();
    }
}

impl<T: Send + Sync + 'static> StreamBuffer<T> for SourceState<T> {
    fn with_buffer(&self, f: &mut dyn FnMut(&[T])) {
        f(&self.buffer.read());
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// An input event stream. Events are staged with [`emit`](EventSource::emit)
/// and delivered, in emission order, during the turn that commits them.
pub struct EventSource<T> {
    pub(crate) state: Arc<SourceState<T>>,
    pub(crate) link: Link,
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            link: self.link.clone(),
        }
    }
}

impl<T> std::fmt::Debug for EventSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("type", &std::any::type_name::<T>())
            .field("node", &self.link.id)
            .finish()
    }
}

impl<T: Send + Sync + 'static> EventSource<T> {
    /// Stages one event. Inside a transaction body the event joins that
    /// turn; a bare `emit` opens a single-change synchronous turn.
    pub fn emit(&self, event: T) {
        let state = Arc::clone(&self.state);
        let node = Arc::clone(&self.state) as Arc<dyn AnyNode>;
        let id = self.link.id;
        let domain = self.link.upgrade();
        domain.with_staging(id, node, move || state.stage(event));
    }

    /// This source viewed as a plain event stream.
    pub fn stream(&self) -> EventStream<T> {
        EventStream {
            node: Arc::clone(&self.state) as Arc<dyn StreamBuffer<T>>,
            link: self.link.clone(),
        }
    }

    /// How many turns have carried events from this source.
    pub fn times_ticked(&self) -> usize {
        self.state.ticks.load(Ordering::Relaxed)
    }

    /// The identity of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.link.id
    }
}

impl<T> Dependency for EventSource<T> {
    fn dep_ref(&self) -> DepRef {
        self.link.dep_ref()
    }
}

impl<T: Send + Sync + 'static> AsStream<T> for EventSource<T> {
    fn as_stream(&self) -> EventStream<T> {
        self.stream()
    }
}
