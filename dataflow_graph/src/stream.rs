//! Event-carrying nodes: sources, unions, and derived streams.
//!
//! A stream holds a buffer of the events it carried *this turn*; the buffer
//! is cleared when the turn ends, after observers have run. Between turns
//! every stream is empty.

mod merge;
mod ops;
mod source;

pub use merge::*;
pub(crate) use ops::*;
pub use source::*;

use crate::domain::{Domain, Link};
use crate::graph::NodeId;
use crate::observer::ObserverHandle;
use crate::signal::Signal;
use crate::traits::{AsStream, DepRef, Dependency};
use std::sync::Arc;

/// Buffer access used by the generic [`EventStream`] handle and by the
/// nodes consuming a stream.
pub(crate) trait StreamBuffer<T>: Send + Sync {
    fn with_buffer(&self, f: &mut dyn FnMut(&[T]));
    fn ticks(&self) -> usize;
}

/// A read handle to any event-carrying node.
pub struct EventStream<T> {
    pub(crate) node: Arc<dyn StreamBuffer<T>>,
    pub(crate) link: Link,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            link: self.link.clone(),
        }
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("type", &std::any::type_name::<T>())
            .field("node", &self.link.id)
            .finish()
    }
}

impl<T> EventStream<T> {
    pub(crate) fn with_buffer(&self, f: &mut dyn FnMut(&[T])) {
        self.node.with_buffer(f);
    }

    /// How many turns have carried events through this stream.
    pub fn times_ticked(&self) -> usize {
        self.node.ticks()
    }

    /// The identity of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.link.id
    }

    fn domain(&self) -> Domain {
        Domain {
            inner: self.link.upgrade(),
        }
    }
}

impl<T: Send + Sync + 'static> EventStream<T> {
    /// Derives a stream carrying `f` of every event.
    pub fn map<B: Send + Sync + 'static>(
        &self,
        f: impl Fn(&T) -> B + Send + Sync + 'static,
    ) -> EventStream<B> {
        self.domain().map(self, f)
    }

    /// Derives a stream keeping only events satisfying `pred`.
    pub fn filter(
        &self,
        pred: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> EventStream<T>
    where
        T: Clone,
    {
        self.domain().filter(self, pred)
    }

    /// Accumulates this stream into a signal.
    pub fn fold<S: Clone + Send + Sync + 'static>(
        &self,
        init: S,
        step: impl Fn(S, &T) -> S + Send + Sync + 'static,
    ) -> Signal<S> {
        self.domain().fold(self, init, step)
    }

    /// Registers a commit-phase callback for every event this stream
    /// carries.
    pub fn observe(
        &self,
        f: impl Fn(&T) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.domain().observe_events(self, f)
    }
}

impl<T> Dependency for EventStream<T> {
    fn dep_ref(&self) -> DepRef {
        self.link.dep_ref()
    }
}

impl<T> AsStream<T> for EventStream<T> {
    fn as_stream(&self) -> EventStream<T> {
        self.clone()
    }
}
