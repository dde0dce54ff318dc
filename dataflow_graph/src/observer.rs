//! Observer nodes: the sinks of the graph.
//!
//! An observer never runs its callback inline during propagation. When the
//! node it watches changes, the scheduler only notes the observer; the
//! callback runs in the turn's commit phase, after propagation has reached
//! quiescence, in the order observers were registered. A panicking callback
//! is captured into the turn report and does not stop the observers after
//! it.

use crate::domain::Link;
use crate::graph::{
    catch_user, panic_message, AnyNode, NodeId, NodeRole, ObserverInvoke,
    TickCx, TickOutcome,
};
use crate::stream::EventStream;
use crate::traits::SignalRead;
use std::marker::PhantomData;

/// Watches a signal; the callback receives the committed value.
pub(crate) struct SignalObserver<T, S> {
    subject: S,
    callback: Box<dyn Fn(&T) + Send + Sync>,
    _value: PhantomData<fn() -> T>,
}

impl<T, S> SignalObserver<T, S> {
    pub fn new(subject: S, callback: Box<dyn Fn(&T) + Send + Sync>) -> Self {
        Self {
            subject,
            callback,
            _value: PhantomData,
        }
    }
}

impl<T, S> AnyNode for SignalObserver<T, S>
where
    T: 'static,
    S: SignalRead<T> + Send + Sync + 'static,
{
    fn role(&self) -> NodeRole {
        NodeRole::Observer
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        // sinks never change; invocation happens at commit
        TickOutcome::Unchanged { retrack: None }
    }

    fn as_observer(&self) -> Option<&dyn ObserverInvoke> {
        Some(self)
    }
}

impl<T, S> ObserverInvoke for SignalObserver<T, S>
where
    T: 'static,
    S: SignalRead<T> + Send + Sync + 'static,
{
    fn invoke(&self) -> Result<(), String> {
        catch_user(|| self.subject.with(|value| (self.callback)(value)))
            .map_err(|payload| panic_message(payload.as_ref()))
    }
}

/// Watches a stream; the callback receives every event of the turn, in
/// buffer order.
pub(crate) struct StreamObserver<T> {
    subject: EventStream<T>,
    callback: Box<dyn Fn(&T) + Send + Sync>,
}

impl<T> StreamObserver<T> {
    pub fn new(
        subject: EventStream<T>,
        callback: Box<dyn Fn(&T) + Send + Sync>,
    ) -> Self {
        Self { subject, callback }
    }
}

impl<T: Send + Sync + 'static> AnyNode for StreamObserver<T> {
    fn role(&self) -> NodeRole {
        NodeRole::Observer
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        TickOutcome::Unchanged { retrack: None }
    }

    fn as_observer(&self) -> Option<&dyn ObserverInvoke> {
        Some(self)
    }
}

impl<T: Send + Sync + 'static> ObserverInvoke for StreamObserver<T> {
    fn invoke(&self) -> Result<(), String> {
        catch_user(|| {
            self.subject.with_buffer(&mut |events| {
                for event in events {
                    (self.callback)(event);
                }
            });
        })
        .map_err(|payload| panic_message(payload.as_ref()))
    }
}

/// Keeps an observer registered. Dropping the handle unregisters the
/// observer; a dropped observer no longer runs.
#[must_use = "dropping an ObserverHandle unregisters the observer"]
pub struct ObserverHandle {
    pub(crate) link: Link,
}

impl ObserverHandle {
    /// The identity of the underlying node, as it appears in turn reports.
    pub fn node_id(&self) -> NodeId {
        self.link.id
    }

    /// Explicitly unregisters the observer. Equivalent to dropping the
    /// handle.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("node", &self.link.id)
            .finish()
    }
}
