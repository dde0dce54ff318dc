use super::{EventStream, StreamBuffer};
use crate::graph::{
    catch_user, panic_message, AnyNode, NodeRole, TickCx, TickOutcome,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A derived stream carrying `fun` of every upstream event.
pub(crate) struct MapState<A, B> {
    buffer: RwLock<Vec<B>>,
    input: EventStream<A>,
    fun: Box<dyn Fn(&A) -> B + Send + Sync>,
    ticks: AtomicUsize,
}

impl<A, B> MapState<A, B> {
    pub fn new(
        input: EventStream<A>,
        fun: Box<dyn Fn(&A) -> B + Send + Sync>,
    ) -> Self {
        Self {
            buffer: RwLock::new(Vec::new()),
            input,
            fun,
            ticks: AtomicUsize::new(0),
        }
    }
}

impl<A, B> AnyNode for MapState<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn role(&self) -> NodeRole {
        NodeRole::Stream
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        let mapped = catch_user(|| {
            let mut out = Vec::new();
            self.input.with_buffer(&mut |events| {
                out.reserve(events.len());
                for event in events {
                    out.push((self.fun)(event));
                }
            });
            out
        });
        match mapped {
            Ok(out) => {
                let changed = !out.is_empty();
                *self.buffer.write() = out;
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

    fn end_turn(&self) {
        self.buffer.write().clear();
    }
}

impl<A, B> StreamBuffer<B> for MapState<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn with_buffer(&self, f: &mut dyn FnMut(&[B])) {
        f(&self.buffer.read());
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// A derived stream keeping only upstream events that satisfy `pred`.
pub(crate) struct FilterState<T> {
    buffer: RwLock<Vec<T>>,
    input: EventStream<T>,
    pred: Box<dyn Fn(&T) -> bool + Send + Sync>,
    ticks: AtomicUsize,
}

impl<T> FilterState<T> {
    pub fn new(
        input: EventStream<T>,
        pred: Box<dyn Fn(&T) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            buffer: RwLock::new(Vec::new()),
            input,
            pred,
            ticks: AtomicUsize::new(0),
        }
    }
}

impl<T> AnyNode for FilterState<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn role(&self) -> NodeRole {
        NodeRole::Stream
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        let kept = catch_user(|| {
            let mut out = Vec::new();
            self.input.with_buffer(&mut |events| {
                for event in events {
                    if (self.pred)(event) {
                        out.push(event.clone());
                    }
                }
            });
            out
        });
        match kept {
            Ok(out) => {
                let changed = !out.is_empty();
                *self.buffer.write() = out;
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

    fn end_turn(&self) {
        self.buffer.write().clear();
    }
}

impl<T> StreamBuffer<T> for FilterState<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_buffer(&self, f: &mut dyn FnMut(&[T])) {
        f(&self.buffer.read());
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}
