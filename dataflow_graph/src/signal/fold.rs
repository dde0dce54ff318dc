use super::lift::SignalValue;
use crate::graph::{
    catch_user, panic_message, AnyNode, NodeRole, TickCx, TickOutcome,
};
use crate::stream::EventStream;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A signal driven by an event stream: a left fold of the stream's per-turn
/// buffer into an accumulated state.
///
/// The fold runs on a working copy of the state, so a panicking step leaves
/// the committed state untouched. A turn whose buffer is empty counts as
/// unchanged; a turn that consumed events always counts as changed (the
/// state type is not required to be comparable).
pub(crate) struct FoldState<S, T> {
    value: RwLock<S>,
    input: EventStream<T>,
    step: Box<dyn Fn(S, &T) -> S + Send + Sync>,
    ticks: AtomicUsize,
}

impl<S, T> FoldState<S, T> {
    pub fn new(
        input: EventStream<T>,
        init: S,
        step: Box<dyn Fn(S, &T) -> S + Send + Sync>,
    ) -> Self {
        Self {
            value: RwLock::new(init),
            input,
            step,
            ticks: AtomicUsize::new(0),
        }
    }
}

impl<S, T> AnyNode for FoldState<S, T>
where
    S: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn role(&self) -> NodeRole {
        NodeRole::Signal
    }

    fn tick(&self, _cx: &TickCx) -> TickOutcome {
        let folded = catch_user(|| {
            let mut acc = Some(self.value.read().clone());
            let mut consumed = 0usize;
            self.input.with_buffer(&mut |events| {
                consumed = events.len();
                if events.is_empty() {
                    return;
                }
                let mut state =
                    acc.take().expect("fold buffer visited more than once");
                for event in events {
                    state = (self.step)(state, event);
                }
                acc = Some(state);
            });
            (acc, consumed)
        });

        match folded {
            Ok((Some(state), consumed)) if consumed > 0 => {
                *self.value.write() = state;
                self.ticks.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Changed { retrack: None }
            }
            Ok(_) => TickOutcome::Unchanged { retrack: None },
            Err(payload) => TickOutcome::Failed {
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

impl<S, T> SignalValue<S> for FoldState<S, T>
where
    S: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn read_with(&self, f: &mut dyn FnMut(&S)) {
        f(&self.value.read());
    }

    fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}
