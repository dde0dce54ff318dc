//! The [`Domain`]: the container that owns one propagation engine and every
//! node bound to it.
//!
//! A domain is a first-class value, not a process-wide singleton; any number
//! of domains coexist, each with its own node table, turn counter, and
//! engine, and nodes never cross between them.

use crate::engine::{
    ParallelEngine, PropagationCx, PropagationEngine, ResolvedSet, Schedule,
    SequentialEngine,
};
use crate::error::{GraphError, ObserverFailure, TurnError, TurnReport};
use crate::graph::{
    catch_user, panic_message, AnyNode, GraphState, NodeId, NodeRole,
};
use crate::observer::{ObserverHandle, SignalObserver, StreamObserver};
use crate::signal::{
    default_is_same, DynScope, DynState, FoldState, LiftState, Signal, Var,
    VarState,
};
use crate::stream::{
    EventSource, EventStream, FilterState, MapState, Merge, MergeState,
    SourceState,
};
use crate::traits::{AsStream, DepRef, Dependencies, Dependency, SignalRead};
use crate::turn::{
    self, CommitHandle, HandleShared, QueuedTurn, TurnBody, TurnId, TurnMode,
    TurnPhase, TurnQueue,
};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Which propagation engine a domain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Single-threaded propagation on the calling thread; fully
    /// deterministic visit order.
    #[default]
    Sequential,
    /// Worker-pool propagation with a level barrier.
    Parallel,
}

/// Whether queued transactions submitted as [`TurnMode::Merged`] may
/// coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Never coalesce; merged turns behave like async turns.
    #[default]
    None,
    /// A merged turn joins the queue tail when the tail is itself a merged
    /// turn that has not started running.
    Adjacent,
}

/// Construction-time options of a [`Domain`].
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    engine: EngineKind,
    worker_count: Option<usize>,
    merge_policy: MergePolicy,
    relaxed_scheduling: bool,
}

impl DomainConfig {
    /// Selects the propagation engine.
    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Sizes the parallel engine's worker pool. Defaults to the hardware
    /// parallelism of the machine.
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers);
        self
    }

    /// Selects how merged async turns coalesce.
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Opts into relaxed parallel scheduling: nodes dispatch as soon as
    /// their own inputs settle, without the level barrier. Only sound when
    /// user computations read nothing but the inputs they are wired to.
    pub fn with_relaxed_scheduling(mut self, relaxed: bool) -> Self {
        self.relaxed_scheduling = relaxed;
        self
    }

    pub(crate) fn merge_adjacent(&self) -> bool {
        self.merge_policy == MergePolicy::Adjacent
    }
}

/// Ties a public handle to its node: the owning domain, the node id, and
/// the shared guard whose last drop releases the node.
pub(crate) struct Link {
    pub(crate) domain: Weak<DomainInner>,
    pub(crate) id: NodeId,
    pub(crate) guard: Arc<HandleGuard>,
}

impl Clone for Link {
    fn clone(&self) -> Self {
        Self {
            domain: Weak::clone(&self.domain),
            id: self.id,
            guard: Arc::clone(&self.guard),
        }
    }
}

impl Link {
    pub fn dep_ref(&self) -> DepRef {
        DepRef {
            id: self.id,
            domain: Weak::clone(&self.domain),
        }
    }

    pub fn domain_key(&self) -> usize {
        Weak::as_ptr(&self.domain) as usize
    }

    pub fn upgrade(&self) -> Arc<DomainInner> {
        self.domain
            .upgrade()
            .expect("tried to use a node whose domain has been dropped")
    }
}

/// RAII registration of one handle family with the node table.
pub(crate) struct HandleGuard {
    domain: Weak<DomainInner>,
    id: NodeId,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.domain.upgrade() {
            inner.release_and_sweep(self.id);
        }
    }
}


/// A container owning one dependency graph and the engine that propagates
/// changes through it.
///
/// ```
/// use dataflow_graph::{Domain, DomainConfig};
/// use dataflow_graph::prelude::*;
///
/// let domain = Domain::new(DomainConfig::default());
/// let width = domain.var(1);
/// let height = domain.var(2);
/// let area = domain.signal((&width, &height), {
///     let (w, h) = (width.clone(), height.clone());
///     move || w.get() * h.get()
/// });
/// assert_eq!(area.get(), 2);
///
/// width.set(10);
/// assert_eq!(area.get(), 20);
/// assert_eq!(area.times_ticked(), 1);
/// ```
#[derive(Clone)]
pub struct Domain {
    pub(crate) inner: Arc<DomainInner>,
}

pub(crate) struct DomainInner {
    /// Back-reference to this allocation, set at construction; this is what
    /// node handles and the driver thread hold.
    weak_self: Weak<DomainInner>,
    config: DomainConfig,
    pub(crate) graph: RwLock<GraphState>,
    /// The domain-global turn lock: at most one turn propagates at a time.
    turn_lock: Mutex<()>,
    /// Committed turns so far; the next turn gets `count + 1`.
    turn_counter: AtomicU64,
    poisoned: AtomicBool,
    /// Membership of the turn currently propagating, if any; consulted so
    /// node removal never touches a scheduled node mid-turn.
    active_members: Mutex<Option<Arc<ResolvedSet>>>,
    deferred_sweeps: Mutex<Vec<NodeId>>,
    queue: TurnQueue,
    engine: Box<dyn PropagationEngine>,
}

impl Default for Domain {
    fn default() -> Self {
        Self::new(DomainConfig::default())
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("turns", &self.turn_count())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl Domain {
    /// Creates a domain with the given configuration.
    pub fn new(config: DomainConfig) -> Self {
        let engine: Box<dyn PropagationEngine> = match config.engine {
            EngineKind::Sequential => Box::new(SequentialEngine),
            EngineKind::Parallel => {
                let workers = config.worker_count.unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(4)
                });
                Box::new(ParallelEngine::new(
                    workers.max(2),
                    config.relaxed_scheduling,
                ))
            }
        };
        Self {
            inner: Arc::new_cyclic(|weak| DomainInner {
                weak_self: Weak::clone(weak),
                config,
                graph: RwLock::new(GraphState::default()),
                turn_lock: Mutex::new(()),
                turn_counter: AtomicU64::new(0),
                poisoned: AtomicBool::new(false),
                active_members: Mutex::new(None),
                deferred_sweeps: Mutex::new(Vec::new()),
                queue: TurnQueue::default(),
                engine,
            }),
        }
    }

    /// Creates an input variable holding `value`.
    #[track_caller]
    pub fn var<T>(&self, value: T) -> Var<T>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        self.var_with_compare(value, default_is_same::<T>)
    }

    /// Creates an input variable with a custom change detector. `is_same`
    /// returning `true` suppresses propagation.
    #[track_caller]
    pub fn var_with_compare<T>(
        &self,
        value: T,
        is_same: fn(&T, &T) -> bool,
    ) -> Var<T>
    where
        T: Send + Sync + 'static,
    {
        let state = Arc::new(VarState::new(value, is_same));
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Input,
            &[],
        );
        Var { state, link }
    }

    /// Creates a computed signal over a fixed input list.
    ///
    /// `recompute` is evaluated once immediately (a signal always has a
    /// value) and then once per turn in which at least one input changed.
    #[track_caller]
    pub fn signal<T, D>(
        &self,
        inputs: D,
        recompute: impl Fn() -> T + Send + Sync + 'static,
    ) -> Signal<T>
    where
        T: PartialEq + Send + Sync + 'static,
        D: Dependencies,
    {
        self.signal_with_compare(inputs, recompute, default_is_same::<T>)
    }

    /// [`signal`](Domain::signal) with a custom change detector.
    #[track_caller]
    pub fn signal_with_compare<T, D>(
        &self,
        inputs: D,
        recompute: impl Fn() -> T + Send + Sync + 'static,
        is_same: fn(&T, &T) -> bool,
    ) -> Signal<T>
    where
        T: Send + Sync + 'static,
        D: Dependencies,
    {
        let refs = inputs.dep_refs();
        let state = Arc::new(LiftState::new(Box::new(recompute), is_same));
        state.prime();
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Signal,
            &refs,
        );
        Signal { node: state, link }
    }

    /// Creates a computed signal whose inputs are discovered from what the
    /// closure reads through its [`DynScope`].
    #[track_caller]
    pub fn signal_dyn<T>(
        &self,
        recompute: impl Fn(&DynScope) -> T + Send + Sync + 'static,
    ) -> Signal<T>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        self.signal_dyn_with_compare(recompute, default_is_same::<T>)
    }

    /// [`signal_dyn`](Domain::signal_dyn) with a custom change detector.
    #[track_caller]
    pub fn signal_dyn_with_compare<T>(
        &self,
        recompute: impl Fn(&DynScope) -> T + Send + Sync + 'static,
        is_same: fn(&T, &T) -> bool,
    ) -> Signal<T>
    where
        T: Send + Sync + 'static,
    {
        let state = Arc::new(DynState::new(Box::new(recompute), is_same));
        let tracked = state.prime(self.inner.key());
        let link = self.inner.create_node_from_ids(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Signal,
            &tracked,
        );
        Signal { node: state, link }
    }

    /// Creates an input event stream.
    #[track_caller]
    pub fn event_source<T>(&self) -> EventSource<T>
    where
        T: Send + Sync + 'static,
    {
        let state = Arc::new(SourceState::new());
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Input,
            &[],
        );
        EventSource { state, link }
    }

    /// Creates a stream union over the given inputs. Inputs can be added
    /// and removed later through the returned handle.
    #[track_caller]
    pub fn merge<T>(&self, inputs: &[&dyn AsStream<T>]) -> Merge<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let streams: Vec<EventStream<T>> =
            inputs.iter().map(|input| input.as_stream()).collect();
        let refs: Vec<DepRef> =
            streams.iter().map(|stream| stream.dep_ref()).collect();
        let state = Arc::new(MergeState::new(streams));
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Stream,
            &refs,
        );
        Merge { state, link }
    }

    /// Derives a stream carrying `fun` of every input event.
    #[track_caller]
    pub fn map<A, B>(
        &self,
        input: &impl AsStream<A>,
        fun: impl Fn(&A) -> B + Send + Sync + 'static,
    ) -> EventStream<B>
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        let upstream = input.as_stream();
        let refs = [upstream.dep_ref()];
        let state = Arc::new(MapState::new(upstream, Box::new(fun)));
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Stream,
            &refs,
        );
        EventStream { node: state, link }
    }

    /// Derives a stream keeping only input events that satisfy `pred`.
    #[track_caller]
    pub fn filter<T>(
        &self,
        input: &impl AsStream<T>,
        pred: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> EventStream<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let upstream = input.as_stream();
        let refs = [upstream.dep_ref()];
        let state = Arc::new(FilterState::new(upstream, Box::new(pred)));
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Stream,
            &refs,
        );
        EventStream { node: state, link }
    }

    /// Creates a signal accumulating an event stream: a left fold of each
    /// turn's events into the running state.
    #[track_caller]
    pub fn fold<S, T>(
        &self,
        input: &impl AsStream<T>,
        init: S,
        step: impl Fn(S, &T) -> S + Send + Sync + 'static,
    ) -> Signal<S>
    where
        S: Clone + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let upstream = input.as_stream();
        let refs = [upstream.dep_ref()];
        let state = Arc::new(FoldState::new(upstream, init, Box::new(step)));
        let link = self.inner.create_node(
            Arc::clone(&state) as Arc<dyn AnyNode>,
            NodeRole::Signal,
            &refs,
        );
        Signal { node: state, link }
    }

    /// Registers a commit-phase callback on a signal's new values.
    #[track_caller]
    pub fn observe<T, S>(
        &self,
        subject: &S,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> ObserverHandle
    where
        T: 'static,
        S: SignalRead<T> + Clone + Send + Sync + 'static,
    {
        let dep = subject.dep_ref();
        let state = Arc::new(SignalObserver::new(
            subject.clone(),
            Box::new(callback),
        ));
        let link = self.inner.create_node(
            state as Arc<dyn AnyNode>,
            NodeRole::Observer,
            &[dep],
        );
        ObserverHandle { link }
    }

    /// Registers a commit-phase callback on every event a stream carries.
    #[track_caller]
    pub fn observe_events<T>(
        &self,
        input: &impl AsStream<T>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> ObserverHandle
    where
        T: Send + Sync + 'static,
    {
        let upstream = input.as_stream();
        let dep = upstream.dep_ref();
        let state = Arc::new(StreamObserver::new(upstream, Box::new(callback)));
        let link = self.inner.create_node(
            state as Arc<dyn AnyNode>,
            NodeRole::Observer,
            &[dep],
        );
        ObserverHandle { link }
    }

    /// Opens a transaction.
    ///
    /// The body stages input mutations; when it returns, the staged changes
    /// propagate as one atomic turn. `Sync` blocks until commit; `Async`
    /// and `Merged` queue the turn and return immediately. The returned
    /// handle resolves with the committed turn id or the aggregated
    /// failures.
    ///
    /// Called from inside an observer of this domain, the transaction
    /// becomes a continuation turn regardless of mode: it is queued and
    /// drained, FIFO, right after the current turn finishes committing.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "trace", skip(self, body))
    )]
    pub fn do_transaction(
        &self,
        mode: TurnMode,
        body: impl FnOnce() + Send + 'static,
    ) -> CommitHandle {
        self.inner.submit(mode, Box::new(body))
    }

    /// Runs a synchronous transaction and returns the body's value, or the
    /// turn's aggregated failures.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "trace", skip(self, body))
    )]
    pub fn transact<R>(
        &self,
        body: impl FnOnce() -> R,
    ) -> Result<R, TurnError> {
        let key = self.inner.key();
        assert!(
            turn::frame_phase(key).is_none(),
            "a turn is already active on this domain on this thread; use \
             do_transaction to queue a follow-up"
        );
        let (value, result) = self.inner.execute_sync(body);
        result.map(|_| value.expect("transaction body did not run"))
    }

    /// Blocks until every queued async transaction has committed and the
    /// driver is idle.
    pub fn drain(&self) {
        self.inner.queue.wait_idle();
    }

    /// The number of committed turns.
    pub fn turn_count(&self) -> u64 {
        self.inner.turn_counter.load(Ordering::Relaxed)
    }

    /// Whether the domain has hit an internal invariant violation and
    /// rejects further operations.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Relaxed)
    }
}

impl DomainInner {
    /// The identity of this domain; also the key of its turn frames.
    pub(crate) fn key(&self) -> usize {
        self as *const DomainInner as usize
    }

    fn ensure_alive(&self) {
        assert!(
            !self.poisoned.load(Ordering::Relaxed),
            "the domain is poisoned and rejects further operations"
        );
    }

    fn poison(&self, message: &str) {
        self.poisoned.store(true, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::error!(%message, "domain poisoned");
        #[cfg(not(feature = "tracing"))]
        let _ = message;
    }

    /// Inserts a node whose inputs are given as handles.
    pub(crate) fn create_node(
        &self,
        node: Arc<dyn AnyNode>,
        role: NodeRole,
        deps: &[DepRef],
    ) -> Link {
        let key = self.key();
        for dep in deps {
            assert_eq!(
                dep.domain_key(),
                key,
                "cannot use a node from a different domain as an input"
            );
        }
        let ids: Vec<NodeId> = deps.iter().map(|dep| dep.id).collect();
        self.create_node_from_ids(node, role, &ids)
    }

    pub(crate) fn create_node_from_ids(
        &self,
        node: Arc<dyn AnyNode>,
        role: NodeRole,
        preds: &[NodeId],
    ) -> Link {
        self.ensure_alive();
        let id = {
            let mut graph = self.graph.write();
            match graph.insert(node, role, preds) {
                Ok(id) => id,
                Err(err) => panic!("failed to create node: {err}"),
            }
        };
        Link {
            domain: Weak::clone(&self.weak_self),
            id,
            guard: Arc::new(HandleGuard {
                domain: Weak::clone(&self.weak_self),
                id,
            }),
        }
    }

    /// Serialized graph surgery for the public edge-mutation surface.
    /// Waits for turn quiescence unless the caller already holds the turn
    /// (it is staging or committing on this thread).
    pub(crate) fn structural_edit<R>(
        &self,
        edit: impl FnOnce(&mut GraphState) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        if self.poisoned.load(Ordering::Relaxed) {
            return Err(GraphError::Poisoned);
        }
        assert!(
            !turn::in_tick(),
            "cannot rewire the graph from inside a node computation"
        );
        let key = self.key();
        if turn::frame_phase(key).is_some() {
            edit(&mut self.graph.write())
        } else {
            let _turn = self.turn_lock.lock();
            edit(&mut self.graph.write())
        }
    }

    /// Routes an input mutation to wherever it belongs: the open staging
    /// frame, the commit phase's continuation list, or a fresh synchronous
    /// turn.
    pub(crate) fn with_staging(
        &self,
        id: NodeId,
        node: Arc<dyn AnyNode>,
        stage: impl FnOnce() + Send + 'static,
    ) {
        assert!(
            !turn::in_tick(),
            "cannot stage an input from inside a node computation"
        );
        let key = self.key();
        match turn::frame_phase(key) {
            Some(TurnPhase::Staging) => {
                stage();
                turn::record_staged(key, id, node);
            }
            Some(TurnPhase::Commit) => {
                let (_handle, shared) = CommitHandle::new();
                let body: TurnBody = Box::new(move || {
                    stage();
                    turn::record_staged(key, id, node);
                });
                let _pushed = turn::push_continuation(key, body, shared);
                debug_assert!(_pushed, "commit frame disappeared");
            }
            None => {
                let (_value, result) = self.execute_sync(move || {
                    stage();
                    turn::record_staged(key, id, node);
                });
                if let Err(_err) = result {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        error = %_err,
                        "implicit turn committed with failures"
                    );
                }
            }
        }
    }

    pub(crate) fn submit(
        &self,
        mode: TurnMode,
        body: TurnBody,
    ) -> CommitHandle {
        if self.poisoned.load(Ordering::Relaxed) {
            return CommitHandle::resolved(Err(TurnError::Poisoned));
        }
        let key = self.key();
        match turn::frame_phase(key) {
            Some(TurnPhase::Commit) => {
                let (handle, shared) = CommitHandle::new();
                turn::push_continuation(key, body, shared);
                handle
            }
            Some(TurnPhase::Staging) => panic!(
                "a transaction is already open on this domain on this thread"
            ),
            None => match mode {
                TurnMode::Sync => {
                    let (handle, shared) = CommitHandle::new();
                    if shared.begin() {
                        let (_value, result) = self.execute_sync(body);
                        shared.resolve(result);
                    }
                    handle
                }
                TurnMode::Async | TurnMode::Merged => {
                    let (handle, shared) = CommitHandle::new();
                    self.ensure_driver();
                    self.queue.push(
                        QueuedTurn {
                            parts: vec![(body, shared)],
                            mergeable: mode == TurnMode::Merged,
                        },
                        self.config.merge_adjacent(),
                    );
                    handle
                }
            },
        }
    }

    fn ensure_driver(&self) {
        if !self.queue.claim_driver() {
            return;
        }
        let weak = Weak::clone(&self.weak_self);
        std::thread::Builder::new()
            .name("dataflow-driver".into())
            .spawn(move || loop {
                let Some(inner) = weak.upgrade() else { break };
                if let Some(item) =
                    inner.queue.pop_wait(Duration::from_millis(200))
                {
                    inner.execute_queued(item);
                    inner.queue.mark_idle();
                }
                // the strong reference dies each iteration so the domain
                // can be dropped while the driver sleeps
                drop(inner);
            })
            .expect("failed to spawn the turn driver");
    }

    /// Driver side: runs one queued (possibly coalesced) transaction.
    fn execute_queued(&self, item: QueuedTurn) {
        if self.poisoned.load(Ordering::Relaxed) {
            for (_, shared) in item.parts {
                shared.resolve(Err(TurnError::Poisoned));
            }
            return;
        }
        let live: Vec<(TurnBody, Arc<HandleShared>)> = item
            .parts
            .into_iter()
            .filter(|(_, shared)| shared.begin())
            .collect();
        if live.is_empty() {
            return;
        }

        let guard = self.turn_lock.lock();
        let (bodies, handles): (Vec<_>, Vec<_>) = live.into_iter().unzip();
        let run = catch_user(|| {
            self.run_single_turn(move || {
                for body in bodies {
                    body();
                }
            })
        });
        match run {
            Ok((_value, result, continuations)) => {
                for shared in &handles {
                    shared.resolve(result.clone());
                }
                self.drain_continuations(continuations);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                for shared in handles {
                    shared.resolve(Err(TurnError::BodyPanicked {
                        message: message.clone(),
                    }));
                }
            }
        }
        drop(guard);
    }

    /// Caller side: one synchronous turn plus its continuations. A body
    /// panic unwinds to the caller; staged inputs are discarded on the way.
    pub(crate) fn execute_sync<R>(
        &self,
        body: impl FnOnce() -> R,
    ) -> (Option<R>, Result<TurnId, TurnError>) {
        if self.poisoned.load(Ordering::Relaxed) {
            return (None, Err(TurnError::Poisoned));
        }
        let guard = self.turn_lock.lock();
        let (value, result, continuations) = self.run_single_turn(body);
        self.drain_continuations(continuations);
        drop(guard);
        (Some(value), result)
    }

    /// Runs one complete turn. The turn lock must be held.
    #[allow(clippy::type_complexity)]
    fn run_single_turn<R>(
        &self,
        body: impl FnOnce() -> R,
    ) -> (
        R,
        Result<TurnId, TurnError>,
        Vec<(TurnBody, Arc<HandleShared>)>,
    ) {
        let key = self.key();
        let frame = turn::push_frame(key, TurnPhase::Staging);
        let value = body();
        let staged = frame.finish().staged;
        let (result, continuations) = self.propagate_and_commit(staged);
        (value, result, continuations)
    }

    /// Drains continuation turns, FIFO, each one a full turn of its own.
    /// The turn lock must be held.
    fn drain_continuations(
        &self,
        first: Vec<(TurnBody, Arc<HandleShared>)>,
    ) {
        let mut queue: VecDeque<(TurnBody, Arc<HandleShared>)> = first.into();
        while let Some((body, shared)) = queue.pop_front() {
            if !shared.begin() {
                continue;
            }
            let run = catch_user(|| self.run_single_turn(body));
            match run {
                Ok(((), result, more)) => {
                    shared.resolve(result);
                    queue.extend(more);
                }
                Err(payload) => {
                    shared.resolve(Err(TurnError::BodyPanicked {
                        message: panic_message(payload.as_ref()),
                    }));
                }
            }
        }
    }

    /// The turn pipeline: flush staged inputs, build membership, run the
    /// engine to quiescence, execute the commit phase, clear per-turn
    /// buffers, advance the counter.
    #[allow(clippy::type_complexity)]
    fn propagate_and_commit(
        &self,
        staged: Vec<(NodeId, Arc<dyn AnyNode>)>,
    ) -> (
        Result<TurnId, TurnError>,
        Vec<(TurnBody, Arc<HandleShared>)>,
    ) {
        let key = self.key();
        let turn = TurnId(self.turn_counter.load(Ordering::Relaxed) + 1);

        let mut changed_inputs = Vec::new();
        let mut flushed: Vec<(NodeId, Arc<dyn AnyNode>)> = Vec::new();
        {
            let graph = self.graph.read();
            let mut seen = FxHashSet::default();
            for (id, node) in staged {
                if !seen.insert(id) {
                    continue;
                }
                if !graph.contains(id) {
                    node.clear_staged();
                    continue;
                }
                if node.flush_staged() {
                    changed_inputs.push(id);
                }
                flushed.push((id, node));
            }
        }

        let mut report = TurnReport::default();
        let mut continuations = Vec::new();

        if !changed_inputs.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                turn = turn.value(),
                inputs = changed_inputs.len(),
                "propagating"
            );

            let mut sched = {
                let graph = self.graph.read();
                Schedule::build(&graph, &changed_inputs, key)
            };
            *self.active_members.lock() = Some(sched.resolved_handle());

            let outcome = self.engine.propagate(PropagationCx {
                graph: &self.graph,
                sched: &mut sched,
                turn,
            });
            if let Err(fault) = outcome {
                self.poison(&fault.message);
                *self.active_members.lock() = None;
                return (Err(TurnError::Poisoned), continuations);
            }
            report.node_failures = sched.take_failures();

            // commit phase: observers in registration order, then buffers
            let commit_frame = turn::push_frame(key, TurnPhase::Commit);
            let mut to_run: Vec<(usize, NodeId, Arc<dyn AnyNode>)> = {
                let graph = self.graph.read();
                sched
                    .take_observers()
                    .into_iter()
                    .filter_map(|id| {
                        let index = graph.observer_index(id)?;
                        let node = graph.node(id)?;
                        Some((index, id, node))
                    })
                    .collect()
            };
            to_run.sort_by_key(|(index, _, _)| *index);
            for (_, id, node) in &to_run {
                if let Some(observer) = node.as_observer() {
                    if let Err(message) = observer.invoke() {
                        report.observer_failures.push(ObserverFailure {
                            observer: *id,
                            message,
                        });
                    }
                }
            }
            continuations = commit_frame.finish().continuations;

            {
                let graph = self.graph.read();
                for &id in sched.members() {
                    if let Some(node) = graph.node(id) {
                        node.end_turn();
                    }
                }
            }
            for (_, node) in &flushed {
                node.end_turn();
            }

            *self.active_members.lock() = None;
            self.drain_deferred_sweeps();
        } else {
            for (_, node) in &flushed {
                node.end_turn();
            }
        }

        self.turn_counter.fetch_add(1, Ordering::Relaxed);
        let result = if report.is_clean() {
            Ok(turn)
        } else {
            Err(TurnError::Failed { turn, report })
        };
        (result, continuations)
    }

    /// Releases one handle guard and removes the node if nothing else keeps
    /// it alive.
    fn release_and_sweep(&self, id: NodeId) {
        self.graph.write().release_handle(id);
        self.sweep(id);
    }

    fn sweep(&self, id: NodeId) {
        {
            let members = self.active_members.lock();
            if let Some(set) = &*members {
                if set.is_member(id) {
                    drop(members);
                    self.deferred_sweeps.lock().push(id);
                    return;
                }
            }
        }
        let mut dropped = Vec::new();
        {
            let mut graph = self.graph.write();
            graph.try_collect(id, &mut dropped);
        }
        // dropping outside the lock: the entries' states own input handles
        // whose guards re-enter the structural lock
        drop(dropped);
    }

    fn drain_deferred_sweeps(&self) {
        let pending = std::mem::take(&mut *self.deferred_sweeps.lock());
        for id in pending {
            self.sweep(id);
        }
    }
}
