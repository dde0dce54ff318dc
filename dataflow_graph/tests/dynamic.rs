use dataflow_graph::prelude::*;
use dataflow_graph::{Domain, DomainConfig, Signal, TurnError};
use std::sync::{Arc, OnceLock};

#[test]
fn switching_inputs_rewires_the_graph() {
    let domain = Domain::new(DomainConfig::default());
    let use_b = domain.var(false);
    let a = domain.var(10);
    let b = domain.var(20);

    let out = domain.signal_dyn({
        let (use_b, a, b) = (use_b.clone(), a.clone(), b.clone());
        move |scope| {
            if scope.get(&use_b) {
                scope.get(&b)
            } else {
                scope.get(&a)
            }
        }
    });
    assert_eq!(out.get(), 10);

    // while wired to `a`, changes of `b` are invisible
    b.set(21);
    assert_eq!(out.times_ticked(), 0);

    use_b.set(true);
    assert_eq!(out.get(), 21);
    assert_eq!(out.times_ticked(), 1);

    // now the roles are swapped: `b` propagates, `a` does not
    b.set(30);
    assert_eq!(out.get(), 30);
    assert_eq!(out.times_ticked(), 2);

    a.set(99);
    assert_eq!(out.get(), 30);
    assert_eq!(out.times_ticked(), 2);
}

/// The dynamic signal is registered on `flag` *before* `deep` is, so the
/// scheduler visits it first. Its evaluation reaches for `deep` while
/// `deep` is still pending, aborts, is re-queued behind it, and the one
/// completed evaluation sees `flag` and `deep` from the same turn.
#[test]
fn discovering_a_pending_input_defers_the_computation() {
    let domain = Domain::new(DomainConfig::default());
    let flag = domain.var(false);
    let deep_cell: Arc<OnceLock<Signal<i32>>> = Arc::new(OnceLock::new());

    let out = domain.signal_dyn({
        let flag = flag.clone();
        let deep_cell = Arc::clone(&deep_cell);
        move |scope| {
            if scope.get(&flag) {
                let deep = deep_cell.get().expect("deep not wired up yet");
                scope.get(deep)
            } else {
                0
            }
        }
    });

    let deep = domain.signal((&flag,), {
        let flag = flag.clone();
        move || if flag.get() { 100 } else { -100 }
    });
    deep_cell.set(deep).ok().expect("deep wired twice");

    assert_eq!(out.get(), 0);

    flag.set(true);
    assert_eq!(out.get(), 100);
    assert_eq!(out.times_ticked(), 1);
}

#[test]
fn dynamic_cycle_is_a_node_failure_not_a_poisoned_domain() {
    let domain = Domain::new(DomainConfig::default());
    let flag = domain.var(false);
    let succ_cell: Arc<OnceLock<Signal<i64>>> = Arc::new(OnceLock::new());

    // once flipped, the computation reads its own transitive successor
    let trap = domain.signal_dyn({
        let flag = flag.clone();
        let succ_cell = Arc::clone(&succ_cell);
        move |scope| {
            if scope.get(&flag) {
                let downstream =
                    succ_cell.get().expect("successor not wired up yet");
                scope.get(downstream)
            } else {
                0
            }
        }
    });
    let downstream = domain.signal((&trap,), {
        let trap = trap.clone();
        move || trap.get() + 1
    });
    succ_cell.set(downstream).ok().expect("successor wired twice");

    assert_eq!(trap.get(), 0);

    let result = domain.transact(|| flag.set(true));
    match result {
        Err(TurnError::Failed { report, .. }) => {
            assert_eq!(report.node_failures.len(), 1);
            assert_eq!(report.node_failures[0].node, trap.node_id());
        }
        other => panic!("expected a failed turn, got {other:?}"),
    }

    // the failed node kept its previous value, the edge was not created,
    // and the domain keeps accepting turns
    assert_eq!(trap.get(), 0);
    assert!(!domain.is_poisoned());
    flag.set(false);
    assert_eq!(domain.turn_count(), 2);
}

#[test]
fn dropped_branches_stop_scheduling_entirely() {
    let domain = Domain::new(DomainConfig::default());
    let selector = domain.var(0usize);
    let options = [domain.var(100), domain.var(200), domain.var(300)];

    let chosen = domain.signal_dyn({
        let selector = selector.clone();
        let options = options.clone();
        move |scope| {
            let index = scope.get(&selector).min(options.len() - 1);
            scope.get(&options[index])
        }
    });
    assert_eq!(chosen.get(), 100);

    selector.set(2);
    assert_eq!(chosen.get(), 300);
    let ticks = chosen.times_ticked();

    // the first two options are no longer inputs
    options[0].set(101);
    options[1].set(201);
    assert_eq!(chosen.times_ticked(), ticks);

    options[2].set(301);
    assert_eq!(chosen.get(), 301);
    assert_eq!(chosen.times_ticked(), ticks + 1);
}
