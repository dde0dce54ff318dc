use dataflow_graph::prelude::*;
use dataflow_graph::{
    Domain, DomainConfig, MergePolicy, TurnError, TurnMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

#[test]
fn async_turns_commit_in_submission_order() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);

    let first = domain.do_transaction(TurnMode::Async, {
        let v = v.clone();
        move || v.set(1)
    });
    let second = domain.do_transaction(TurnMode::Async, {
        let v = v.clone();
        move || v.set(2)
    });

    let first_turn = first.wait().unwrap();
    let second_turn = second.wait().unwrap();
    assert!(first_turn < second_turn);

    domain.drain();
    assert_eq!(v.get(), 2);
}

#[test]
fn commit_handles_can_be_awaited() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let handle = domain.do_transaction(TurnMode::Async, {
        let v = v.clone();
        move || v.set(42)
    });
    futures::executor::block_on(handle.clone()).unwrap();
    assert!(handle.is_done());
    assert_eq!(v.get(), 42);
}

#[test]
fn queued_transactions_can_be_cancelled() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    // keep the driver busy so the next submission stays queued
    let blocker = domain.do_transaction(TurnMode::Async, move || {
        gate_rx.recv().unwrap();
    });
    let cancelled = domain.do_transaction(TurnMode::Async, {
        let v = v.clone();
        move || v.set(99)
    });

    assert!(cancelled.cancel());
    gate_tx.send(()).unwrap();
    blocker.wait().unwrap();
    domain.drain();

    assert!(matches!(cancelled.wait(), Err(TurnError::Cancelled)));
    assert_eq!(v.get(), 0);
}

#[test]
fn cancelling_a_committed_turn_is_refused() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let handle = domain.do_transaction(TurnMode::Sync, {
        let v = v.clone();
        move || v.set(1)
    });
    assert!(!handle.cancel());
    assert_eq!(handle.wait().unwrap().value(), 1);
}

#[test]
fn adjacent_merged_turns_coalesce() {
    let domain = Domain::new(
        DomainConfig::default().with_merge_policy(MergePolicy::Adjacent),
    );
    let a = domain.var(0);
    let b = domain.var(0);
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let blocker = domain.do_transaction(TurnMode::Async, move || {
        gate_rx.recv().unwrap();
    });
    let first = domain.do_transaction(TurnMode::Merged, {
        let a = a.clone();
        move || a.set(1)
    });
    let second = domain.do_transaction(TurnMode::Merged, {
        let b = b.clone();
        move || b.set(2)
    });

    gate_tx.send(()).unwrap();
    blocker.wait().unwrap();

    let first_turn = first.wait().unwrap();
    let second_turn = second.wait().unwrap();
    assert_eq!(first_turn, second_turn);
    assert_eq!((a.get(), b.get()), (1, 2));
}

#[test]
fn merged_turns_stay_separate_without_the_policy() {
    let domain = Domain::new(DomainConfig::default());
    let a = domain.var(0);
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let blocker = domain.do_transaction(TurnMode::Async, move || {
        gate_rx.recv().unwrap();
    });
    let first = domain.do_transaction(TurnMode::Merged, {
        let a = a.clone();
        move || a.set(1)
    });
    let second = domain.do_transaction(TurnMode::Merged, {
        let a = a.clone();
        move || a.set(2)
    });

    gate_tx.send(()).unwrap();
    blocker.wait().unwrap();

    assert!(first.wait().unwrap() < second.wait().unwrap());
    assert_eq!(a.get(), 2);
}

#[test]
fn observers_run_in_registration_order() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let _late_subject = {
        // register on a *derived* node first to show registration order,
        // not level order, decides the commit phase
        let derived = domain.signal((&v,), {
            let v = v.clone();
            move || v.get() + 1
        });
        let order = Arc::clone(&order);
        domain.observe(&derived, {
            let order = Arc::clone(&order);
            move |_: &i32| order.lock().unwrap().push("derived")
        })
    };
    let _direct = domain.observe(&v, {
        let order = Arc::clone(&order);
        move |_: &i32| order.lock().unwrap().push("direct")
    });

    v.set(1);
    assert_eq!(&*order.lock().unwrap(), &["derived", "direct"]);
}

#[test]
fn observers_can_enqueue_continuation_turns() {
    let domain = Domain::new(DomainConfig::default());
    let primary = domain.var(0);
    let echo = domain.var(0);

    let _obs = domain.observe(&primary, {
        let domain = domain.clone();
        let echo = echo.clone();
        move |value: &i32| {
            let echo = echo.clone();
            let value = *value;
            domain.do_transaction(TurnMode::Sync, move || echo.set(value));
        }
    });

    domain.transact(|| primary.set(7)).unwrap();
    // the continuation committed before transact returned
    assert_eq!(echo.get(), 7);
    assert_eq!(domain.turn_count(), 2);
}

#[test]
fn a_bare_set_inside_an_observer_becomes_a_continuation() {
    let domain = Domain::new(DomainConfig::default());
    let primary = domain.var(0);
    let shadow = domain.var(0);

    let _obs = domain.observe(&primary, {
        let shadow = shadow.clone();
        move |value: &i32| shadow.set(*value * 10)
    });

    primary.set(3);
    assert_eq!(shadow.get(), 30);
}

#[test]
fn observer_failures_are_isolated_and_reported() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let survivors = Arc::new(AtomicUsize::new(0));

    let _panicking = domain.observe(&v, |value: &i32| {
        if *value > 0 {
            panic!("observer exploded");
        }
    });
    let _surviving = domain.observe(&v, {
        let survivors = Arc::clone(&survivors);
        move |_: &i32| {
            survivors.fetch_add(1, Ordering::SeqCst);
        }
    });

    let result = domain.transact(|| v.set(1));
    match result {
        Err(TurnError::Failed { report, .. }) => {
            assert_eq!(report.observer_failures.len(), 1);
            assert!(report.observer_failures[0]
                .message
                .contains("observer exploded"));
            assert!(report.node_failures.is_empty());
        }
        other => panic!("expected observer failure, got {other:?}"),
    }
    assert_eq!(survivors.load(Ordering::SeqCst), 1);

    // later turns are unaffected (the observer no longer panics at 0)
    domain.transact(|| v.set(0)).unwrap();
    assert_eq!(survivors.load(Ordering::SeqCst), 2);
}

#[test]
fn node_failures_keep_the_previous_value_and_spare_siblings() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(1i64);
    let fragile = domain.signal((&v,), {
        let v = v.clone();
        move || {
            let value = v.get();
            if value == 13 {
                panic!("unlucky number");
            }
            value * 2
        }
    });
    let dependent = domain.signal((&fragile,), {
        let fragile = fragile.clone();
        move || fragile.get() + 1
    });
    let sibling = domain.signal((&v,), {
        let v = v.clone();
        move || v.get() + 100
    });

    let result = domain.transact(|| v.set(13));
    match result {
        Err(TurnError::Failed { report, .. }) => {
            assert_eq!(report.node_failures.len(), 1);
            assert_eq!(report.node_failures[0].node, fragile.node_id());
            assert!(report.node_failures[0].message.contains("unlucky"));
        }
        other => panic!("expected node failure, got {other:?}"),
    }

    // the failed node kept its value, so its dependent never ticked
    assert_eq!(fragile.get(), 2);
    assert_eq!(dependent.get(), 3);
    assert_eq!(dependent.times_ticked(), 0);
    // the unrelated branch committed normally
    assert_eq!(sibling.get(), 113);

    domain.transact(|| v.set(4)).unwrap();
    assert_eq!(fragile.get(), 8);
    assert_eq!(dependent.get(), 9);
}

#[test]
fn an_async_body_panic_is_reported_through_the_handle() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);

    let handle = domain.do_transaction(TurnMode::Async, {
        let v = v.clone();
        move || {
            v.set(5);
            panic!("body gave up");
        }
    });

    match handle.wait() {
        Err(TurnError::BodyPanicked { message }) => {
            assert!(message.contains("body gave up"));
        }
        other => panic!("expected a body panic, got {other:?}"),
    }
    // the half-staged input was discarded
    assert_eq!(v.get(), 0);
}

#[test]
fn turn_ids_are_strictly_increasing() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let mut last = 0;
    for n in 1..=5 {
        let turn = domain
            .do_transaction(TurnMode::Sync, {
                let v = v.clone();
                move || v.set(n)
            })
            .wait()
            .unwrap();
        assert!(turn.value() > last);
        last = turn.value();
    }
    assert_eq!(domain.turn_count(), 5);
}
