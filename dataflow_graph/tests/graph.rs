use dataflow_graph::prelude::*;
use dataflow_graph::{Domain, DomainConfig, GraphError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

#[test]
fn attaching_a_transitive_successor_is_rejected() {
    let domain = Domain::new(DomainConfig::default());
    let source = domain.event_source::<i32>();
    let merged = domain.merge(&[&source]);
    let downstream = domain.map(&merged.stream(), |n| n * 2);

    // downstream is a transitive successor of the merge
    assert_eq!(
        merged.push_input(&downstream),
        Err(GraphError::WouldCycle)
    );

    // the graph is unchanged and later turns work
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = downstream.observe({
        let seen = Arc::clone(&seen);
        move |n: &i32| seen.lock().unwrap().push(*n)
    });
    source.emit(21);
    assert_eq!(&*seen.lock().unwrap(), &[42]);
}

#[test]
fn a_merge_cannot_consume_itself() {
    let domain = Domain::new(DomainConfig::default());
    let source = domain.event_source::<i32>();
    let merged = domain.merge(&[&source]);
    assert_eq!(
        merged.push_input(&merged.stream()),
        Err(GraphError::WouldCycle)
    );
}

#[test]
fn detaching_something_never_attached_fails() {
    let domain = Domain::new(DomainConfig::default());
    let a = domain.event_source::<i32>();
    let b = domain.event_source::<i32>();
    let merged = domain.merge(&[&a]);
    assert_eq!(merged.remove_input(&b), Err(GraphError::NotAnInput));
}

#[test]
fn edges_never_cross_domains() {
    let here = Domain::new(DomainConfig::default());
    let there = Domain::new(DomainConfig::default());

    let local = here.event_source::<i32>();
    let foreign = there.event_source::<i32>();
    let merged = here.merge(&[&local]);
    assert_eq!(merged.push_input(&foreign), Err(GraphError::CrossDomain));

    // constructors refuse foreign inputs outright
    let foreign_var = there.var(1);
    let result = catch_unwind(AssertUnwindSafe(|| {
        here.signal((&foreign_var,), {
            let foreign_var = foreign_var.clone();
            move || foreign_var.get() + 1
        })
    }));
    assert!(result.is_err());
}

#[test]
fn new_edges_lift_levels_past_their_inputs() {
    let domain = Domain::new(DomainConfig::default());
    let source = domain.event_source::<i32>();
    // a chain deepens the level of `tail`
    let tail = domain.map(&domain.map(&source, |n| n + 1), |n| n + 1);
    let merged = domain.merge(&[&source]);
    let after = domain.map(&merged.stream(), |n| *n);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = after.observe({
        let seen = Arc::clone(&seen);
        move |n: &i32| seen.lock().unwrap().push(*n)
    });

    // attaching the deeper `tail` lifts the merge (and everything after
    // it) above the whole chain
    merged.push_input(&tail).unwrap();
    source.emit(10);

    // one turn, one delivery of each branch, chain output included
    assert_eq!(&*seen.lock().unwrap(), &[10, 12]);
}

#[test]
fn intermediate_handles_can_be_dropped() {
    let domain = Domain::new(DomainConfig::default());
    let input = domain.var(1);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _obs = {
        let doubled = domain.signal((&input,), {
            let input = input.clone();
            move || input.get() * 2
        });
        let plus_one = domain.signal((&doubled,), {
            let doubled = doubled.clone();
            move || doubled.get() + 1
        });
        domain.observe(&plus_one, {
            let seen = Arc::clone(&seen);
            move |n: &i32| seen.lock().unwrap().push(*n)
        })
        // doubled and plus_one handles drop here; the chain stays alive
        // through the captured handles
    };

    input.set(5);
    assert_eq!(&*seen.lock().unwrap(), &[11]);
}

#[test]
fn dropping_an_observer_unregisters_it() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let obs = domain.observe(&v, {
        let seen = Arc::clone(&seen);
        move |n: &i32| seen.lock().unwrap().push(*n)
    });

    v.set(1);
    obs.unsubscribe();
    v.set(2);
    assert_eq!(&*seen.lock().unwrap(), &[1]);
}

#[test]
fn domains_are_independent() {
    let first = Domain::new(DomainConfig::default());
    let second = Domain::new(DomainConfig::default());

    let a = first.var(1);
    let b = second.var(10);
    let doubled_a = first.signal((&a,), {
        let a = a.clone();
        move || a.get() * 2
    });
    let doubled_b = second.signal((&b,), {
        let b = b.clone();
        move || b.get() * 2
    });

    a.set(2);
    assert_eq!(doubled_a.get(), 4);
    assert_eq!(doubled_b.get(), 20);
    assert_eq!(first.turn_count(), 1);
    assert_eq!(second.turn_count(), 0);
}

#[test]
fn a_healthy_domain_is_not_poisoned() {
    let domain = Domain::new(DomainConfig::default());
    let v = domain.var(0);
    for n in 0..10 {
        v.set(n);
    }
    assert!(!domain.is_poisoned());
}
