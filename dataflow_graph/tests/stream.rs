use dataflow_graph::prelude::*;
use dataflow_graph::{Domain, DomainConfig};
use std::sync::{Arc, Mutex};

#[test]
fn merged_streams_deliver_in_emission_order() {
    let domain = Domain::new(DomainConfig::default());
    let left = domain.event_source::<&'static str>();
    let right = domain.event_source::<&'static str>();
    let merged = domain.merge(&[&left, &right]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = merged.stream().observe({
        let seen = Arc::clone(&seen);
        move |event: &&str| seen.lock().unwrap().push(*event)
    });

    domain
        .transact(|| {
            left.emit("x");
            right.emit("y");
        })
        .unwrap();

    assert_eq!(&*seen.lock().unwrap(), &["x", "y"]);
    assert_eq!(merged.times_ticked(), 1);
}

#[test]
fn map_and_filter_compose() {
    let domain = Domain::new(DomainConfig::default());
    let numbers = domain.event_source::<i64>();
    let evens = domain.filter(&numbers, |n| n % 2 == 0);
    let squared = domain.map(&evens, |n| n * n);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = squared.observe({
        let seen = Arc::clone(&seen);
        move |n: &i64| seen.lock().unwrap().push(*n)
    });

    domain
        .transact(|| {
            for n in 1..=6 {
                numbers.emit(n);
            }
        })
        .unwrap();

    assert_eq!(&*seen.lock().unwrap(), &[4, 16, 36]);
}

#[test]
fn fold_accumulates_across_turns() {
    let domain = Domain::new(DomainConfig::default());
    let deposits = domain.event_source::<u64>();
    let balance = domain.fold(&deposits, 0u64, |sum, amount| sum + amount);

    deposits.emit(100);
    assert_eq!(balance.get(), 100);

    domain
        .transact(|| {
            deposits.emit(25);
            deposits.emit(75);
        })
        .unwrap();
    assert_eq!(balance.get(), 200);
    assert_eq!(balance.times_ticked(), 2);
}

#[test]
fn stream_builder_sugar_matches_domain_methods() {
    let domain = Domain::new(DomainConfig::default());
    let words = domain.event_source::<String>();
    let lengths = words
        .stream()
        .map(|w: &String| w.len())
        .filter(|len| *len > 3);
    let longest = lengths.fold(0usize, |max, len| max.max(*len));

    domain
        .transact(|| {
            words.emit("hi".to_owned());
            words.emit("hello".to_owned());
            words.emit("hey".to_owned());
            words.emit("world!".to_owned());
        })
        .unwrap();

    assert_eq!(longest.get(), 6);
}

#[test]
fn emitting_with_no_dependents_is_a_no_op() {
    let domain = Domain::new(DomainConfig::default());
    let orphan = domain.event_source::<i32>();

    orphan.emit(1);
    assert_eq!(domain.turn_count(), 1);
    assert_eq!(orphan.times_ticked(), 1);

    // the buffer was cleared at commit; a later dependent sees nothing
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = orphan.stream().observe({
        let seen = Arc::clone(&seen);
        move |n: &i32| seen.lock().unwrap().push(*n)
    });
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn filtered_out_turns_do_not_tick_dependents() {
    let domain = Domain::new(DomainConfig::default());
    let numbers = domain.event_source::<i64>();
    let positives = domain.filter(&numbers, |n| *n > 0);
    let count = domain.fold(&positives, 0usize, |n, _| n + 1);

    numbers.emit(-1);
    assert_eq!(count.times_ticked(), 0);
    assert_eq!(count.get(), 0);

    numbers.emit(5);
    assert_eq!(count.times_ticked(), 1);
    assert_eq!(count.get(), 1);
}

#[test]
fn merge_inputs_can_change_at_runtime() {
    let domain = Domain::new(DomainConfig::default());
    let a = domain.event_source::<i32>();
    let b = domain.event_source::<i32>();
    let merged = domain.merge(&[&a]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = merged.stream().observe({
        let seen = Arc::clone(&seen);
        move |n: &i32| seen.lock().unwrap().push(*n)
    });

    b.emit(1);
    assert!(seen.lock().unwrap().is_empty());

    merged.push_input(&b).unwrap();
    b.emit(2);
    assert_eq!(&*seen.lock().unwrap(), &[2]);

    merged.remove_input(&b).unwrap();
    b.emit(3);
    assert_eq!(&*seen.lock().unwrap(), &[2]);

    a.emit(4);
    assert_eq!(&*seen.lock().unwrap(), &[2, 4]);
}

#[test]
fn stream_events_are_delivered_to_folds_and_observers_alike() {
    let domain = Domain::new(DomainConfig::default());
    let source = domain.event_source::<i32>();
    let total = domain.fold(&source, 0i32, |sum, n| sum + n);

    let observed_total = Arc::new(Mutex::new(0));
    let _obs = domain.observe(&total, {
        let observed_total = Arc::clone(&observed_total);
        move |value: &i32| *observed_total.lock().unwrap() = *value
    });

    domain
        .transact(|| {
            source.emit(3);
            source.emit(4);
        })
        .unwrap();

    assert_eq!(total.get(), 7);
    assert_eq!(*observed_total.lock().unwrap(), 7);
}
