use dataflow_graph::prelude::*;
use dataflow_graph::{Domain, DomainConfig, EngineKind, Signal, Var};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

fn parallel_config() -> DomainConfig {
    DomainConfig::default()
        .with_engine(EngineKind::Parallel)
        .with_worker_count(4)
}

/// `out = costly1(in) + costly2(in)` with two independent branches.
fn two_branch_graph(domain: &Domain) -> (Var<i64>, Signal<i64>) {
    let input = domain.var(0i64);
    let left = domain.signal((&input,), {
        let input = input.clone();
        move || {
            let n = input.get();
            (0..64).fold(n, |acc, i| acc.wrapping_mul(31).wrapping_add(i))
        }
    });
    let right = domain.signal((&input,), {
        let input = input.clone();
        move || {
            let n = input.get();
            (0..64).fold(n, |acc, i| acc.wrapping_add(i).wrapping_mul(17))
        }
    });
    let out = domain.signal((&left, &right), {
        let (left, right) = (left.clone(), right.clone());
        move || left.get().wrapping_add(right.get())
    });
    (input, out)
}

#[test]
fn parallel_engine_matches_the_sequential_oracle() {
    let sequential = Domain::new(DomainConfig::default());
    let parallel = Domain::new(parallel_config());
    let (seq_in, seq_out) = two_branch_graph(&sequential);
    let (par_in, par_out) = two_branch_graph(&parallel);

    // a fixed pseudo-random input schedule, long enough to exercise the
    // pool across many turns
    let mut state = 0x2545f4914f6cdd1du64;
    for _ in 0..1000 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let value = (state % 1000) as i64;
        seq_in.set(value);
        par_in.set(value);
        assert_eq!(seq_out.get(), par_out.get());
    }
    assert_eq!(seq_out.times_ticked(), par_out.times_ticked());
}

#[test]
fn parallel_diamond_still_ticks_the_join_once() {
    let domain = Domain::new(parallel_config());
    let a = domain.var(0);
    let b = domain.signal((&a,), {
        let a = a.clone();
        move || a.get() + 1
    });
    let c = domain.signal((&a,), {
        let a = a.clone();
        move || a.get() + 2
    });
    let d = domain.signal((&b, &c), {
        let (b, c) = (b.clone(), c.clone());
        move || b.get() + c.get()
    });

    a.set(10);
    assert_eq!(d.get(), 23);
    assert_eq!(d.times_ticked(), 1);
}

#[test]
fn parallel_observers_keep_registration_order() {
    let domain = Domain::new(parallel_config());
    let v = domain.var(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tag in ["first", "second", "third"] {
        let derived = domain.signal((&v,), {
            let v = v.clone();
            move || v.get() + 1
        });
        handles.push(domain.observe(&derived, {
            let order = Arc::clone(&order);
            move |_: &i32| order.lock().unwrap().push(tag)
        }));
    }

    v.set(1);
    assert_eq!(&*order.lock().unwrap(), &["first", "second", "third"]);
}

#[test]
fn wide_fanout_converges_under_the_pool() {
    let domain = Domain::new(parallel_config());
    let input = domain.var(1i64);
    let branches: Vec<_> = (0..32)
        .map(|i| {
            domain.signal((&input,), {
                let input = input.clone();
                move || input.get() * (i + 1)
            })
        })
        .collect();
    let total = domain.signal(
        branches.iter().map(|b| b.dep_ref()).collect::<Vec<_>>(),
        {
            let branches = branches.clone();
            move || branches.iter().map(|b| b.get()).sum::<i64>()
        },
    );

    let expected: i64 = (1..=32).sum();
    assert_eq!(total.get(), expected);

    input.set(3);
    assert_eq!(total.get(), expected * 3);
    assert_eq!(total.times_ticked(), 1);
}

#[test]
fn relaxed_scheduling_matches_on_independent_branches() {
    let relaxed = Domain::new(parallel_config().with_relaxed_scheduling(true));
    let strict = Domain::new(parallel_config());
    let (relaxed_in, relaxed_out) = two_branch_graph(&relaxed);
    let (strict_in, strict_out) = two_branch_graph(&strict);

    for value in [5, -3, 900, 0, 77] {
        relaxed_in.set(value);
        strict_in.set(value);
        assert_eq!(relaxed_out.get(), strict_out.get());
    }
}

#[test]
fn parallel_merge_preserves_input_order() {
    let domain = Domain::new(parallel_config());
    let left = domain.event_source::<i32>();
    let right = domain.event_source::<i32>();
    let merged = domain.merge(&[&left, &right]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _obs = merged.stream().observe({
        let seen = Arc::clone(&seen);
        move |n: &i32| seen.lock().unwrap().push(*n)
    });

    domain
        .transact(|| {
            left.emit(1);
            right.emit(2);
            left.emit(3);
        })
        .unwrap();

    // input order first (all of left, then all of right)
    assert_eq!(&*seen.lock().unwrap(), &[1, 3, 2]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Sequential and parallel engines agree on final values and tick
    /// counts for arbitrary input schedules.
    #[test]
    fn engines_agree_on_random_schedules(
        values in proptest::collection::vec(-1000i64..1000, 1..40)
    ) {
        let sequential = Domain::new(DomainConfig::default());
        let parallel = Domain::new(parallel_config());
        let (seq_in, seq_out) = two_branch_graph(&sequential);
        let (par_in, par_out) = two_branch_graph(&parallel);

        for &value in &values {
            seq_in.set(value);
            par_in.set(value);
            prop_assert_eq!(seq_out.get(), par_out.get());
        }
        prop_assert_eq!(seq_out.times_ticked(), par_out.times_ticked());
    }
}
