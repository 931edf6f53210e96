//! Whole-search runs over the built-in models.

use seal_mc::models::{Counters, LinkedList, Ring};
use seal_mc::{
    search, Configuration, FrontierKind, Handle, Interpreter, Search, SearchConfig, Verdict,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const FRONTIERS: [FrontierKind; 3] = [FrontierKind::Stack, FrontierKind::Queue, FrontierKind::Shared];

fn config(workers: usize, frontier: FrontierKind) -> SearchConfig {
    SearchConfig {
        workers,
        frontier,
        ..Default::default()
    }
}

/// Distinct canonical payloads reached by a plain sequential BFS over the
/// interpreter, for cross-checking.
fn reference_states<I: Interpreter>(interp: &I, initial: &Configuration) -> usize {
    let mut canon = seal_mc::Canonicalizer::new();
    let mut seen = HashSet::new();
    let mut queue = std::collections::VecDeque::new();
    seen.insert(canon.payload(initial).to_vec());
    queue.push_back(initial.clone());
    let mut out = Vec::new();
    while let Some(state) = queue.pop_front() {
        out.clear();
        interp.successors(&state, &mut out).unwrap();
        for (next, _) in out.drain(..) {
            if seen.insert(canon.payload(&next).to_vec()) {
                queue.push_back(next);
            }
        }
    }
    seen.len()
}

#[test]
fn counters_agree_across_workers_and_frontiers() {
    let counters = Counters::new(3, 4);
    let expected = counters.state_count() as usize;
    for workers in [1, 2, 4] {
        for frontier in FRONTIERS {
            let outcome = Search::new(&counters, config(workers, frontier))
                .run(&counters.initial())
                .unwrap();
            assert_eq!(outcome.verdict, Verdict::Exhausted);
            assert_eq!(
                outcome.stats.states, expected,
                "workers={workers} frontier={frontier:?}"
            );
            // Every state has one transition per thread below the bound.
            assert_eq!(outcome.stats.transitions, 3 * 4 * 25);
            assert_eq!(outcome.stats.per_worker.len(), workers);
            assert_eq!(outcome.stats.per_worker.iter().sum::<usize>(), expected);
        }
    }
}

#[test]
fn linked_list_matches_sequential_reference() {
    let list = LinkedList::new(3, 2);
    let initial = list.initial().unwrap();
    let expected = reference_states(&list, &initial);
    assert!(expected > 50);
    for workers in [1, 2, 4] {
        for frontier in FRONTIERS {
            let outcome = Search::new(&list, config(workers, frontier))
                .run(&initial)
                .unwrap();
            assert_eq!(
                outcome.stats.states, expected,
                "workers={workers} frontier={frontier:?}"
            );
        }
    }
}

#[test]
fn every_state_reported_once() {
    let list = LinkedList::new(2, 2);
    let initial = list.initial().unwrap();
    let payloads = Mutex::new(Vec::new());
    let handles = Mutex::new(BTreeSet::new());
    let transitions = AtomicUsize::new(0);
    let outcome = search(
        &list,
        &initial,
        4,
        |t| {
            transitions.fetch_add(1, Ordering::Relaxed);
            assert!(t.from != t.to || !t.fresh);
        },
        |s| {
            payloads.lock().unwrap().push(s.payload.to_vec());
            assert!(handles.lock().unwrap().insert(s.handle));
        },
    )
    .unwrap();

    let mut payloads = payloads.into_inner().unwrap();
    let reported = payloads.len();
    payloads.sort();
    payloads.dedup();
    assert_eq!(payloads.len(), reported, "a state was reported twice");
    assert_eq!(reported, outcome.stats.states);
    assert_eq!(transitions.load(Ordering::Relaxed), outcome.stats.transitions);
}

#[test]
fn transitions_connect_reported_states() {
    let ring = Ring::new(6);
    let states: Mutex<BTreeSet<Handle>> = Mutex::new(BTreeSet::new());
    let edges: Mutex<Vec<(Handle, Handle)>> = Mutex::new(Vec::new());
    Search::new(&ring, config(2, FrontierKind::Queue))
        .on_new_state(|s| {
            states.lock().unwrap().insert(s.handle);
        })
        .on_transition(|t| edges.lock().unwrap().push((t.from, t.to)))
        .run(&ring.initial())
        .unwrap();
    let states = states.into_inner().unwrap();
    let edges = edges.into_inner().unwrap();
    assert_eq!(states.len(), 6);
    assert_eq!(edges.len(), 6);
    for (from, to) in edges {
        assert!(states.contains(&from));
        assert!(states.contains(&to));
    }
}

#[test]
fn accepting_ring_cycle_with_two_workers() {
    let ring = Ring::new(4).accepting(2);
    let cfg = SearchConfig {
        check_accepting_cycles: true,
        ..config(2, FrontierKind::Queue)
    };
    let outcome = Search::new(&ring, cfg).run(&ring.initial()).unwrap();
    assert_eq!(outcome.stats.states, 4);
    match outcome.verdict {
        Verdict::AcceptingCycle { state } => assert_eq!(Ring::value(&state), 2),
        other => panic!("expected an accepting cycle, got {other:?}"),
    }
}

#[test]
fn por_forces_the_accepting_state_of_a_reduced_ring() {
    // The ring's only step claims to be a proper ample set, so the whole
    // cycle is made of reduced transitions and one state must be forced.
    struct ReducedRing(Ring);
    impl Interpreter for ReducedRing {
        type Label = u32;
        fn successors(
            &self,
            state: &Configuration,
            out: &mut Vec<(Configuration, u32)>,
        ) -> Result<(), seal_mc::HeapError> {
            self.0.successors(state, out)
        }
        fn ample(
            &self,
            state: &Configuration,
            out: &mut Vec<(Configuration, u32)>,
        ) -> Result<bool, seal_mc::HeapError> {
            self.0.successors(state, out)?;
            Ok(true)
        }
        fn is_accepting(&self, state: &Configuration) -> bool {
            self.0.is_accepting(state)
        }
    }
    let model = ReducedRing(Ring::new(4).accepting(3));
    let cfg = SearchConfig {
        use_por: true,
        check_accepting_cycles: true,
        ..config(2, FrontierKind::Queue)
    };
    let outcome = Search::new(&model, cfg).run(&model.0.initial()).unwrap();
    assert_eq!(outcome.stats.states, 4);
    assert_eq!(outcome.stats.por_forced, 1);
    match outcome.verdict {
        Verdict::AcceptingCycle { state } => assert_eq!(Ring::value(&state), 3),
        other => panic!("expected an accepting cycle, got {other:?}"),
    }
}

#[test]
fn accepting_state_off_cycle_is_not_reported() {
    // Counters never wrap, so the graph is acyclic.
    struct AcceptAll(Counters);
    impl Interpreter for AcceptAll {
        type Label = u32;
        fn successors(
            &self,
            state: &Configuration,
            out: &mut Vec<(Configuration, u32)>,
        ) -> Result<(), seal_mc::HeapError> {
            self.0.successors(state, out)
        }
        fn is_accepting(&self, _state: &Configuration) -> bool {
            true
        }
    }
    let model = AcceptAll(Counters::new(2, 3));
    let cfg = SearchConfig {
        check_accepting_cycles: true,
        ..config(2, FrontierKind::Stack)
    };
    let outcome = Search::new(&model, cfg).run(&model.0.initial()).unwrap();
    assert_eq!(outcome.verdict, Verdict::Exhausted);
    assert_eq!(outcome.stats.states, 16);
}

#[test]
fn por_forces_full_expansion_on_wrapping_counters() {
    let counters = Counters::new(2, 3).wrapping();
    let full = Search::new(&counters, config(2, FrontierKind::Queue))
        .run(&counters.initial())
        .unwrap();
    assert_eq!(full.stats.states, 16);

    for workers in [1, 2, 4] {
        for frontier in FRONTIERS {
            let cfg = SearchConfig {
                use_por: true,
                ..config(workers, frontier)
            };
            let reduced = Search::new(&counters, cfg).run(&counters.initial()).unwrap();
            assert_eq!(reduced.verdict, Verdict::Exhausted);
            assert!(reduced.stats.por_forced >= 1);
            assert!(reduced.stats.states <= 16);
            assert!(
                reduced.stats.states > 4,
                "thread 1 was postponed forever (workers={workers} frontier={frontier:?})"
            );
        }
    }
}

#[test]
fn por_with_accepting_cycles_stays_sound() {
    // Thread 0's counter wraps, so every state lies on an ample-only cycle;
    // the accepting cycle must still be found after the proviso is applied.
    struct AcceptOnes(Counters);
    impl Interpreter for AcceptOnes {
        type Label = u32;
        fn successors(
            &self,
            state: &Configuration,
            out: &mut Vec<(Configuration, u32)>,
        ) -> Result<(), seal_mc::HeapError> {
            self.0.successors(state, out)
        }
        fn ample(
            &self,
            state: &Configuration,
            out: &mut Vec<(Configuration, u32)>,
        ) -> Result<bool, seal_mc::HeapError> {
            self.0.ample(state, out)
        }
        fn is_accepting(&self, state: &Configuration) -> bool {
            state.globals.read_u32(4) == 1
        }
    }
    let model = AcceptOnes(Counters::new(2, 2).wrapping());
    let cfg = SearchConfig {
        use_por: true,
        check_accepting_cycles: true,
        ..config(2, FrontierKind::Queue)
    };
    let outcome = Search::new(&model, cfg).run(&model.0.initial()).unwrap();
    match outcome.verdict {
        Verdict::AcceptingCycle { state } => assert_eq!(state.globals.read_u32(4), 1),
        other => panic!("expected an accepting cycle, got {other:?}"),
    }
}

#[test]
fn limits_and_progress() {
    let counters = Counters::new(3, 20);
    let progress = Arc::new(seal_mc::ProgressCounters::new());
    let cfg = SearchConfig {
        max_states: 100,
        progress: Some(Arc::clone(&progress)),
        ..config(2, FrontierKind::Queue)
    };
    let outcome = Search::new(&counters, cfg).run(&counters.initial()).unwrap();
    assert_eq!(outcome.verdict, Verdict::StateLimitReached);
    assert!(outcome.verdict.is_incomplete());
    assert!(!outcome.verdict.is_violation());
    assert!(progress.states.load(Ordering::Relaxed) >= 100);
}

#[test]
fn small_table_grows() {
    let counters = Counters::new(2, 30);
    let cfg = SearchConfig {
        table_capacity: 16,
        ..config(2, FrontierKind::Queue)
    };
    let outcome = Search::new(&counters, cfg).run(&counters.initial()).unwrap();
    assert_eq!(outcome.stats.states, 31 * 31);
    assert!(outcome.stats.table_growths > 0);
}

#[test]
fn table_ceiling_is_fatal() {
    let counters = Counters::new(2, 30);
    let cfg = SearchConfig {
        table_capacity: 16,
        max_table_slots: 64,
        ..config(1, FrontierKind::Queue)
    };
    let err = Search::new(&counters, cfg)
        .run(&counters.initial())
        .unwrap_err();
    assert!(err.is_exhaustion(), "unexpected error: {err}");
}
