#![no_main]
use libfuzzer_sys::fuzz_target;
use seal_mc::models::Counters;
use seal_mc::{FrontierKind, Search, SearchConfig};

// Any search setting over the counters model explores the same state space.
fuzz_target!(|data: &[u8]| {
    let [threads, max, workers, flags, ..] = *data else {
        return;
    };
    let mut counters = Counters::new(threads as u32 % 3 + 1, max as u32 % 4);
    if flags & 1 != 0 {
        counters = counters.wrapping();
    }
    let frontier = match flags >> 1 & 3 {
        0 => FrontierKind::Stack,
        1 => FrontierKind::Queue,
        _ => FrontierKind::Shared,
    };
    let config = SearchConfig {
        workers: workers as usize % 4 + 1,
        frontier,
        max_time_secs: 2,
        ..SearchConfig::default()
    };
    let outcome = Search::new(&counters, config)
        .run(&counters.initial())
        .expect("search failed");
    if !outcome.verdict.is_incomplete() {
        assert_eq!(outcome.stats.states as u64, counters.state_count());
    }
});
