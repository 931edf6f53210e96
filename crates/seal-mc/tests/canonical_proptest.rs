use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;
use seal_mc::table::HashSet;
use seal_mc::{Arena, Canonicalizer, Configuration, Layout, Object, Pointer};

/// Objects with two pointer slots and a tag, linked according to `edges`,
/// allocated in `order` after `junk` throwaway allocations.
fn build(edges: &[Vec<Option<usize>>], order: &[usize], junk: usize) -> Configuration {
    let n = edges.len();
    let mut cfg = Configuration::new(Object::with_pointers(8, &[0]).unwrap());
    for j in 0..junk {
        let p = cfg.heap.alloc(Object::new(4)).unwrap();
        if j % 2 == 0 {
            cfg.heap.free(p);
        }
    }
    let mut ptrs = vec![Pointer::NULL; n];
    for &i in order {
        let mut obj = Object::with_pointers(20, &[0, 8]).unwrap();
        obj.write_u32(16, i as u32);
        ptrs[i] = cfg.heap.alloc(obj).unwrap();
    }
    for (i, row) in edges.iter().enumerate() {
        for (k, target) in row.iter().enumerate() {
            if let Some(t) = target {
                cfg.heap
                    .get_mut(ptrs[i])
                    .unwrap()
                    .write_pointer(8 * k as u32, ptrs[*t]);
            }
        }
    }
    cfg.globals.write_pointer(0, ptrs[0]);
    cfg
}

fn graph() -> impl Strategy<Value = (Vec<Vec<Option<usize>>>, Vec<usize>, usize)> {
    (1usize..8).prop_flat_map(|n| {
        (
            vec(vec(option::of(0..n), 2), n),
            Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
            0usize..5,
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn canonical_form_ignores_allocation_order((edges, order, junk) in graph()) {
        let identity: Vec<usize> = (0..edges.len()).collect();
        let a = build(&edges, &identity, 0);
        let b = build(&edges, &order, junk);
        let mut canon = Canonicalizer::new();
        let pa = canon.payload(&a).to_vec();
        let pb = canon.payload(&b).to_vec();
        prop_assert_eq!(pa, pb);
    }

    #[test]
    fn restore_is_a_fixpoint((edges, order, junk) in graph()) {
        let cfg = build(&edges, &order, junk);
        let mut canon = Canonicalizer::new();
        let payload = canon.payload(&cfg).to_vec();
        let restored = Configuration::restore(&payload).unwrap();
        prop_assert_eq!(canon.payload(&restored).to_vec(), payload);
    }

    #[test]
    fn sealed_blocks_survive_transfer((edges, order, junk) in graph(), ext in 0usize..16) {
        let cfg = build(&edges, &order, junk);
        let layout = Layout::new(ext);
        let mut canon = Canonicalizer::new();
        let mut here = Arena::new();
        let mut there = Arena::new();
        let slot = canon.canonicalize(&cfg, layout, &mut here).unwrap();
        let expected = canon.payload(&cfg).to_vec();
        let size = seal_mc::block::size(here.get(slot));
        let moved = there.transfer_in(here.transfer_out(slot, size));
        prop_assert_eq!(layout.payload(there.get(moved)), &expected[..]);
        prop_assert_eq!(here.stats().live, 0);
    }

    #[test]
    fn arena_keeps_blocks_apart(sizes in vec(1usize..300, 1..64), drop_every in 2usize..5) {
        let mut arena = Arena::new();
        let mut live = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let slot = arena.allocate(size).unwrap();
            arena.get_mut(slot)[..size].fill(i as u8);
            live.push((slot, size, i as u8));
            if i % drop_every == 0 {
                let (slot, size, _) = live.remove(0);
                arena.release(slot, size);
            }
        }
        for &(slot, size, tag) in &live {
            prop_assert!(arena.get(slot)[..size].iter().all(|&b| b == tag));
        }
        prop_assert_eq!(arena.stats().live, live.len());
    }

    #[test]
    fn table_finds_everything_it_took(values in vec(0u64..2000, 1..400), buckets in 1u64..16) {
        // Few distinct hashes: long probe sequences and growth under collision.
        let hash = |v: u64| (v % buckets) + 1;
        let mut table = HashSet::new(16);
        let mut distinct = std::collections::BTreeSet::new();
        for &v in &values {
            let (stored, fresh) = table.insert_or_find(hash(v), v, |&o| o == v).unwrap();
            prop_assert_eq!(stored, v);
            prop_assert_eq!(fresh, distinct.insert(v));
        }
        prop_assert_eq!(table.len(), distinct.len());
        for &v in &distinct {
            prop_assert_eq!(table.find(hash(v), |&o| o == v), Some(v));
        }
    }
}
