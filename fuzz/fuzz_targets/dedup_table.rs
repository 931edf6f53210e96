#![no_main]
use libfuzzer_sys::fuzz_target;
use seal_mc::table::HashSet;
use std::collections::BTreeSet;

// Pairs of bytes: a value and a (tiny) hash, so probe sequences collide a lot.
fuzz_target!(|data: &[u8]| {
    let mut table = HashSet::new(16);
    let mut model = BTreeSet::new();
    for pair in data.chunks_exact(2) {
        let value = pair[0] as u64;
        let hash = (pair[1] % 8) as u64 + 1 + value * 8;
        let (stored, fresh) = table
            .insert_or_find(hash, value, |&v| v == value)
            .expect("no ceiling configured");
        assert_eq!(stored, value);
        assert_eq!(fresh, model.insert(value));
    }
    assert_eq!(table.len(), model.len());
});
