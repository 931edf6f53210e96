#![no_main]
use libfuzzer_sys::fuzz_target;
use seal_mc::{Canonicalizer, Configuration};

// Arbitrary bytes either fail to restore or restore to a configuration whose
// canonical form restores to itself.
fuzz_target!(|data: &[u8]| {
    if let Ok(cfg) = Configuration::restore(data) {
        let mut canon = Canonicalizer::new();
        let once = canon.payload(&cfg).to_vec();
        let again = Configuration::restore(&once).expect("canonical payload must restore");
        assert_eq!(canon.payload(&again), &once[..]);
    }
});
