//! Property tests for crash simulation.

use proptest::prelude::*;
use triphase_storage::{DurableStore, MemoryStore};

proptest! {
    #[test]
    fn crash_keeps_exactly_the_synced_prefix(
        writes in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..64), any::<bool>()), 0..32),
    ) {
        let mut store = MemoryStore::new();
        let disk = store.clone();
        let mut expected = Vec::new();
        let mut written = Vec::new();

        for (chunk, sync) in &writes {
            store.append(chunk).unwrap();
            written.extend_from_slice(chunk);
            if *sync {
                store.sync().unwrap();
                expected = written.clone();
            }
        }

        disk.simulate_crash();
        prop_assert_eq!(disk.len().unwrap(), expected.len() as u64);
        prop_assert_eq!(disk.bytes(), expected);
    }
}
