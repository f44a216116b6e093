#![no_main]

use std::collections::HashSet;

use libfuzzer_sys::fuzz_target;
use tau_slowmode::parse_slowmode_replay_fixture;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(fixture) = parse_slowmode_replay_fixture(&raw) {
        assert!(!fixture.name.trim().is_empty());
        assert!(!fixture.events.is_empty());
        let mut keys = HashSet::new();
        let mut previous = 0_u64;
        for step in &fixture.events {
            assert!(keys.insert(step.event.message_lock_key()));
            assert!(step.event.timestamp_ms >= previous);
            previous = step.event.timestamp_ms;
        }
    }
});
