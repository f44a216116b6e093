#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_slowmode::{parse_slowmode_inbound_event, SLOWMODE_EVENT_SCHEMA_VERSION};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(event) = parse_slowmode_inbound_event(&raw) {
        assert_eq!(event.schema_version, SLOWMODE_EVENT_SCHEMA_VERSION);
        assert!(!event.message_id.trim().is_empty());
        assert!(!event.author_id.trim().is_empty());
        let key = event.message_lock_key();
        assert!(key.as_str().starts_with("message:"));
        assert_eq!(key, event.message_lock_key());
    }
});
