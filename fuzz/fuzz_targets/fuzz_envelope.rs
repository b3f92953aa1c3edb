//! Fuzz target for mutation envelope parsing.
//!
//! Arbitrary bus payloads must parse or fail cleanly, and anything that
//! parses must serialize and parse again with the same routing fields.

#![no_main]

use entity_relay::envelope::MutationEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = std::str::from_utf8(data) else {
        return;
    };

    // Should never panic
    let Ok(envelope) = MutationEnvelope::from_json(payload) else {
        return;
    };

    assert!(!envelope.entity_type_name.is_empty());
    let json = envelope.to_json().expect("parsed envelope must serialize");
    let again = MutationEnvelope::from_json(&json).expect("serialized envelope must parse");
    assert_eq!(envelope.entity_type_name, again.entity_type_name);
    assert_eq!(envelope.kind, again.kind);
    assert_eq!(envelope.origin, again.origin);
});
