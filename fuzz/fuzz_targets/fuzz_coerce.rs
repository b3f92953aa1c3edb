//! Fuzz target for scalar coercion and loose equality.

#![no_main]

use entity_relay::codec::{coerce, loosely_equal};
use entity_relay::entity::ScalarType;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

const TYPES: [ScalarType; 6] = [
    ScalarType::Any,
    ScalarType::Integer,
    ScalarType::Float,
    ScalarType::Text,
    ScalarType::Bool,
    ScalarType::Uuid,
];

fuzz_target!(|data: (u8, &str, &str)| {
    let (ty, a, b) = data;
    let ty = TYPES[ty as usize % TYPES.len()];

    let value = serde_json::from_str::<Value>(a).unwrap_or_else(|_| Value::from(a));
    let once = coerce(value, ty);
    // Idempotent
    assert_eq!(coerce(once.clone(), ty), once);

    let other = serde_json::from_str::<Value>(b).unwrap_or_else(|_| Value::from(b));
    assert_eq!(loosely_equal(&once, &other), loosely_equal(&other, &once));
});
