//! Machine-readable CLI output.
//!
//! With `--json`, every command prints exactly one root object: the data
//! itself, with `_meta` (elapsed ms, envelope version) merged in, and an
//! `error` member on failure. Never a decorated wrapper around the data.

use std::time::Instant;

use serde_json::{Value, json};

use crate::errors::GtError;

/// Envelope version, bumped when the shape changes.
pub const ENVELOPE_VERSION: u32 = 1;

/// Merge `_meta` into a data object and render it. Non-object data is
/// rooted under `data` so the envelope stays an object.
pub fn success_envelope(data: Value, started: Instant) -> Value {
    let mut root = match data {
        Value::Object(map) => Value::Object(map),
        other => json!({ "data": other }),
    };
    if let Value::Object(map) = &mut root {
        map.insert(
            "_meta".to_string(),
            json!({
                "ms": started.elapsed().as_millis() as u64,
                "v": ENVELOPE_VERSION,
            }),
        );
    }
    root
}

/// Failure envelope: the error object plus `_meta`.
pub fn error_envelope(err: &GtError, started: Instant) -> Value {
    json!({
        "error": {
            "code": err.code(),
            "msg": err.to_string(),
            "hint": err.hints(),
            "exit": err.exit_code(),
        },
        "_meta": {
            "ms": started.elapsed().as_millis() as u64,
            "v": ENVELOPE_VERSION,
        },
    })
}

/// Print either the JSON envelope or the human line.
pub fn emit(json_mode: bool, data: Value, human: &str, started: Instant) {
    if json_mode {
        println!("{}", success_envelope(data, started));
    } else if !human.is_empty() {
        println!("{human}");
    }
}
