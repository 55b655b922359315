#![no_main]

use libfuzzer_sys::fuzz_target;
use sboxpipe::parse::tolerant_json;

fuzz_target!(|data: &str| {
    // Comment/trailing-comma stripping must not panic, and canonical JSON
    // must still parse after the cleanup pass.
    let _ = tolerant_json(data);
    if let Ok(canonical) = serde_json::from_str::<serde_json::Value>(data) {
        if !canonical.to_string().contains("_comment") {
            assert!(tolerant_json(&canonical.to_string()).is_ok());
        }
    }
});
