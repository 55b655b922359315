#![no_main]

use libfuzzer_sys::fuzz_target;
use sboxpipe::parse::{Parser, UriListParser};

// Parsing arbitrary bytes must never panic; broken lines become record
// errors and every produced server satisfies the structural invariants.
fuzz_target!(|data: &[u8]| {
    if let Ok(outcome) = UriListParser.parse(data) {
        for server in &outcome.servers {
            assert!(server.is_valid());
            assert!(server.tag.is_none());
        }
    }
});
