#![no_main]

use libfuzzer_sys::fuzz_target;
use sboxpipe::parse;

// Detection plus parse of arbitrary bytes must never panic.
fuzz_target!(|data: &[u8]| {
    let _ = parse::parse_auto(data);
});
