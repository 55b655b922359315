#![no_main]

use libfuzzer_sys::fuzz_target;
use sboxpipe::tag;

fuzz_target!(|data: &str| {
    let once = tag::sanitize(data);
    // Sanitization is idempotent and respects the length cap.
    assert_eq!(tag::sanitize(&once), once);
    assert!(once.chars().count() <= tag::TAG_MAX_CHARS);
    assert!(!once.chars().any(char::is_control));
});
