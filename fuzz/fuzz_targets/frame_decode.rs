#![no_main]

use libfuzzer_sys::fuzz_target;
use sboxpipe_agent::{decode_message, encode_frame, read_frame};

fuzz_target!(|data: &[u8]| {
    // Arbitrary streams never panic the frame reader.
    let mut cursor = std::io::Cursor::new(data.to_vec());
    if let Ok(payload) = read_frame(&mut cursor) {
        let _ = decode_message(&payload);
    }

    // And any cap-sized payload survives an encode/decode round trip.
    if data.len() <= sboxpipe_agent::MAX_FRAME_LEN as usize {
        let framed = encode_frame(data);
        let mut cursor = std::io::Cursor::new(framed);
        let decoded = read_frame(&mut cursor).expect("self-encoded frame must decode");
        assert_eq!(decoded, data);
    }
});
