#![no_main]

use libfuzzer_sys::fuzz_target;
use wa_transport::core::{marshal, unmarshal};

fuzz_target!(|data: &[u8]| {
    // Decoding must never panic; anything it accepts must encode back
    if let Ok(node) = unmarshal(data) {
        let _ = marshal(&node);
    }
});
