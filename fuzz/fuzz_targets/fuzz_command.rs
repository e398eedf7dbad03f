//! Fuzz target for command decoding.
//!
//! Arbitrary frames must never panic, and anything that decodes must be
//! one of the tokens once trimmed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether::protocol::Command;

fuzz_target!(|data: &[u8]| {
    if let Ok(command) = Command::from_frame(data) {
        let text = std::str::from_utf8(data).expect("decoded frames are UTF-8");
        assert_eq!(text.trim(), command.token());
    }
});
