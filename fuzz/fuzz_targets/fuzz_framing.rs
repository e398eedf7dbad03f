//! Fuzz target for inbound framing.
//!
//! Feeds arbitrary bytes through each framing mode until the stream ends.
//! Decoding must terminate with `Closed` or another error, never panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether::{Connection, Framing};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Arbitrary)]
enum FuzzFraming {
    Raw,
    Line,
    LengthPrefixed,
}

#[derive(Debug, Arbitrary)]
struct Input {
    framing: FuzzFraming,
    bytes: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let framing = match input.framing {
        FuzzFraming::Raw => Framing::Raw,
        FuzzFraming::Line => Framing::Line,
        FuzzFraming::LengthPrefixed => Framing::LengthPrefixed,
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let (agent, mut controller) = tokio::io::duplex(input.bytes.len().max(1));
        controller.write_all(&input.bytes).await.expect("write");
        drop(controller);

        let mut conn = Connection::new(agent, framing);
        while conn.receive().await.is_ok() {}
    });
});
