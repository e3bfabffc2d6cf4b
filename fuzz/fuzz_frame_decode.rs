//! Fuzz target for IPC frame splitting and request decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decode
//!
//! Treats the input as bytes arriving on the daemon socket: split as many
//! frames as possible and decode each body as a request.

#![no_main]

use fanguard_core::ipc::RequestFrame;
use fanguard_core::ipc::frame::{decode_body, split_frame};
use libfuzzer_sys::fuzz_target;

const MAX_FRAME: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((body, used))) = split_frame(rest, MAX_FRAME) {
        assert!(body.len() <= MAX_FRAME);
        let _ = decode_body::<RequestFrame>(body);
        rest = &rest[used..];
    }
});
