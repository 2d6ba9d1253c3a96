//! Fuzz harness for traffic frame decoding.
//!
//! A successor master feeds `read_frame` with whatever its predecessor
//! wrote to standard input, so the decoder must survive arbitrary
//! bytes: truncated length prefixes, declared lengths past the frame
//! cap, and protobuf payloads that do not describe a frame.

#![no_main]

use gatehouse_core::traffic::read_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The decoder must never panic, regardless of input.
    // It should always return Ok or Err.
    let mut input = data;
    let _ = read_frame(&mut input);

    // A stream carries two frames back to back during a handoff, so a
    // successful first decode must leave the reader positioned for the
    // next one rather than consuming the remainder.
    let mut stream = data;
    if read_frame(&mut stream).is_ok() {
        let _ = read_frame(&mut stream);
    }
});
