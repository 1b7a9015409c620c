//! Fuzz test for the connection state machine
//!
//! Feeds arbitrary event sequences through `transition` and checks that the
//! state only moves along legal edges and rejected events leave it alone.
//!
//! Run with: cargo +nightly fuzz run transition_fuzz -- -max_total_time=60

#![no_main]

use juris_core::{transition, ConnectionEvent, ConnectionState};
use libfuzzer_sys::fuzz_target;

fn legal(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            | (Connected, Disconnecting)
            | (Disconnecting, Disconnected)
    )
}

fuzz_target!(|data: &[u8]| {
    let mut state = ConnectionState::Disconnected;
    for byte in data {
        let event = ConnectionEvent::ALL[*byte as usize % ConnectionEvent::ALL.len()];
        match transition(state, event) {
            Ok(next) => {
                assert!(legal(state, next), "illegal edge {state:?} -> {next:?} on {event:?}");
                state = next;
            }
            Err(rejected) => assert_eq!(rejected.from, state),
        }
    }
});
