#![no_main]

use libfuzzer_sys::fuzz_target;
use miniserver_protocol::core::event::decode_events;
use miniserver_protocol::core::header::{BinaryHeader, EventType};

fuzz_target!(|data: &[u8]| {
    // Header and event table decoding must reject garbage without panicking
    if let Some((&type_byte, payload)) = data.split_first() {
        let _ = decode_events(EventType::from_byte(type_byte), payload);
    }
    let _ = BinaryHeader::decode(data);
});
