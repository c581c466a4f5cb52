#![no_main]

use libfuzzer_sys::fuzz_target;
use miniserver_protocol::core::response::LxResponse;

fuzz_target!(|data: &[u8]| {
    // The recovery pass indexes into the text by quote positions
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = LxResponse::parse(text);
    }
});
