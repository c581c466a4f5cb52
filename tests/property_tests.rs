//! Property-based tests using proptest
//!
//! Invariants of the codec, the response parser, the timeout estimator and the
//! AES padding rule over randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use miniserver_protocol::core::event::{decode_events, text_padding, text_record_len, Event};
use miniserver_protocol::core::header::{BinaryHeader, EventType};
use miniserver_protocol::core::response::LxResponse;
use miniserver_protocol::error::ProtocolError;
use miniserver_protocol::protocol::crypto::{aes_decrypt, aes_encrypt_base64, pad_hex_to_block};
use miniserver_protocol::utils::throughput::ThroughputEstimator;
use proptest::prelude::*;

const KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
const IV: &str = "000102030405060708090a0b0c0d0e0f";

fn text_record(uuid_byte: u8, text: &[u8]) -> Vec<u8> {
    let mut record = vec![uuid_byte; 16];
    record.extend_from_slice(&[0xee; 16]);
    record.extend_from_slice(&(text.len() as u32).to_le_bytes());
    record.extend_from_slice(text);
    record.extend(std::iter::repeat(0u8).take(text_padding(text.len())));
    record
}

// Property: text records are 4-byte aligned and consecutive records decode in order
proptest! {
    #[test]
    fn prop_text_event_padding(first in "[a-zA-Z0-9 ]{0,64}", second in "[a-zA-Z0-9 ]{0,64}") {
        let len = first.len();
        prop_assert_eq!(text_padding(len), (4 - len % 4) % 4);
        prop_assert_eq!(text_record_len(len) % 4, 0);
        prop_assert_eq!(text_record_len(len), 36 + len + text_padding(len));

        let mut payload = text_record(0x11, first.as_bytes());
        prop_assert_eq!(payload.len(), text_record_len(len));
        payload.extend(text_record(0x22, second.as_bytes()));

        let events = decode_events(EventType::EventText, &payload).expect("valid table");
        prop_assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (Event::Text(a), Event::Text(b)) => {
                prop_assert_eq!(&a.text, &first);
                prop_assert_eq!(&b.text, &second);
                prop_assert!(a.uuid.starts_with("11111111-1111-1111-"));
                prop_assert!(b.uuid.starts_with("22222222-2222-2222-"));
            }
            other => prop_assert!(false, "unexpected events {:?}", other),
        }
    }
}

// Property: header decoding never panics and only accepts exactly 8 bytes
proptest! {
    #[test]
    fn prop_header_decoding_is_total(bytes in prop::collection::vec(any::<u8>(), 0..32)) {
        match BinaryHeader::decode(&bytes) {
            Ok(header) => {
                prop_assert_eq!(bytes.len(), 8);
                let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                prop_assert_eq!(header.length, length);
                prop_assert_eq!(header.estimated, bytes[2] & 1 == 1);
            }
            Err(err) => {
                prop_assert_ne!(bytes.len(), 8);
                prop_assert_eq!(err, ProtocolError::MalformedHeader(bytes.len()));
            }
        }
    }
}

// Property: headers survive encoding with their type, length and estimate flag
proptest! {
    #[test]
    fn prop_header_encoding_keeps_fields(
        type_byte in 0u8..8,
        length in any::<u32>(),
        estimated in any::<bool>(),
    ) {
        let header = BinaryHeader::new(EventType::from_byte(type_byte), length, estimated);
        let decoded = BinaryHeader::decode(&header.encode()).unwrap();
        prop_assert_eq!(decoded, header);
    }
}

// Property: with a warm cache the timeout never shrinks for larger payloads
proptest! {
    #[test]
    fn prop_timeout_monotonic(
        avg_size in 100u64..100_000,
        speed in 1u32..10_000,
        a in 1u64..50_000_000,
        b in 1u64..50_000_000,
    ) {
        let mut estimator = ThroughputEstimator::new(false);
        for _ in 0..5 {
            estimator.add_sample(avg_size, f64::from(speed));
        }

        let (small, large) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(estimator.timeout_for_size(small) <= estimator.timeout_for_size(large));
    }
}

// Property: hex padding fills up to whole AES blocks with '0' only
proptest! {
    #[test]
    fn prop_hex_padding(hex in "[0-9a-f]{0,200}") {
        let padded = pad_hex_to_block(&hex);
        prop_assert_eq!(padded.len() % 32, 0);
        prop_assert!(padded.starts_with(&hex));
        prop_assert!(padded.len() - hex.len() < 32);
        prop_assert!(padded[hex.len()..].chars().all(|c| c == '0'));
    }
}

// Property: encrypted commands decrypt to the zero-padding-stripped plaintext
proptest! {
    #[test]
    fn prop_aes_zero_padding(plain in "[ -~]{1,120}") {
        let cipher = aes_encrypt_base64(&plain, KEY, IV).unwrap();
        prop_assert_eq!(aes_decrypt(&cipher, KEY, IV).unwrap(), plain);
    }
}

// Property: responses with raw control characters are recovered field by field
proptest! {
    #[test]
    fn prop_response_recovery(
        control in "[a-zA-Z0-9/._-]{1,30}",
        value in "[a-zA-Z0-9 \t\n._-]{0,30}",
        code in 100u16..1000,
    ) {
        let text = format!(
            "{{\"LL\": {{ \"control\": \"{control}\", \"value\": \"{value}\", \"Code\": \"{code}\"}}}}"
        );
        let response = LxResponse::parse(&text).expect("recoverable response");
        prop_assert_eq!(&response.control, &control);
        prop_assert_eq!(response.value_str(), Some(value.as_str()));
        prop_assert_eq!(response.code, code);
    }
}
