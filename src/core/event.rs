//! # Binary Event Tables
//!
//! Decoders for the state-update payloads pushed by the Miniserver once the
//! connection is open. A payload is a table of back-to-back records, all
//! little endian, read until the buffer is exhausted.
//!
//! ## Record Layouts
//! ```text
//! EVENT      [uuid(16)] [value f64]                                   = 24 bytes
//! EVENTTEXT  [uuid(16)] [icon uuid(16)] [len u32] [text] [pad to 4]    = 36 + len + pad
//! DAYTIMER   [uuid(16)] [default f64] [count i32] count x 24 byte entries
//! WEATHER    [uuid(16)] [last update u32] [count i32] count x 68 byte entries
//! ```
//!
//! ## UUID Text Form
//! UUIDs are printed as `d1-d2-d3-d4` where `d1` is a u32, `d2`/`d3` are u16 (all read
//! little endian, printed as zero padded lower-case hex) and `d4` is the remaining
//! 8 raw bytes as one unbroken 16 digit run. Other components match on this exact
//! string, so it is not the RFC 4122 layout.

use crate::core::header::EventType;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::time;
use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tracing::debug;

/// Bytes of a UUID on the wire
pub const UUID_LEN: usize = 16;
/// Bytes of a value event record
pub const VALUE_EVENT_LEN: usize = 24;
/// Fixed prefix of a text event record (two UUIDs and the length field)
pub const TEXT_EVENT_PREFIX_LEN: usize = 36;
/// Bytes of a single daytimer entry
pub const DAYTIMER_ENTRY_LEN: usize = 24;
/// Bytes of a single weather entry
pub const WEATHER_ENTRY_LEN: usize = 68;

/// A decoded state update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Value(ValueEvent),
    Text(TextEvent),
    Daytimer(DaytimerEvent),
    Weather(WeatherEvent),
}

impl Event {
    pub fn uuid(&self) -> &str {
        match self {
            Event::Value(ev) => &ev.uuid,
            Event::Text(ev) => &ev.uuid,
            Event::Daytimer(ev) => &ev.uuid,
            Event::Weather(ev) => &ev.uuid,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Value(ev) => write!(f, "{} -> {}", ev.uuid, ev.value),
            Event::Text(ev) => write!(
                f,
                "{} -> icon=\"{}\" text=\"{}\"",
                ev.uuid, ev.icon_uuid, ev.text
            ),
            Event::Daytimer(ev) => write!(
                f,
                "{} -> defaultValue=\"{}\" entries={}",
                ev.uuid,
                ev.default_value,
                ev.entries.len()
            ),
            Event::Weather(ev) => write!(
                f,
                "{} -> lastUpdate=\"{}\" entries={}",
                ev.uuid,
                ev.last_update,
                ev.entries.len()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEvent {
    pub uuid: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEvent {
    pub uuid: String,
    pub icon_uuid: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaytimerEvent {
    pub uuid: String,
    pub default_value: f64,
    pub entries: Vec<DaytimerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaytimerEntry {
    pub mode: i32,
    /// Minutes since midnight
    pub from: i32,
    /// Minutes since midnight
    pub to: i32,
    pub need_activate: i32,
    pub value: f64,
    /// Position of the entry inside its event
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherEvent {
    pub uuid: String,
    /// Seconds since 2009-01-01 00:00:00 UTC
    pub last_update: u32,
    pub entries: Vec<WeatherEntry>,
}

impl WeatherEvent {
    /// Wall clock time of `last_update`
    pub fn last_update_time(&self) -> SystemTime {
        time::from_miniserver_seconds(u64::from(self.last_update))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherEntry {
    pub timestamp: i32,
    pub weather_type: i32,
    pub wind_direction: i32,
    pub solar_radiation: i32,
    pub relative_humidity: i32,
    pub temperature: f64,
    pub perceived_temperature: f64,
    pub dew_point: f64,
    pub precipitation: f64,
    pub wind_speed: f64,
    pub barometric_pressure: f64,
}

/// Padding that follows a text of `text_len` bytes inside a text event record
pub fn text_padding(text_len: usize) -> usize {
    (4 - text_len % 4) % 4
}

/// Total bytes one text event record occupies on the wire
pub fn text_record_len(text_len: usize) -> usize {
    TEXT_EVENT_PREFIX_LEN + text_len + text_padding(text_len)
}

/// Render 16 UUID bytes in the Miniserver's text form
pub fn format_uuid(bytes: &[u8; UUID_LEN]) -> String {
    let d1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let d2 = u16::from_le_bytes([bytes[4], bytes[5]]);
    let d3 = u16::from_le_bytes([bytes[6], bytes[7]]);
    format!("{d1:08x}-{d2:04x}-{d3:04x}-{}", hex::encode(&bytes[8..]))
}

/// Decode an event table of the given type
pub fn decode_events(event_type: EventType, payload: &[u8]) -> Result<Vec<Event>> {
    let mut buf = payload;
    match event_type {
        EventType::Event => read_value_events(&mut buf),
        EventType::EventText => read_text_events(&mut buf),
        EventType::Daytimer => read_daytimer_events(&mut buf),
        EventType::Weather => read_weather_events(&mut buf),
        other => Err(ProtocolError::MalformedPayload(format!(
            "{other} is not an event table"
        ))),
    }
}

/// Truncated tables fail like any other payload of the wrong length
fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        debug!(what, needed, left = buf.remaining(), "Event table truncated");
        return Err(ProtocolError::WrongPayloadLength {
            expected: u32::try_from(needed).unwrap_or(u32::MAX),
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn read_uuid(buf: &mut &[u8]) -> Result<String> {
    ensure(buf, UUID_LEN, constants::ERR_TRUNCATED_UUID)?;
    let mut raw = [0u8; UUID_LEN];
    buf.copy_to_slice(&mut raw);
    Ok(format_uuid(&raw))
}

fn read_count(buf: &mut &[u8]) -> Result<usize> {
    let count = buf.get_i32_le();
    usize::try_from(count)
        .map_err(|_| ProtocolError::MalformedPayload(constants::ERR_NEGATIVE_COUNT.into()))
}

fn read_value_events(buf: &mut &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::with_capacity(buf.len() / VALUE_EVENT_LEN);
    while buf.has_remaining() {
        ensure(buf, VALUE_EVENT_LEN, constants::ERR_TRUNCATED_RECORD)?;
        let uuid = read_uuid(buf)?;
        let value = buf.get_f64_le();
        events.push(Event::Value(ValueEvent { uuid, value }));
    }
    Ok(events)
}

fn read_text_events(buf: &mut &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    while buf.has_remaining() {
        ensure(buf, TEXT_EVENT_PREFIX_LEN, constants::ERR_TRUNCATED_RECORD)?;
        let uuid = read_uuid(buf)?;
        let icon_uuid = read_uuid(buf)?;
        let text_len = buf.get_u32_le() as usize;

        ensure(buf, text_len, "text")?;
        let text = String::from_utf8_lossy(&buf[..text_len]).into_owned();
        buf.advance(text_len);

        // the last record may end without its padding
        let padding = text_padding(text_len).min(buf.remaining());
        buf.advance(padding);

        events.push(Event::Text(TextEvent {
            uuid,
            icon_uuid,
            text,
        }));
    }
    Ok(events)
}

fn read_daytimer_events(buf: &mut &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    while buf.has_remaining() {
        ensure(buf, UUID_LEN + 12, constants::ERR_TRUNCATED_RECORD)?;
        let uuid = read_uuid(buf)?;
        let default_value = buf.get_f64_le();
        let count = read_count(buf)?;

        ensure(buf, count.saturating_mul(DAYTIMER_ENTRY_LEN), "daytimer entries")?;
        let entries = (0..count)
            .map(|index| DaytimerEntry {
                mode: buf.get_i32_le(),
                from: buf.get_i32_le(),
                to: buf.get_i32_le(),
                need_activate: buf.get_i32_le(),
                value: buf.get_f64_le(),
                index,
            })
            .collect();

        events.push(Event::Daytimer(DaytimerEvent {
            uuid,
            default_value,
            entries,
        }));
    }
    Ok(events)
}

fn read_weather_events(buf: &mut &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    while buf.has_remaining() {
        ensure(buf, UUID_LEN + 8, constants::ERR_TRUNCATED_RECORD)?;
        let uuid = read_uuid(buf)?;
        let last_update = buf.get_u32_le();
        let count = read_count(buf)?;

        ensure(buf, count.saturating_mul(WEATHER_ENTRY_LEN), "weather entries")?;
        let entries = (0..count)
            .map(|_| WeatherEntry {
                timestamp: buf.get_i32_le(),
                weather_type: buf.get_i32_le(),
                wind_direction: buf.get_i32_le(),
                solar_radiation: buf.get_i32_le(),
                relative_humidity: buf.get_i32_le(),
                temperature: buf.get_f64_le(),
                perceived_temperature: buf.get_f64_le(),
                dew_point: buf.get_f64_le(),
                precipitation: buf.get_f64_le(),
                wind_speed: buf.get_f64_le(),
                barometric_pressure: buf.get_f64_le(),
            })
            .collect();

        events.push(Event::Weather(WeatherEvent {
            uuid,
            last_update,
            entries,
        }));
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_BYTES: [u8; 16] = [
        0x78, 0x56, 0x34, 0x12, 0xBB, 0xAA, 0xDD, 0xCC, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
        0x08,
    ];

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            format_uuid(&UUID_BYTES),
            "12345678-aabb-ccdd-0102030405060708"
        );
    }

    #[test]
    fn test_uuid_zero_padding() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x0A;
        bytes[4] = 0x01;
        assert_eq!(
            format_uuid(&bytes),
            "0000000a-0001-0000-0000000000000000"
        );
    }

    #[test]
    fn test_value_events() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&UUID_BYTES);
        payload.extend_from_slice(&21.5f64.to_le_bytes());
        payload.extend_from_slice(&UUID_BYTES);
        payload.extend_from_slice(&(-1.0f64).to_le_bytes());

        let events = decode_events(EventType::Event, &payload).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Value(ev) => {
                assert_eq!(ev.uuid, "12345678-aabb-ccdd-0102030405060708");
                assert_eq!(ev.value, 21.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            events[1].to_string(),
            "12345678-aabb-ccdd-0102030405060708 -> -1"
        );
    }

    #[test]
    fn test_value_events_truncated() {
        let payload = [0u8; 30];
        assert!(matches!(
            decode_events(EventType::Event, &payload),
            Err(ProtocolError::WrongPayloadLength {
                expected: 24,
                actual: 6
            })
        ));
    }

    #[test]
    fn test_text_event_shorter_than_announced() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&UUID_BYTES);
        payload.extend_from_slice(&[0u8; 16]);
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(b"abc");

        assert_eq!(
            decode_events(EventType::EventText, &payload).unwrap_err(),
            ProtocolError::WrongPayloadLength {
                expected: 10,
                actual: 3
            }
        );
    }

    #[test]
    fn test_text_events_with_padding() {
        let mut payload = Vec::new();
        for text in ["Hello", "1234"] {
            payload.extend_from_slice(&UUID_BYTES);
            payload.extend_from_slice(&[0u8; 16]);
            payload.extend_from_slice(&(text.len() as u32).to_le_bytes());
            payload.extend_from_slice(text.as_bytes());
            payload.extend(std::iter::repeat(0u8).take(text_padding(text.len())));
        }
        assert_eq!(payload.len(), text_record_len(5) + text_record_len(4));

        let events = decode_events(EventType::EventText, &payload).unwrap();
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (Event::Text(a), Event::Text(b)) => {
                assert_eq!(a.text, "Hello");
                assert_eq!(a.icon_uuid, "00000000-0000-0000-0000000000000000");
                assert_eq!(b.text, "1234");
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_text_padding_rule() {
        assert_eq!(text_padding(0), 0);
        assert_eq!(text_padding(1), 3);
        assert_eq!(text_padding(2), 2);
        assert_eq!(text_padding(3), 1);
        assert_eq!(text_padding(4), 0);
        assert_eq!(text_record_len(5), 44);
    }

    #[test]
    fn test_daytimer_events() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&UUID_BYTES);
        payload.extend_from_slice(&5.0f64.to_le_bytes());
        payload.extend_from_slice(&2i32.to_le_bytes());
        for (mode, value) in [(1i32, 20.0f64), (2, 22.5)] {
            payload.extend_from_slice(&mode.to_le_bytes());
            payload.extend_from_slice(&360i32.to_le_bytes());
            payload.extend_from_slice(&720i32.to_le_bytes());
            payload.extend_from_slice(&0i32.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
        }

        let events = decode_events(EventType::Daytimer, &payload).unwrap();
        let Event::Daytimer(ev) = &events[0] else {
            panic!("expected daytimer event");
        };
        assert_eq!(ev.default_value, 5.0);
        assert_eq!(ev.entries.len(), 2);
        assert_eq!(ev.entries[1].index, 1);
        assert_eq!(ev.entries[1].mode, 2);
        assert_eq!(ev.entries[1].value, 22.5);
        assert_eq!(ev.entries[0].from, 360);
    }

    #[test]
    fn test_daytimer_negative_count_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&UUID_BYTES);
        payload.extend_from_slice(&0.0f64.to_le_bytes());
        payload.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(decode_events(EventType::Daytimer, &payload).is_err());
    }

    #[test]
    fn test_weather_events() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&UUID_BYTES);
        payload.extend_from_slice(&1000u32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        for int in [100i32, 3, 180, 500, 65] {
            payload.extend_from_slice(&int.to_le_bytes());
        }
        for float in [12.5f64, 11.0, 6.2, 0.4, 3.3, 1013.25] {
            payload.extend_from_slice(&float.to_le_bytes());
        }
        assert_eq!(payload.len(), 24 + WEATHER_ENTRY_LEN);

        let events = decode_events(EventType::Weather, &payload).unwrap();
        let Event::Weather(ev) = &events[0] else {
            panic!("expected weather event");
        };
        assert_eq!(ev.last_update, 1000);
        let entry = &ev.entries[0];
        assert_eq!(entry.relative_humidity, 65);
        assert_eq!(entry.wind_direction, 180);
        assert_eq!(entry.barometric_pressure, 1013.25);
        assert_eq!(entry.dew_point, 6.2);
    }

    #[test]
    fn test_non_table_type_rejected() {
        assert!(decode_events(EventType::File, &[]).is_err());
        assert_eq!(decode_events(EventType::Event, &[]).unwrap(), vec![]);
    }
}
