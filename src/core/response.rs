//! # Response Envelope
//!
//! Every text answer of the Miniserver is wrapped into an `LL` object:
//!
//! ```text
//! {"LL": {"control": "dev/sps/version", "value": "10.2.3.26", "Code": "200"}}
//! ```
//!
//! The code may be spelled `Code` or `code` and may be a string or a number.
//! Older firmware occasionally emits values that are not valid JSON (raw control
//! characters, unescaped text); for those a best-effort recovery pass extracts the
//! three fields by counting quotes. It only runs after regular parsing failed.

use crate::error::{constants, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response and close codes with a protocol meaning
pub mod codes {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const BLOCKED_TEMP: u16 = 403;
    pub const INVALID_TOKEN: u16 = 477;
    pub const OUT_OF_SERVICE: u16 = 503;

    /// Websocket close code sent when the client IP is temporarily blocked
    pub const WS_CLOSE_BLOCKED: u16 = 4003;
}

/// Number of quotes in a well-formed single-line response
const RECOVERABLE_QUOTE_COUNT: usize = 14;

/// Band a response code falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Proprietary,
    Unknown,
}

impl ResponseClass {
    pub fn of(code: u16) -> Self {
        match code {
            200..=299 => ResponseClass::Success,
            300..=399 => ResponseClass::Redirect,
            400..=499 => ResponseClass::ClientError,
            500..=599 => ResponseClass::ServerError,
            600..=999 => ResponseClass::Proprietary,
            _ => ResponseClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "LL")]
    ll: LxResponse,
}

/// Content of the `LL` object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LxResponse {
    #[serde(default)]
    pub control: String,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "Code", alias = "code", with = "code_serde")]
    pub code: u16,
    /// Seconds since the Miniserver epoch of the last password change, sent with 401s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix: Option<u64>,
}

impl LxResponse {
    pub fn new(control: impl Into<String>, value: Value, code: u16) -> Self {
        Self {
            control: control.into(),
            value,
            code,
            unix: None,
        }
    }

    /// Parse a response text, falling back to manual recovery
    pub fn parse(text: &str) -> Result<Self> {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => Ok(envelope.ll),
            Err(err) => recover(text).ok_or_else(|| {
                ProtocolError::ResponseParseFailed(format!(
                    "{err}; {}",
                    constants::ERR_RECOVERY_FAILED
                ))
            }),
        }
    }

    /// Serialise back into the wire envelope
    pub fn to_json(&self) -> String {
        serde_json::json!({ "LL": self }).to_string()
    }

    pub fn class(&self) -> ResponseClass {
        ResponseClass::of(self.code)
    }

    pub fn is_success(&self) -> bool {
        self.class() == ResponseClass::Success
    }

    /// Resolve 2xx responses, turn every other code into a `ServerError`
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProtocolError::ServerError {
                code: self.code,
                control: self.control,
                value: self.value,
                unix: self.unix,
            })
        }
    }

    /// The value as raw text, if it is a string
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// The value as structured JSON.
    ///
    /// String values carrying serialised JSON (with escaped quotes) are decoded.
    pub fn value_json(&self) -> Result<Value> {
        match &self.value {
            Value::String(raw) => {
                let unescaped = raw.replace("\\\"", "\"");
                serde_json::from_str(&unescaped).map_err(|e| {
                    ProtocolError::ResponseParseFailed(format!("value of {}: {e}", self.control))
                })
            }
            other => Ok(other.clone()),
        }
    }
}

/// Rest of `text` after its `n`-th quote
fn skip_quotes(text: &str, n: usize) -> Option<&str> {
    let mut rest = text;
    for _ in 0..n {
        let idx = rest.find('"')?;
        rest = &rest[idx + 1..];
    }
    Some(rest)
}

/// Text up to the next quote
fn until_quote(text: &str) -> Option<&str> {
    text.find('"').map(|idx| &text[..idx])
}

/// Extract control, value and code from a single-line response without a JSON parser.
///
/// Only attempted when the text contains exactly 14 quotes.
pub fn recover(text: &str) -> Option<LxResponse> {
    if text.matches('"').count() != RECOVERABLE_QUOTE_COUNT {
        return None;
    }

    let rest = skip_quotes(text, 5)?;
    let control = until_quote(rest)?;
    let rest = skip_quotes(rest, 4)?;
    let value = until_quote(rest)?;
    let rest = skip_quotes(rest, 4)?;
    let code = until_quote(rest)?.trim().parse::<u16>().ok()?;

    Some(LxResponse::new(
        control,
        Value::String(value.to_string()),
        code,
    ))
}

/// Seconds left on a temporary block, parsed from a close reason like
/// `"... blocked (120)"`: the text between the last `(` and the final character.
pub fn parse_blocked_remaining(reason: &str) -> Option<u32> {
    let start = reason.rfind('(')? + 1;
    let end = reason.len().checked_sub(1)?;
    reason.get(start..end)?.trim().parse().ok()
}

mod code_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(code: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&code.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let code = match &raw {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        code.ok_or_else(|| D::Error::custom(format!("invalid response code: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_code() {
        let res = LxResponse::parse(
            r#"{"LL":{"control":"dev/sps/version","value":"10.2.3.26","Code":"200"}}"#,
        )
        .unwrap();
        assert_eq!(res.control, "dev/sps/version");
        assert_eq!(res.value_str(), Some("10.2.3.26"));
        assert_eq!(res.code, 200);
        assert!(res.is_success());
    }

    #[test]
    fn test_parse_lowercase_numeric_code() {
        let res = LxResponse::parse(
            r#"{"LL":{"control":"jdev/sys/getkey2/admin","value":{"key":"AB","salt":"CD"},"code":200}}"#,
        )
        .unwrap();
        assert_eq!(res.code, 200);
        assert_eq!(res.value["salt"], "CD");
    }

    #[test]
    fn test_unix_field() {
        let res = LxResponse::parse(
            r#"{"LL":{"control":"authenticate","value":"","Code":"401","unix":1234}}"#,
        )
        .unwrap();
        assert_eq!(res.unix, Some(1234));
        assert_eq!(res.class(), ResponseClass::ClientError);
    }

    #[test]
    fn test_into_result() {
        let ok = LxResponse::new("x", Value::Null, 200);
        assert!(ok.into_result().is_ok());

        let redirect = LxResponse::new("x", Value::Null, 302);
        assert!(matches!(
            redirect.into_result(),
            Err(ProtocolError::ServerError { code: 302, .. })
        ));

        let err = LxResponse::new("jdev/sys/checktoken", Value::Null, 401)
            .into_result()
            .unwrap_err();
        assert!(err.is_server_rejection());
    }

    #[test]
    fn test_value_json_unescapes() {
        let res = LxResponse::new(
            "jdev/sys/gettoken",
            Value::String(r#"{\"token\":\"abc\",\"validUntil\":5}"#.into()),
            200,
        );
        let value = res.value_json().unwrap();
        assert_eq!(value["token"], "abc");
        assert_eq!(value["validUntil"], 5);
    }

    #[test]
    fn test_recovery_of_control_characters() {
        // raw tab inside the value breaks JSON parsing
        let text = "{\"LL\": { \"control\": \"dev/sps/listcmds\", \"value\": \"2014-10-09\tAlarm\", \"Code\": \"200\"}}";
        assert!(serde_json::from_str::<Value>(text).is_err());

        let res = LxResponse::parse(text).unwrap();
        assert_eq!(res.control, "dev/sps/listcmds");
        assert_eq!(res.value_str(), Some("2014-10-09\tAlarm"));
        assert_eq!(res.code, 200);
    }

    #[test]
    fn test_recovery_requires_fourteen_quotes() {
        let text = "{\"LL\": { \"control\": \"x\", \"value\": \"a\"b\", \"Code\": \"200\"}}";
        assert!(recover(text).is_none());
        assert!(matches!(
            LxResponse::parse(text),
            Err(ProtocolError::ResponseParseFailed(_))
        ));
    }

    #[test]
    fn test_blocked_remaining() {
        assert_eq!(
            parse_blocked_remaining("Too many failed attempts, blocked (120)"),
            Some(120)
        );
        assert_eq!(parse_blocked_remaining("blocked"), None);
        assert_eq!(parse_blocked_remaining(""), None);
    }

    #[test]
    fn test_response_classes() {
        assert_eq!(ResponseClass::of(204), ResponseClass::Success);
        assert_eq!(ResponseClass::of(307), ResponseClass::Redirect);
        assert_eq!(ResponseClass::of(503), ResponseClass::ServerError);
        assert_eq!(ResponseClass::of(901), ResponseClass::Proprietary);
        assert_eq!(ResponseClass::of(1200), ResponseClass::Unknown);
    }

    #[test]
    fn test_envelope_roundtrip_keeps_shape() {
        let res = LxResponse::new("jdev/sys/getkey", Value::String("ABCD".into()), 200);
        let json = res.to_json();
        assert!(json.contains("\"LL\""));
        assert_eq!(LxResponse::parse(&json).unwrap(), res);
    }
}
