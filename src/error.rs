//! # Error Types
//!
//! Error handling for the Miniserver protocol engine.
//!
//! Every fallible operation in this crate returns [`ProtocolError`]. The enum is `Clone`
//! because a single close reason has to be delivered to every request that was still
//! waiting on the connection when it went down.
//!
//! ## Error Categories
//! - **Codec Errors**: malformed headers, truncated payloads, wrong payload lengths
//! - **Response Errors**: unparseable or non-2xx `LL` responses
//! - **Cryptographic Errors**: key exchange and AES/RSA failures
//! - **Connection Errors**: timeouts, closes, blocked clients, missing encryption
//! - **Authentication Errors**: invalid tokens, wrong passwords
//!
//! ## Example Usage
//! ```rust
//! use miniserver_protocol::error::{ProtocolError, Result};
//! use miniserver_protocol::core::header::BinaryHeader;
//!
//! fn payload_len(bytes: &[u8]) -> Result<u32> {
//!     let header = BinaryHeader::decode(bytes)?;
//!     Ok(header.length)
//! }
//!
//! assert!(matches!(payload_len(&[0u8; 3]), Err(ProtocolError::MalformedHeader(3))));
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_TRUNCATED_UUID: &str = "Payload ended inside a UUID";
    pub const ERR_TRUNCATED_RECORD: &str = "Payload ended inside an event record";
    pub const ERR_NEGATIVE_COUNT: &str = "Negative entry count in event record";

    /// Response errors
    pub const ERR_MISSING_LL: &str = "Response has no LL object";
    pub const ERR_RECOVERY_FAILED: &str = "Response could not be recovered manually";

    /// Crypto errors
    pub const ERR_INVALID_HEX_KEY: &str = "Session key or IV is not valid hex";
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Public key is not a valid RSA key";
    pub const ERR_INVALID_SALT: &str = "One-time salt is not valid hex";
    pub const ERR_RSA_ENCRYPT: &str = "RSA encryption failed";

    /// Token errors
    pub const ERR_TOKEN_MISSING_TOKEN: &str = "token";
    pub const ERR_TOKEN_MISSING_PERMISSION: &str = "permission";
    pub const ERR_TOKEN_MISSING_USERNAME: &str = "username";

    /// Time errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";

    /// Connection errors
    pub const ERR_DRIVER_GONE: &str = "Connection driver is no longer running";
    pub const ERR_NOT_CONNECTED: &str = "No connection has been opened";
}

/// Primary error type for all protocol operations
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("Malformed binary header: expected 8 bytes, got {0}")]
    MalformedHeader(usize),

    #[error("Malformed event payload: {0}")]
    MalformedPayload(String),

    #[error("Received payload of {actual} bytes, header announced {expected}")]
    WrongPayloadLength { expected: u32, actual: usize },

    #[error("Received binary payload without header")]
    MissingHeader,

    #[error("Parsing the response failed: {0}")]
    ResponseParseFailed(String),

    #[error("Decrypting the response failed")]
    DecryptionFailed,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    #[error("Encryption required but the connection is not secured")]
    NotSecured,

    #[error("Connection is not ready for this command")]
    NotReady,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Client temporarily blocked by the Miniserver (remaining: {remaining_seconds:?}s)")]
    TemporarilyBlocked { remaining_seconds: Option<u32> },

    #[error("Token is invalid")]
    InvalidToken,

    #[error("Wrong password (last change: {last_password_change})")]
    WrongPassword { last_password_change: u64 },

    #[error("Socket failed")]
    SocketFailed,

    #[error("Server responded with code {code} to '{control}'")]
    ServerError {
        code: u16,
        control: String,
        value: serde_json::Value,
        /// Last password change reported with a 401
        unix: Option<u64>,
    },

    #[error("Token object is missing its {0}")]
    InvalidTokenObject(String),

    #[error("No token stored for the requested permission")]
    NoToken,

    #[error("Miniserver is out of service")]
    OutOfService,

    #[error("Connection closed manually")]
    ManualClose,

    #[error("Connection closed (code: {code:?}, reason: {reason})")]
    ConnectionClosed { code: Option<u16>, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection is not a download connection")]
    NotDownloadConnection,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True if the Miniserver itself answered and refused the request.
    ///
    /// Connectivity problems (timeouts, closes, transport errors) return `false`;
    /// the token manager only discards tokens on a definite rejection.
    pub fn is_server_rejection(&self) -> bool {
        matches!(self, ProtocolError::ServerError { .. })
    }

    /// Response code carried by a server rejection.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            ProtocolError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Stable numeric support code for host-side logging.
    pub fn support_code(&self) -> u16 {
        match self {
            ProtocolError::ResponseParseFailed(_) | ProtocolError::Json(_) => 1000,
            ProtocolError::DecryptionFailed => 1001,
            ProtocolError::NotReady => 2000,
            ProtocolError::Transport(_) | ProtocolError::SocketFailed => 2001,
            ProtocolError::ConnectionClosed { .. } => 2002,
            ProtocolError::ManualClose => 2003,
            ProtocolError::Timeout => 2004,
            ProtocolError::MissingHeader => 2005,
            ProtocolError::WrongPayloadLength { .. } => 2006,
            ProtocolError::NotSecured => 2007,
            ProtocolError::OutOfService => 2008,
            ProtocolError::ServerError { code, .. } => *code,
            ProtocolError::TemporarilyBlocked { .. } => 403,
            ProtocolError::InvalidToken => 477,
            ProtocolError::WrongPassword { .. } => 401,
            _ => 0,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_rejection_detection() {
        let rejected = ProtocolError::ServerError {
            code: 401,
            control: "jdev/sys/refreshtoken".into(),
            value: serde_json::Value::Null,
            unix: None,
        };
        assert!(rejected.is_server_rejection());
        assert_eq!(rejected.response_code(), Some(401));

        assert!(!ProtocolError::Timeout.is_server_rejection());
        assert!(!ProtocolError::ManualClose.is_server_rejection());
        assert_eq!(ProtocolError::Timeout.response_code(), None);
    }

    #[test]
    fn test_support_codes() {
        assert_eq!(ProtocolError::NotSecured.support_code(), 2007);
        assert_eq!(ProtocolError::OutOfService.support_code(), 2008);
        assert_eq!(ProtocolError::MissingHeader.support_code(), 2005);
        assert_eq!(
            ProtocolError::WrongPayloadLength {
                expected: 4,
                actual: 2
            }
            .support_code(),
            2006
        );
        assert_eq!(ProtocolError::InvalidToken.support_code(), 477);
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: ProtocolError = err.into();
        assert!(matches!(converted, ProtocolError::Json(_)));
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::WrongPassword {
            last_password_change: 42,
        };
        assert_eq!(err.to_string(), "Wrong password (last change: 42)");
        assert_eq!(
            ProtocolError::MalformedHeader(5).to_string(),
            "Malformed binary header: expected 8 bytes, got 5"
        );
    }
}
