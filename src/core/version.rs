//! Miniserver firmware versions and the protocol features they unlock.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Protocol capabilities tied to a minimum firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Token based authentication and the key exchange
    Tokens,
    /// Encrypted commands and encrypted responses on the socket
    EncryptedConnectionFully,
    /// `checktoken` exists and refresh may hand out a new token string
    TokenRefreshAndCheck,
    /// JSON web tokens via `getjwt` / `refreshjwt`
    JwtSupport,
    /// SHA-256 hashing for HMACs and password hashes
    Sha256,
}

impl Feature {
    /// First firmware version supporting the feature
    pub fn required_version(self) -> ServerVersion {
        let parts: &[u32] = match self {
            Feature::Tokens => &[9, 0, 7, 25],
            Feature::EncryptedConnectionFully => &[8, 1, 10, 14],
            Feature::TokenRefreshAndCheck => &[10, 0, 9, 13],
            Feature::JwtSupport => &[10, 1, 12, 5],
            Feature::Sha256 => &[10, 4, 0, 0],
        };
        ServerVersion(parts.to_vec())
    }
}

/// Dotted firmware version, compared numerically part by part
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerVersion(Vec<u32>);

impl ServerVersion {
    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    /// True if this version is at least the one the feature requires
    pub fn supports(&self, feature: Feature) -> bool {
        self.at_least(&feature.required_version())
    }

    /// Compare over the common prefix; a version is never rejected for having fewer parts.
    pub fn at_least(&self, required: &ServerVersion) -> bool {
        for (current, needed) in self.0.iter().zip(required.0.iter()) {
            match current.cmp(needed) {
                Ordering::Greater => return true,
                Ordering::Less => return false,
                Ordering::Equal => continue,
            }
        }
        true
    }
}

impl FromStr for ServerVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .trim()
            .split('.')
            .map(|part| part.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid version '{s}': {e}")))?;
        if parts.is_empty() {
            return Err(ProtocolError::ConfigError(format!("Invalid version '{s}'")));
        }
        Ok(Self(parts))
    }
}

impl TryFrom<String> for ServerVersion {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServerVersion> for String {
    fn from(version: ServerVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Capability lookup for a possibly unknown server version.
///
/// Without a version every feature is reported as unsupported.
pub fn supports(version: Option<&ServerVersion>, feature: Feature) -> bool {
    version.map(|v| v.supports(feature)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ServerVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(v("10.4.0.0").parts(), &[10, 4, 0, 0]);
        assert_eq!(v("9.0.7.25").to_string(), "9.0.7.25");
        assert!("10.a.1".parse::<ServerVersion>().is_err());
        assert!("".parse::<ServerVersion>().is_err());
    }

    #[test]
    fn test_feature_support() {
        assert!(v("10.4.0.0").supports(Feature::Sha256));
        assert!(!v("10.3.11.10").supports(Feature::Sha256));
        assert!(v("9.0.7.25").supports(Feature::Tokens));
        assert!(!v("9.0.7.24").supports(Feature::Tokens));
        assert!(v("11.0.0.0").supports(Feature::JwtSupport));
        assert!(v("8.1.10.14").supports(Feature::EncryptedConnectionFully));
        assert!(!v("8.0.99.99").supports(Feature::EncryptedConnectionFully));
    }

    #[test]
    fn test_numeric_not_lexical() {
        assert!(v("10.0.0.0").at_least(&v("9.9.9.9")));
        assert!(!v("9.10.0.0").at_least(&v("10.0.0.0")));
        assert!(v("9.10.0.0").at_least(&v("9.9.0.0")));
    }

    #[test]
    fn test_unknown_version() {
        assert!(!supports(None, Feature::Tokens));
        assert!(supports(Some(&v("12.0.0.0")), Feature::Tokens));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("10.2.3.26")).unwrap();
        assert_eq!(json, "\"10.2.3.26\"");
        let back: ServerVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("10.2.3.26"));
    }
}
