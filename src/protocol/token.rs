//! Token records
//!
//! A [`TokenRecord`] is what the token manager stores per token string. It is built
//! from the value of a `gettoken`/`getjwt`/`authwithtoken` response and updated from
//! `refreshtoken` answers.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::permission::Permission;
use crate::utils::time;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Token related fields of a Miniserver response value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenResponse {
    pub token: Option<String>,
    /// One-time salt handed out together with a new token
    pub key: Option<String>,
    /// Seconds since 2009-01-01
    pub valid_until: Option<u64>,
    pub token_rights: Option<u32>,
    pub unsecure_pass: Option<bool>,
    pub seconds: Option<u64>,
}

impl TokenResponse {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// A token held by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub token: String,
    pub username: String,
    /// Permission the token was requested or confirmed for
    pub permission: Permission,
    /// Rights reported by the Miniserver
    pub rights: Permission,
    pub valid_until: Option<u64>,
    #[serde(default)]
    pub unsecure_pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
}

impl TokenRecord {
    /// Build a record; `permission` falls back to the reported token rights.
    ///
    /// Fails with `InvalidTokenObject` if token, permission or username are missing.
    pub fn from_response(
        response: TokenResponse,
        username: &str,
        permission: Option<Permission>,
    ) -> Result<Self> {
        let rights = response
            .token_rights
            .map(Permission::from_bits_retain)
            .unwrap_or_default();
        let permission = permission.filter(|p| !p.is_empty()).unwrap_or(rights);

        let record = Self {
            token: response.token.unwrap_or_default(),
            username: username.to_string(),
            permission,
            rights,
            valid_until: response.valid_until,
            unsecure_pass: response.unsecure_pass.unwrap_or(false),
            key: response.key,
            seconds: response.seconds,
        };
        record.validate()?;
        Ok(record)
    }

    /// Ensure the minimum set of attributes is present
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(ProtocolError::InvalidTokenObject(
                constants::ERR_TOKEN_MISSING_TOKEN.into(),
            ));
        }
        if self.permission.is_empty() {
            return Err(ProtocolError::InvalidTokenObject(
                constants::ERR_TOKEN_MISSING_PERMISSION.into(),
            ));
        }
        if self.username.is_empty() {
            return Err(ProtocolError::InvalidTokenObject(
                constants::ERR_TOKEN_MISSING_USERNAME.into(),
            ));
        }
        Ok(())
    }

    /// Record after a refresh: identity, permission and rights are kept unless the
    /// answer carries a new token string.
    pub fn refreshed(&self, response: TokenResponse) -> Self {
        Self {
            token: response
                .token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.token.clone()),
            username: self.username.clone(),
            permission: self.permission,
            rights: response
                .token_rights
                .map(Permission::from_bits_retain)
                .unwrap_or(self.rights),
            valid_until: response.valid_until,
            unsecure_pass: response.unsecure_pass.unwrap_or(false),
            key: response.key,
            seconds: response.seconds,
        }
    }

    /// Forget the lifetime attributes that a refresh will report again
    pub fn clear_lifetime(&mut self) {
        self.valid_until = None;
        self.unsecure_pass = false;
        self.seconds = None;
    }

    pub fn is_connection_token(&self) -> bool {
        self.permission.is_connection_permission()
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.valid_until.map(time::from_miniserver_seconds)
    }

    /// Time left before the token expires, `None` if unknown or already expired
    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.valid_until
            .filter(|secs| *secs > 0)
            .and_then(|secs| time::remaining_until(secs, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response() -> TokenResponse {
        TokenResponse::from_value(&json!({
            "token": "8E2AA590E996B321C0E17C3FA9F7A3C17BD376CC",
            "key": "3645344243394543",
            "validUntil": 342151839,
            "tokenRights": 4,
            "unsecurePass": true
        }))
        .unwrap()
    }

    #[test]
    fn test_from_response_uses_token_rights() {
        let record = TokenRecord::from_response(response(), "admin", None).unwrap();
        assert_eq!(record.permission, Permission::APP);
        assert_eq!(record.rights, Permission::APP);
        assert!(record.unsecure_pass);
        assert_eq!(record.valid_until, Some(342151839));
        assert!(record.is_connection_token());
    }

    #[test]
    fn test_explicit_permission_wins() {
        let record =
            TokenRecord::from_response(response(), "admin", Some(Permission::USER_EDIT)).unwrap();
        assert_eq!(record.permission, Permission::USER_EDIT);
        assert!(!record.is_connection_token());
    }

    #[test]
    fn test_missing_fields() {
        let mut missing_token = response();
        missing_token.token = None;
        assert_eq!(
            TokenRecord::from_response(missing_token, "admin", None),
            Err(ProtocolError::InvalidTokenObject("token".into()))
        );

        let mut missing_rights = response();
        missing_rights.token_rights = None;
        assert_eq!(
            TokenRecord::from_response(missing_rights, "admin", None),
            Err(ProtocolError::InvalidTokenObject("permission".into()))
        );

        assert_eq!(
            TokenRecord::from_response(response(), "", None),
            Err(ProtocolError::InvalidTokenObject("username".into()))
        );
    }

    #[test]
    fn test_refreshed_keeps_identity() {
        let record = TokenRecord::from_response(response(), "admin", None).unwrap();
        let refreshed = record.refreshed(TokenResponse {
            valid_until: Some(400_000_000),
            unsecure_pass: Some(false),
            ..Default::default()
        });
        assert_eq!(refreshed.token, record.token);
        assert_eq!(refreshed.username, "admin");
        assert_eq!(refreshed.permission, Permission::APP);
        assert_eq!(refreshed.valid_until, Some(400_000_000));
        assert!(!refreshed.unsecure_pass);

        let replaced = record.refreshed(TokenResponse {
            token: Some("NEW".into()),
            ..Default::default()
        });
        assert_eq!(replaced.token, "NEW");
    }

    #[test]
    fn test_remaining() {
        let record = TokenRecord::from_response(response(), "admin", None).unwrap();
        let now = time::from_miniserver_seconds(342151839 - 100);
        assert_eq!(record.remaining(now), Some(Duration::from_secs(100)));
        let later = time::from_miniserver_seconds(342151839 + 1);
        assert_eq!(record.remaining(later), None);
    }

    #[test]
    fn test_serde_shape() {
        let record = TokenRecord::from_response(response(), "admin", None).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["username"], "admin");
        assert_eq!(json["validUntil"], 342151839);
        let back: TokenRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
