//! Command templates understood by the Miniserver.
//!
//! Builders return ready-to-send command strings. Values that may contain
//! reserved characters (ciphertexts, device info) are URI-component encoded.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// Request a one-time salt
pub const GET_KEY: &str = "jdev/sys/getkey";
/// Request API information (version, https status); used for host resolution
pub const GET_API_KEY: &str = "jdev/cfg/apiKey";
/// Request the RSA public key of the Miniserver
pub const GET_PUBLIC_KEY: &str = "jdev/sys/getPublicKey";
/// Connection keepalive
pub const KEEPALIVE: &str = "keepalive";

const AUTHENTICATE_PREFIX: &str = "authenticate/";
const AUTHENTICATE_ENC_PREFIX: &str = "authenticateEnc/";
const KEY_EXCHANGE_PREFIX: &str = "jdev/sys/keyexchange/";
const GET_USER_SALT_PREFIX: &str = "jdev/sys/getkey2/";
const GET_TOKEN_PREFIX: &str = "jdev/sys/gettoken/";
const GET_JWT_PREFIX: &str = "jdev/sys/getjwt/";
const AUTH_WITH_TOKEN_PREFIX: &str = "authwithtoken/";

/// Commands whose payload the Miniserver refuses to handle encrypted
const UNENCRYPTABLE_FRAGMENTS: [&str; 6] = [
    "data/loxapp3.json",
    "statistics.json",
    "binstatisticdata",
    ".png",
    ".svg",
    "camimage",
];

/// Characters left untouched by `encodeURIComponent`
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// How a command and its response are protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptionMode {
    /// Sent in plain text
    #[default]
    None,
    /// Command is AES encrypted (`jdev/sys/enc/`)
    Request,
    /// Command and response are AES encrypted (`jdev/sys/fenc/`)
    RequestAndResponse,
}

impl EncryptionMode {
    pub fn encrypts_request(self) -> bool {
        !matches!(self, EncryptionMode::None)
    }

    pub fn encrypts_response(self) -> bool {
        matches!(self, EncryptionMode::RequestAndResponse)
    }
}

/// Percent-encode a value the way `encodeURIComponent` does
pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

pub fn authenticate(hash: &str) -> String {
    format!("{AUTHENTICATE_PREFIX}{hash}")
}

pub fn authenticate_encrypted(cipher_base64: &str) -> String {
    format!("{AUTHENTICATE_ENC_PREFIX}{cipher_base64}")
}

pub fn key_exchange(session_key_base64: &str) -> String {
    format!("{KEY_EXCHANGE_PREFIX}{session_key_base64}")
}

/// Plaintext of an encrypted command
pub fn salt_payload(salt: &str, cmd: &str) -> String {
    format!("salt/{salt}/{cmd}")
}

/// Plaintext of an encrypted command that also rotates the salt
pub fn next_salt_payload(current: &str, next: &str, cmd: &str) -> String {
    format!("nextSalt/{current}/{next}/{cmd}")
}

/// Wrap a base64 ciphertext into the command for the given mode
pub fn encrypted_command(cipher_base64: &str, mode: EncryptionMode) -> String {
    let cipher = uri_encode(cipher_base64);
    match mode {
        EncryptionMode::RequestAndResponse => format!("jdev/sys/fenc/{cipher}"),
        _ => format!("jdev/sys/enc/{cipher}"),
    }
}

pub fn get_user_salt(user: &str) -> String {
    format!("{GET_USER_SALT_PREFIX}{user}")
}

/// Token acquisition; `permission` doubles as the token type
pub fn get_token(
    hash: &str,
    user: &str,
    permission: u32,
    device_uuid: &str,
    device_info: &str,
    jwt: bool,
) -> String {
    let prefix = if jwt { GET_JWT_PREFIX } else { GET_TOKEN_PREFIX };
    format!(
        "{prefix}{hash}/{user}/{permission}/{device_uuid}/{}",
        uri_encode(device_info)
    )
}

pub fn authenticate_with_token(hash: &str, user: &str) -> String {
    format!("{AUTH_WITH_TOKEN_PREFIX}{hash}/{user}")
}

pub fn refresh_token(hash: &str, user: &str, jwt: bool) -> String {
    if jwt {
        format!("jdev/sys/refreshjwt/{hash}/{user}")
    } else {
        format!("jdev/sys/refreshtoken/{hash}/{user}")
    }
}

pub fn check_token(hash: &str, user: &str) -> String {
    format!("jdev/sys/checktoken/{hash}/{user}")
}

pub fn kill_token(hash: &str, user: &str) -> String {
    format!("jdev/sys/killtoken/{hash}/{user}")
}

/// Query argument that authorizes a single command with a token
pub fn token_auth_arg(hash: &str, user: &str) -> String {
    format!("autht={hash}&user={user}")
}

/// Commands that acquire a token or authenticate with one
pub fn is_token_auth_command(cmd: &str) -> bool {
    cmd.starts_with(GET_USER_SALT_PREFIX)
        || cmd.starts_with(GET_TOKEN_PREFIX)
        || cmd.starts_with(GET_JWT_PREFIX)
        || cmd.starts_with(AUTH_WITH_TOKEN_PREFIX)
}

/// Commands allowed on a download connection before it is authenticated
pub fn is_auth_command(cmd: &str) -> bool {
    cmd.starts_with(GET_KEY)
        || cmd.starts_with(AUTHENTICATE_PREFIX)
        || cmd.starts_with(KEY_EXCHANGE_PREFIX)
        || cmd.starts_with(AUTHENTICATE_ENC_PREFIX)
        || is_token_auth_command(cmd)
}

/// Files and binary statistics are never sent encrypted
pub fn is_unencryptable(cmd: &str) -> bool {
    let lower = cmd.to_lowercase();
    UNENCRYPTABLE_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_matches_encode_uri_component() {
        assert_eq!(uri_encode("ab+/c=="), "ab%2B%2Fc%3D%3D");
        assert_eq!(uri_encode("My Phone (v2)"), "My%20Phone%20(v2)");
        assert_eq!(uri_encode("ä"), "%C3%A4");
    }

    #[test]
    fn test_encrypted_command_modes() {
        assert_eq!(
            encrypted_command("a+b=", EncryptionMode::Request),
            "jdev/sys/enc/a%2Bb%3D"
        );
        assert_eq!(
            encrypted_command("a+b=", EncryptionMode::RequestAndResponse),
            "jdev/sys/fenc/a%2Bb%3D"
        );
    }

    #[test]
    fn test_token_commands() {
        assert_eq!(
            get_token("h", "admin", 4, "uuid-1", "my device", false),
            "jdev/sys/gettoken/h/admin/4/uuid-1/my%20device"
        );
        assert_eq!(
            get_token("h", "admin", 2, "uuid-1", "x", true),
            "jdev/sys/getjwt/h/admin/2/uuid-1/x"
        );
        assert_eq!(
            refresh_token("h", "u", true),
            "jdev/sys/refreshjwt/h/u"
        );
        assert_eq!(
            refresh_token("h", "u", false),
            "jdev/sys/refreshtoken/h/u"
        );
        assert_eq!(token_auth_arg("h", "u"), "autht=h&user=u");
    }

    #[test]
    fn test_salt_payloads() {
        assert_eq!(salt_payload("ab12", "jdev/sps/io/x/on"), "salt/ab12/jdev/sps/io/x/on");
        assert_eq!(
            next_salt_payload("ab12", "cd34", "jdev/sps/io/x/on"),
            "nextSalt/ab12/cd34/jdev/sps/io/x/on"
        );
    }

    #[test]
    fn test_auth_command_detection() {
        assert!(is_auth_command(GET_KEY));
        assert!(is_auth_command(&authenticate("abc")));
        assert!(is_auth_command(&key_exchange("abc")));
        assert!(is_auth_command(&authenticate_encrypted("abc")));
        assert!(is_auth_command(&get_user_salt("admin")));
        assert!(is_auth_command(&authenticate_with_token("h", "u")));
        assert!(!is_auth_command("jdev/sps/LoxAPPversion3"));
        assert!(!is_token_auth_command(GET_KEY));
    }

    #[test]
    fn test_unencryptable_commands() {
        assert!(is_unencryptable("data/LoxAPP3.json"));
        assert!(is_unencryptable("images/icon.SVG"));
        assert!(is_unencryptable("camimage/1234"));
        assert!(!is_unencryptable("jdev/sps/io/1234/on"));
    }
}
