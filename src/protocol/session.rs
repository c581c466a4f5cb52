//! Per-connection encryption state
//!
//! A [`SessionCrypto`] is created for every key exchange. It holds the AES session
//! key and IV handed to the Miniserver and the rolling command salt. The salt is
//! created on first use and replaced every hour by chaining old and new salt in a
//! single `nextSalt` payload.

use crate::core::commands::{self, EncryptionMode};
use crate::error::Result;
use crate::protocol::crypto;
use rsa::RsaPublicKey;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Default lifetime of a command salt
pub const SALT_ROTATION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// AES session material of one connection
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCrypto {
    key: String,
    iv: String,
    salt: Option<String>,
    #[zeroize(skip)]
    salt_created: Option<Instant>,
    #[zeroize(skip)]
    rotation: Duration,
    #[zeroize(skip)]
    log_secrets: bool,
}

impl SessionCrypto {
    /// Generate a fresh session key (PBKDF2 over `seed`) and IV
    pub fn generate(seed: &str) -> Self {
        Self::with_key(crypto::generate_aes_key(seed), crypto::generate_aes_iv())
    }

    /// Use existing key material
    pub fn with_key(key_hex: impl Into<String>, iv_hex: impl Into<String>) -> Self {
        Self {
            key: key_hex.into(),
            iv: iv_hex.into(),
            salt: None,
            salt_created: None,
            rotation: SALT_ROTATION_INTERVAL,
            log_secrets: false,
        }
    }

    pub fn with_rotation(mut self, rotation: Duration) -> Self {
        self.rotation = rotation;
        self
    }

    /// Log key material and plaintexts at debug level
    pub fn with_secret_logging(mut self, enabled: bool) -> Self {
        self.log_secrets = enabled;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn iv(&self) -> &str {
        &self.iv
    }

    pub fn salt(&self) -> Option<&str> {
        self.salt.as_deref()
    }

    /// Build the `jdev/sys/keyexchange` command carrying `"{key}:{iv}"` RSA encrypted
    pub fn key_exchange_command(&self, public_key: &RsaPublicKey) -> Result<String> {
        if self.log_secrets {
            debug!(key = %self.key, iv = %self.iv, "session key generated");
        }
        let session_key =
            crypto::rsa_encrypt_base64(&format!("{}:{}", self.key, self.iv), public_key)?;
        Ok(commands::key_exchange(&session_key))
    }

    /// Wrap a command into `jdev/sys/enc` or `jdev/sys/fenc`, rotating the salt when it expired
    #[instrument(level = "trace", skip(self, cmd))]
    pub fn encrypt_command(
        &mut self,
        cmd: &str,
        mode: EncryptionMode,
        now: Instant,
    ) -> Result<String> {
        let plaintext = match (&self.salt, self.salt_created) {
            (Some(current), Some(created)) if now.duration_since(created) >= self.rotation => {
                let next = crypto::generate_salt();
                let payload = commands::next_salt_payload(current, &next, cmd);
                trace!("command salt rotated");
                self.salt = Some(next);
                self.salt_created = Some(now);
                payload
            }
            (Some(current), _) => commands::salt_payload(current, cmd),
            (None, _) => {
                let salt = crypto::generate_salt();
                let payload = commands::salt_payload(&salt, cmd);
                self.salt = Some(salt);
                self.salt_created = Some(now);
                payload
            }
        };

        if self.log_secrets {
            debug!(plaintext = %plaintext, "encrypting command");
        }

        let cipher = crypto::aes_encrypt_base64(&plaintext, &self.key, &self.iv)?;
        Ok(commands::encrypted_command(&cipher, mode))
    }

    /// `authenticateEnc` command for password authentication over an encrypted channel
    pub fn encrypt_credentials(&self, hash: &str, user: &str) -> Result<String> {
        let cipher = crypto::aes_encrypt_base64(&format!("{hash}/{user}"), &self.key, &self.iv)?;
        Ok(commands::authenticate_encrypted(&cipher))
    }

    /// Decrypt a `fenc` response or the key-exchange answer
    pub fn decrypt(&self, ciphertext_base64: &str) -> Result<String> {
        let plain = crypto::aes_decrypt(ciphertext_base64, &self.key, &self.iv)?;
        if self.log_secrets {
            debug!(plaintext = %plain, "decrypted response");
        }
        Ok(plain)
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto")
            .field("salt", &self.salt)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

/// Decide how a command is actually sent.
///
/// - no explicit mode: `Request` when the server encrypts fully and this is not a
///   download connection, otherwise `None`
/// - `RequestAndResponse` falls back to `Request` without full encryption support
/// - files, images and statistics are always sent in plain text
pub fn resolve_mode(
    requested: Option<EncryptionMode>,
    cmd: &str,
    full_encryption: bool,
    download: bool,
) -> EncryptionMode {
    let mut mode = match requested {
        None if !download && full_encryption => EncryptionMode::Request,
        None => EncryptionMode::None,
        Some(mode) => mode,
    };

    if !full_encryption && mode == EncryptionMode::RequestAndResponse {
        mode = EncryptionMode::Request;
    }

    if mode.encrypts_request() && commands::is_unencryptable(cmd) {
        mode = EncryptionMode::None;
    }

    mode
}
