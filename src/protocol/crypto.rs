//! Cryptographic primitives used by the Miniserver protocol
//!
//! - SHA-1 / SHA-256 digests and HMACs (hex in, hex out)
//! - AES-256-CBC with zero-byte padding for command and response encryption
//! - RSA PKCS#1 v1.5 for handing the session key to the Miniserver
//! - PBKDF2 for deriving a fresh session key per connection
//!
//! Key material travels as lowercase hex strings because that is what the
//! Miniserver expects inside the key-exchange payload.

use crate::error::{constants, ProtocolError, Result};
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};
use cbc::cipher::block_padding::{NoPadding, ZeroPadding};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes
pub const AES_BLOCK_LEN: usize = 16;
/// PBKDF2 rounds for the session key
pub const PBKDF2_ITERATIONS: u32 = 50;
/// Session key length in bytes (AES-256)
pub const SESSION_KEY_LEN: usize = 32;
/// Length of the random PBKDF2 salt
pub const PBKDF2_SALT_LEN: usize = 16;
/// Random bytes in a command salt
pub const COMMAND_SALT_LEN: usize = 2;

/// Hash function announced by the Miniserver for a user (`hashAlg`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
}

impl HashAlgorithm {
    /// Lowercase hex digest of a UTF-8 message
    pub fn digest_hex(self, message: &str) -> String {
        match self {
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(message.as_bytes())),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(message.as_bytes())),
        }
    }

    /// Hex HMAC of a UTF-8 message keyed with a hex encoded one-time salt
    pub fn hmac_hex(self, message: &str, key_hex: &str) -> Result<String> {
        let key = hex::decode(key_hex.trim())
            .map_err(|_| ProtocolError::Crypto(constants::ERR_INVALID_SALT.into()))?;

        let digest = match self {
            HashAlgorithm::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&key)
                    .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                    .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(hex::encode(digest))
    }

    /// Salted password hash: uppercase hex of `hash("{password}:{user_salt}")`
    pub fn password_hash(self, password: &str, user_salt: &str) -> String {
        self.digest_hex(&format!("{password}:{user_salt}"))
            .to_uppercase()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fresh command salt (2 random bytes as hex)
pub fn generate_salt() -> String {
    random_hex(COMMAND_SALT_LEN)
}

/// Session key derived with PBKDF2-HMAC-SHA1 from `seed` and a random salt, as hex
pub fn generate_aes_key(seed: &str) -> String {
    let mut salt = [0u8; PBKDF2_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut key = [0u8; SESSION_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(seed.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    hex::encode(key)
}

/// Random 128 bit IV as hex
pub fn generate_aes_iv() -> String {
    random_hex(AES_BLOCK_LEN)
}

fn decode_key_iv(key_hex: &str, iv_hex: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = hex::decode(key_hex)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_INVALID_HEX_KEY.into()))?;
    let iv = hex::decode(iv_hex)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_INVALID_HEX_KEY.into()))?;
    Ok((key, iv))
}

/// AES-256-CBC encrypt with zero padding
pub fn aes_encrypt(plaintext: &[u8], key_hex: &str, iv_hex: &str) -> Result<Vec<u8>> {
    let (key, iv) = decode_key_iv(key_hex, iv_hex)?;
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<ZeroPadding>(plaintext))
}

/// AES-256-CBC encrypt a UTF-8 text, returning base64
pub fn aes_encrypt_base64(plaintext: &str, key_hex: &str, iv_hex: &str) -> Result<String> {
    aes_encrypt(plaintext.as_bytes(), key_hex, iv_hex).map(|ct| STANDARD.encode(ct))
}

/// AES-256-CBC decrypt a block aligned ciphertext, padding bytes are left in place
pub fn aes_decrypt_raw(ciphertext: &[u8], key_hex: &str, iv_hex: &str) -> Result<Vec<u8>> {
    let (key, iv) = decode_key_iv(key_hex, iv_hex)?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| ProtocolError::DecryptionFailed)
}

/// Append `'0'` until the hex string covers whole AES blocks.
///
/// Older Miniservers drop trailing ciphertext bytes; padding restores block alignment.
pub fn pad_hex_to_block(hex_str: &str) -> String {
    let block_hex = AES_BLOCK_LEN * 2;
    let remainder = hex_str.len() % block_hex;
    let mut padded = String::with_capacity(hex_str.len() + block_hex);
    padded.push_str(hex_str);
    if remainder > 0 {
        padded.extend(std::iter::repeat('0').take(block_hex - remainder));
    }
    padded
}

fn decode_base64_lenient(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .or_else(|_| STANDARD_NO_PAD.decode(text.trim_end_matches('=')))
        .map_err(|_| ProtocolError::DecryptionFailed)
}

/// Decrypt a base64 ciphertext sent by the Miniserver into UTF-8 text
pub fn aes_decrypt(ciphertext_base64: &str, key_hex: &str, iv_hex: &str) -> Result<String> {
    let compact: String = ciphertext_base64
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let raw = decode_base64_lenient(&compact)?;
    let padded = pad_hex_to_block(&hex::encode(raw));
    let aligned = hex::decode(padded).map_err(|_| ProtocolError::DecryptionFailed)?;

    let mut plain = aes_decrypt_raw(&aligned, key_hex, iv_hex)?;
    while plain.last() == Some(&0) {
        plain.pop();
    }
    String::from_utf8(plain).map_err(|_| ProtocolError::DecryptionFailed)
}

/// Parse the Miniserver public key.
///
/// The Miniserver labels the key as a certificate, so the PEM armor is ignored and the
/// body is read as SubjectPublicKeyInfo DER, falling back to a PKCS#1 key.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.chars().filter(|c| !c.is_whitespace()))
        .collect();

    let der = STANDARD
        .decode(body.as_bytes())
        .map_err(|_| ProtocolError::KeyExchangeFailed(constants::ERR_INVALID_PUBLIC_KEY.into()))?;

    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|_| ProtocolError::KeyExchangeFailed(constants::ERR_INVALID_PUBLIC_KEY.into()))
}

/// RSA PKCS#1 v1.5 encryption, returning base64
pub fn rsa_encrypt_base64(plaintext: &str, public_key: &RsaPublicKey) -> Result<String> {
    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext.as_bytes())
        .map(|ct| STANDARD.encode(ct))
        .map_err(|e| {
            ProtocolError::KeyExchangeFailed(format!("{}: {e}", constants::ERR_RSA_ENCRYPT))
        })
}
