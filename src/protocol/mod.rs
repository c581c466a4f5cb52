//! # Session Security
//!
//! Everything needed to secure and authorize a Miniserver session.
//!
//! ## Components
//! - **Crypto**: hash, HMAC, AES-CBC, RSA and PBKDF2 primitives
//! - **Session**: per-connection AES key, IV and rolling command salt
//! - **Permission**: token permission bitmask
//! - **Token**: token records as stored by the token manager
//!
//! ## Handshake
//! 1. RSA encrypt `"{key}:{iv}"` with the Miniserver public key (`jdev/sys/keyexchange`)
//! 2. The answer is a one-time salt, AES encrypted with the new session key
//! 3. Authenticate with an HMAC of the token or credentials keyed with that salt

pub mod crypto;
pub mod permission;
pub mod session;
pub mod token;

pub use permission::Permission;
pub use session::SessionCrypto;
pub use token::TokenRecord;
