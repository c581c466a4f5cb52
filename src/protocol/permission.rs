//! User rights granted by a token.
//!
//! The numeric value doubles as the token type sent with `gettoken`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Permission bitmask of a Miniserver token
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Permission: u32 {
        const ADMIN = 1;
        /// Short lived web interface token
        const WEB = 2;
        /// Long lived app token
        const APP = 4;
        const CONFIG = 8;
        const FTP = 16;
        const USER_EDIT = 32;
        const EXPERT_MODE = 64;
        const OP_MODES = 128;
        const SYS_WS = 256;
        const AUTOPILOT = 512;
        const EXPERT_MODE_LIGHT = 1024;
    }
}

impl Permission {
    pub const UNDEFINED: Permission = Permission::empty();

    /// Rights that authorize the socket connection itself
    pub fn connection() -> Self {
        Permission::WEB | Permission::APP
    }

    /// True if this token keeps the socket authenticated
    pub fn is_connection_permission(self) -> bool {
        self.intersects(Self::connection())
    }

    /// Bit containment: every bit of `required` is granted
    pub fn grants(self, required: Permission) -> bool {
        self.contains(required)
    }

    /// Lenient conversion from a JSON number; unknown bits are kept
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Permission::from_bits_retain)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("UNDEFINED");
        }
        bitflags::parser::to_writer(self, f)
    }
}
