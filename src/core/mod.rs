//! # Core Protocol Components
//!
//! Wire formats spoken by the Miniserver.
//!
//! ## Components
//! - **Header**: the 8 byte header announcing every binary frame
//! - **Event**: value, text, daytimer and weather event tables
//! - **Response**: the `LL` JSON envelope of text answers
//! - **Commands**: command templates and builders
//! - **Version**: firmware versions and the features they unlock
//!
//! ## Wire Format
//! ```text
//! [Identifier(1)] [Type(1)] [Info(1)] [Reserved(1)] [Length(4, LE)]  followed by the payload frame
//! ```

pub mod commands;
pub mod event;
pub mod header;
pub mod response;
pub mod version;
