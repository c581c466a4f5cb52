//! # Connection Service
//!
//! The stateful half of the crate: a connection handle, the task driving its socket
//! and the token manager that keeps tokens alive.
//!
//! ## Components
//! - **Connection**: open / send / close / download on one Miniserver socket
//! - **Driver**: the task owning the socket, its request queue and its timers
//! - **Queue**: FIFO request correlation, one request in flight
//! - **Tokens**: token acquisition, verification, keepalive and revocation
//! - **Delegate**: notifications to the host application
//!
//! ## Ordering
//! Answers carry no request id. Commands on one connection complete strictly in the
//! order they were sent; closing rejects everything still pending with the close reason.

pub mod connection;
pub mod delegate;
pub(crate) mod driver;
pub mod queue;
pub mod tokens;

pub use connection::{Connection, ConnectionBuilder, ConnectionState, ConnectionStatus};
pub use delegate::{ConnectionDelegate, NoopDelegate};
pub use queue::{FileContent, Reply};
pub use tokens::{keepalive_delay, TokenChannel, TokenManager, TokenSettings};
