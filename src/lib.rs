//! # miniserver-protocol
//!
//! Client-side protocol engine for Loxone Miniserver connections.
//!
//! The crate speaks the Miniserver websocket protocol on top of a websocket and an
//! HTTP client supplied by the host application. It covers the binary frame codec,
//! the session crypto, adaptive socket timeouts, the connection state machine and
//! the token lifecycle.
//!
//! ## Layers
//! - [`core`]: binary headers, event tables, the `LL` response envelope, command templates
//! - [`protocol`]: hashes, AES/RSA session crypto, permissions and token records
//! - [`transport`]: collaborator traits, frame pairing, host resolution
//! - [`service`]: [`Connection`], its driver task and the [`TokenManager`]
//! - [`utils`]: throughput estimation, Miniserver time, metrics, logging setup
//!
//! ## Example
//! ```rust,ignore
//! use miniserver_protocol::prelude::*;
//! use std::sync::Arc;
//!
//! let config = CommunicatorConfig::from_file("miniserver.toml")?;
//! let connection = Connection::builder(config, Arc::new(MyConnector), Arc::new(MyHttp)).build()?;
//! connection.open("192.168.1.77", "admin", "secret", None).await?;
//!
//! let answer = connection.send_command("jdev/sps/enablebinstatusupdate", None).await?;
//! println!("{}", answer.code);
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::CommunicatorConfig;
pub use error::{ProtocolError, Result};
pub use protocol::{Permission, TokenRecord};
pub use service::{Connection, ConnectionDelegate, ConnectionState, TokenManager};

/// Commonly used types
pub mod prelude {
    pub use crate::config::CommunicatorConfig;
    pub use crate::core::commands::EncryptionMode;
    pub use crate::core::event::Event;
    pub use crate::core::header::EventType;
    pub use crate::core::response::LxResponse;
    pub use crate::core::version::{Feature, ServerVersion};
    pub use crate::error::{ProtocolError, Result};
    pub use crate::protocol::{Permission, TokenRecord};
    pub use crate::service::{
        Connection, ConnectionDelegate, ConnectionState, FileContent, Reply, TokenManager,
    };
    pub use crate::transport::{Connector, HttpChannel, HttpResponse, Transport, TransportEvent};
    pub use crate::utils::throughput::DataProgress;
}
