//! # Transport Layer
//!
//! The websocket and HTTP clients are provided by the host application. This module
//! defines the seams they plug into and the framing rules applied on top of them.
//!
//! ## Components
//! - **Connector / Transport**: open a websocket and send text frames over it
//! - **HttpChannel**: plain HTTP GET used for host resolution and the public key
//! - **Framing**: pairs binary headers with their payload frames
//! - **Host**: host resolution, CloudDNS handling and the public key cache
//!
//! Incoming frames and close notifications are delivered through an unbounded
//! channel of [`TransportEvent`]s returned by [`Connector::connect`].

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

pub mod framing;
pub mod host;

/// Websocket subprotocol requested from the Miniserver
pub const WS_SUBPROTOCOL: &str = "remotecontrol";
/// Path of the websocket endpoint
pub const WS_PATH: &str = "ws/rfc6455";
/// Close code used for regular closes initiated by the client
pub const CLOSE_NORMAL: u16 = 1000;

/// Something that happened on the websocket
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    Binary(Bytes),
    /// Remote close with its close code and reason
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Sending half of an open websocket
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the socket; no further events are expected afterwards
    async fn close(&mut self, code: u16);
}

/// Opens websockets
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &Url,
        subprotocol: &str,
    ) -> Result<(Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>)>;
}

/// Answer of an HTTP GET
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// URL the answer came from after following redirects
    pub final_url: Url,
    pub body: serde_json::Value,
}

/// Plain HTTP requests to the Miniserver
#[async_trait]
pub trait HttpChannel: Send + Sync + 'static {
    /// GET `url`, follow redirects and decode the body as JSON
    async fn get_json(&self, url: &Url) -> Result<HttpResponse>;
}

/// Websocket scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WsProtocol {
    #[default]
    Ws,
    Wss,
}

impl WsProtocol {
    pub fn ws_scheme(self) -> &'static str {
        match self {
            WsProtocol::Ws => "ws",
            WsProtocol::Wss => "wss",
        }
    }

    /// HTTP scheme used for plain requests alongside this websocket scheme
    pub fn http_scheme(self) -> &'static str {
        match self {
            WsProtocol::Ws => "http",
            WsProtocol::Wss => "https",
        }
    }

    pub fn is_secure(self) -> bool {
        self == WsProtocol::Wss
    }
}

impl From<String> for WsProtocol {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().trim_end_matches("://") {
            "ws" => WsProtocol::Ws,
            "wss" => WsProtocol::Wss,
            other => {
                warn!(protocol = %other, "Unknown websocket protocol, falling back to ws");
                WsProtocol::Ws
            }
        }
    }
}

impl From<WsProtocol> for String {
    fn from(protocol: WsProtocol) -> Self {
        protocol.ws_scheme().to_string()
    }
}

impl fmt::Display for WsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ws_scheme())
    }
}
