//! Host resolution and public key retrieval
//!
//! Before a websocket is opened the host is asked for `jdev/cfg/apiKey` over plain
//! HTTP. The request follows redirects (CloudDNS answers with the current address of
//! the Miniserver) and reports the firmware version and whether HTTPS is available.

use crate::core::commands;
use crate::core::response::LxResponse;
use crate::core::version::ServerVersion;
use crate::error::{ProtocolError, Result};
use crate::protocol::crypto;
use crate::transport::{HttpChannel, WsProtocol, WS_PATH};
use rsa::RsaPublicKey;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

const CLOUD_DNS_HOST: &str = "dns.loxonecloud.com";
/// `dns.loxonecloud.com/{serial}`
const CLOUD_DNS_OLD_INDEX: usize = 0;
/// `{serial}.dns.loxonecloud.com`
const CLOUD_DNS_NEW_INDEX: usize = 13;

/// Value of the `jdev/cfg/apiKey` answer
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiKeyInfo {
    pub snr: Option<String>,
    pub version: Option<String>,
    pub key: Option<String>,
    pub is_in_trust: Option<bool>,
    pub local: Option<bool>,
    pub https_status: Option<i64>,
}

impl ApiKeyInfo {
    /// Parse the apiKey value, which is sent with single instead of double quotes
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(raw) => Ok(serde_json::from_str(&raw.replace('\'', "\""))?),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.version.as_deref().and_then(|v| v.parse().ok())
    }
}

/// Outcome of host resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHost {
    /// HTTP base URL of the Miniserver, ending with `/`
    pub base_url: Url,
    /// Websocket scheme to use; CloudDNS may upgrade it to `wss`
    pub protocol: WsProtocol,
    pub api: Option<ApiKeyInfo>,
}

impl ResolvedHost {
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.api.as_ref().and_then(ApiKeyInfo::server_version)
    }

    /// `{ws|wss}://{host}/ws/rfc6455`
    pub fn websocket_url(&self) -> Result<Url> {
        websocket_url(&self.base_url, self.protocol)
    }

    /// URL of a command sent over plain HTTP
    pub fn command_url(&self, cmd: &str) -> Result<Url> {
        self.base_url
            .join(cmd)
            .map_err(|e| ProtocolError::Http(format!("Invalid command url: {e}")))
    }
}

fn strip_scheme(host: &str) -> &str {
    host.strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
}

/// True for Loxone CloudDNS addresses, which only accept plain HTTP
pub fn is_cloud_dns(host: &str) -> bool {
    matches!(
        strip_scheme(host).find(CLOUD_DNS_HOST),
        Some(CLOUD_DNS_OLD_INDEX) | Some(CLOUD_DNS_NEW_INDEX)
    )
}

/// Add scheme and trailing slash to a user supplied host
pub fn normalize_host(host: &str, protocol: WsProtocol) -> Result<Url> {
    let mut url = host.trim().to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("{}://{url}", protocol.http_scheme());
    }
    if is_cloud_dns(&url) {
        url = url.replacen("https://", "http://", 1);
    }
    Url::parse(&url).map_err(|e| ProtocolError::Http(format!("Invalid host '{host}': {e}")))
}

/// Websocket URL for an HTTP base URL
pub fn websocket_url(base_url: &Url, protocol: WsProtocol) -> Result<Url> {
    let without_scheme = strip_scheme(base_url.as_str()).trim_end_matches('/');
    let url = format!("{}://{without_scheme}/{WS_PATH}", protocol.ws_scheme());
    Url::parse(&url).map_err(|e| ProtocolError::Http(format!("Invalid websocket url: {e}")))
}

/// Resolve the host through `jdev/cfg/apiKey`
#[instrument(skip(http))]
pub async fn resolve_host(
    http: &dyn HttpChannel,
    host: &str,
    protocol: WsProtocol,
) -> Result<ResolvedHost> {
    let url = normalize_host(host, protocol)?;
    let cloud_dns = is_cloud_dns(url.as_str());
    let request = url
        .join(commands::GET_API_KEY)
        .map_err(|e| ProtocolError::Http(e.to_string()))?;

    let response = http.get_json(&request).await?;

    let resolved = response.final_url.as_str().replace(commands::GET_API_KEY, "");
    let base_url = Url::parse(&resolved)
        .map_err(|e| ProtocolError::Http(format!("Invalid redirect target '{resolved}': {e}")))?;

    let api = serde_json::from_value::<LxResponseBody>(response.body)
        .ok()
        .and_then(|body| match ApiKeyInfo::parse(&body.ll.value) {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(error = %err, "Could not parse apiKey value");
                None
            }
        });

    let mut protocol = protocol;
    if cloud_dns && api.as_ref().and_then(|a| a.https_status) == Some(1) {
        info!("CloudDNS reports HTTPS support, switching to wss");
        protocol = WsProtocol::Wss;
    }

    debug!(base_url = %base_url, %protocol, "Host resolved");
    Ok(ResolvedHost {
        base_url,
        protocol,
        api,
    })
}

#[derive(Deserialize)]
struct LxResponseBody {
    #[serde(rename = "LL")]
    ll: LxResponse,
}

/// RSA public key of the Miniserver, set explicitly or fetched once
#[derive(Debug, Clone, Default)]
pub struct PublicKeyCache {
    key: Arc<RwLock<Option<RsaPublicKey>>>,
}

impl PublicKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a PEM encoded key
    pub async fn set(&self, pem: &str) -> Result<()> {
        let key = crypto::parse_public_key(pem)?;
        *self.key.write().await = Some(key);
        Ok(())
    }

    pub async fn get(&self) -> Option<RsaPublicKey> {
        self.key.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.key.write().await = None;
    }

    /// Cached key, or fetch `jdev/sys/getPublicKey` from the host
    #[instrument(skip(self, http, host), fields(host = %host.base_url))]
    pub async fn get_or_fetch(
        &self,
        http: &dyn HttpChannel,
        host: &ResolvedHost,
    ) -> Result<RsaPublicKey> {
        if let Some(key) = self.get().await {
            return Ok(key);
        }

        let url = host.command_url(commands::GET_PUBLIC_KEY)?;
        let response = http.get_json(&url).await?;
        let body: LxResponseBody = serde_json::from_value(response.body)
            .map_err(|e| ProtocolError::KeyExchangeFailed(e.to_string()))?;
        let pem = body
            .ll
            .into_result()?
            .value_str()
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::KeyExchangeFailed("Public key missing".into()))?;

        let key = crypto::parse_public_key(&pem)?;
        *self.key.write().await = Some(key.clone());
        debug!("Public key fetched");
        Ok(key)
    }
}
