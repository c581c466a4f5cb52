//! # Connection
//!
//! [`Connection`] is the handle an application holds for one Miniserver socket. It
//! resolves the host, opens the websocket through the injected [`Connector`],
//! exchanges session keys, authenticates and then forwards commands to the driver
//! task that owns the socket.
//!
//! ## Opening
//! ```text
//! Closed -> ResolvingHost -> OpeningTransport -> (KeyExchange) -> Authenticating -> Open
//! ```
//! Depending on the server version the connection authenticates with
//! - a token (or a freshly acquired one) over an encrypted channel,
//! - `authenticateEnc` with the password over an encrypted channel,
//! - plain `authenticate` with a one-time salt from `jdev/sys/getkey`.
//!
//! A key exchange the Miniserver rejects never falls back to plain text.
//!
//! ## Example
//! ```rust,ignore
//! let connection = Connection::builder(config, connector, http)
//!     .delegate(Arc::new(MyDelegate))
//!     .build()?;
//! connection.open("192.168.1.77", "admin", "secret", None).await?;
//! let version = connection.send_command("jdev/cfg/version", None).await?;
//! ```

use crate::config::CommunicatorConfig;
use crate::core::commands::{self, EncryptionMode};
use crate::core::response::{codes, LxResponse};
use crate::core::version::{self, Feature, ServerVersion};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::crypto::HashAlgorithm;
use crate::protocol::session::{resolve_mode, SessionCrypto};
use crate::protocol::token::{TokenRecord, TokenResponse};
use crate::service::delegate::{ConnectionDelegate, NoopDelegate};
use crate::service::driver::{Driver, DriverCommand, DriverContext, DriverSettings};
use crate::service::queue::{PendingRequest, Reply};
use crate::service::tokens::{TokenChannel, TokenManager, TokenSettings};
use crate::transport::host::{resolve_host, PublicKeyCache, ResolvedHost};
use crate::transport::{Connector, HttpChannel, WS_SUBPROTOCOL};
use crate::utils::metrics::{ConnectionMetrics, Timer};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    ResolvingHost,
    OpeningTransport,
    KeyExchange,
    Authenticating,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::ResolvingHost => "resolving-host",
            ConnectionState::OpeningTransport => "opening-transport",
            ConnectionState::KeyExchange => "key-exchange",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Open => "open",
        };
        f.write_str(name)
    }
}

/// State plus the reason of the last close
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub close_reason: Option<ProtocolError>,
}

/// Arguments of the last `open`, kept to reopen download connections
#[derive(Clone)]
struct OpenParams {
    host: String,
    user: String,
    password: Zeroizing<String>,
    token: Option<Zeroizing<String>>,
}

struct Inner {
    config: CommunicatorConfig,
    connector: Arc<dyn Connector>,
    http: Arc<dyn HttpChannel>,
    delegate: Arc<dyn ConnectionDelegate>,
    public_key: PublicKeyCache,
    status: Arc<watch::Sender<ConnectionStatus>>,
    driver: Mutex<Option<mpsc::UnboundedSender<DriverCommand>>>,
    host: RwLock<Option<ResolvedHost>>,
    version: RwLock<Option<ServerVersion>>,
    metrics: Arc<ConnectionMetrics>,
    tokens: TokenManager,
    last_open: Mutex<Option<OpenParams>>,
    open_lock: Mutex<()>,
}

/// Builder for [`Connection`]
pub struct ConnectionBuilder {
    config: CommunicatorConfig,
    connector: Arc<dyn Connector>,
    http: Arc<dyn HttpChannel>,
    delegate: Arc<dyn ConnectionDelegate>,
    public_key: PublicKeyCache,
}

impl ConnectionBuilder {
    pub fn delegate(mut self, delegate: Arc<dyn ConnectionDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Share a public key cache with other connections to the same Miniserver
    pub fn public_key_cache(mut self, cache: PublicKeyCache) -> Self {
        self.public_key = cache;
        self
    }

    /// Validate the configuration and create the handle
    pub fn build(self) -> Result<Connection> {
        self.config.validate_strict()?;

        let token_settings = TokenSettings {
            unique_id: self.config.socket.unique_id.clone(),
            device_info: self.config.socket.device_info.clone(),
            min_refresh_delay: self.config.timing.min_token_refresh_delay,
            max_refresh_delay: self.config.timing.max_token_refresh_delay,
            verbose: self.config.debug.tokens,
        };
        let version = self.config.socket.server_version.clone();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            tokens: TokenManager::new(
                Arc::new(ConnectionChannel(weak.clone())),
                self.delegate.clone(),
                token_settings,
            ),
            config: self.config,
            connector: self.connector,
            http: self.http,
            delegate: self.delegate,
            public_key: self.public_key,
            status: Arc::new(watch::Sender::new(ConnectionStatus::default())),
            driver: Mutex::new(None),
            host: RwLock::new(None),
            version: RwLock::new(version),
            metrics: Arc::new(ConnectionMetrics::new()),
            last_open: Mutex::new(None),
            open_lock: Mutex::new(()),
        });

        Ok(Connection { inner })
    }
}

/// Handle to one Miniserver socket; clones share the socket
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &*self.inner.status.borrow())
            .field("download", &self.inner.config.socket.download)
            .finish()
    }
}

impl Connection {
    pub fn builder(
        config: CommunicatorConfig,
        connector: Arc<dyn Connector>,
        http: Arc<dyn HttpChannel>,
    ) -> ConnectionBuilder {
        ConnectionBuilder {
            config,
            connector,
            http,
            delegate: Arc::new(NoopDelegate),
            public_key: PublicKeyCache::new(),
        }
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn metrics(&self) -> Arc<ConnectionMetrics> {
        self.inner.metrics.clone()
    }

    pub fn is_download_connection(&self) -> bool {
        self.inner.config.socket.download
    }

    pub async fn server_version(&self) -> Option<ServerVersion> {
        self.inner.version.read().await.clone()
    }

    pub async fn resolved_host(&self) -> Option<ResolvedHost> {
        self.inner.host.read().await.clone()
    }

    pub async fn supports(&self, feature: Feature) -> bool {
        version::supports(self.inner.version.read().await.as_ref(), feature)
    }

    async fn hash_algorithm(&self) -> HashAlgorithm {
        if self.supports(Feature::Sha256).await {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Sha1
        }
    }

    /// Use a known RSA public key instead of fetching it
    pub async fn set_public_key(&self, pem: &str) -> Result<()> {
        self.inner.public_key.set(pem).await
    }

    /// Move forward unless the connection went down in the meantime
    fn advance(&self, state: ConnectionState) -> bool {
        self.inner.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed || status.state == state {
                return false;
            }
            status.state = state;
            true
        })
    }

    /// Open the socket and authenticate.
    ///
    /// With `token` the connection authenticates with it; otherwise the password is
    /// used, either to acquire a token or, on older firmware, directly.
    #[instrument(skip(self, password, token), fields(download = self.is_download_connection()))]
    pub async fn open(
        &self,
        host: &str,
        user: &str,
        password: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let params = OpenParams {
            host: host.to_string(),
            user: user.to_string(),
            password: Zeroizing::new(password.to_string()),
            token: token.map(|t| Zeroizing::new(t.to_string())),
        };

        let _guard = self.inner.open_lock.lock().await;
        *self.inner.last_open.lock().await = Some(params.clone());
        self.establish(&params).await
    }

    async fn establish(&self, params: &OpenParams) -> Result<()> {
        let _timer = Timer::start("open");

        if self.inner.driver.lock().await.is_some() {
            warn!("Socket may still be open, closing it before opening a new one");
            self.stop_driver(ProtocolError::ManualClose).await;
        }

        self.inner.status.send_replace(ConnectionStatus {
            state: ConnectionState::ResolvingHost,
            close_reason: None,
        });
        self.inner.tokens.reset().await;

        let resolved = match resolve_host(
            self.inner.http.as_ref(),
            &params.host,
            self.inner.config.socket.protocol,
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(err) => {
                self.fail_before_transport(&err);
                return Err(err);
            }
        };

        let version = self
            .inner
            .config
            .socket
            .server_version
            .clone()
            .or_else(|| resolved.server_version());
        debug!(host = %resolved.base_url, version = ?version, "Opening websocket");
        *self.inner.version.write().await = version;
        *self.inner.host.write().await = Some(resolved.clone());

        if !self.advance(ConnectionState::OpeningTransport) {
            return Err(ProtocolError::ManualClose);
        }
        if let Err(err) = self.start_transport(&resolved).await {
            self.fail_before_transport(&err);
            return Err(err);
        }

        match self.authenticate(&resolved, params).await {
            Ok(()) => {
                self.inner.metrics.auth_success();
                self.notify_driver(DriverCommand::Authenticated).await?;
                if !self.advance(ConnectionState::Open) {
                    return Err(self.close_reason());
                }
                info!("Connection open");
                Ok(())
            }
            Err(err) => {
                self.inner.metrics.auth_failed();
                let reason = match err {
                    ProtocolError::TemporarilyBlocked { .. }
                    | ProtocolError::InvalidToken
                    | ProtocolError::WrongPassword { .. }
                    | ProtocolError::KeyExchangeFailed(_)
                    | ProtocolError::ManualClose => err,
                    other => {
                        warn!(error = %other, "Opening failed");
                        ProtocolError::SocketFailed
                    }
                };
                self.stop_driver(reason.clone()).await;
                Err(reason)
            }
        }
    }

    fn fail_before_transport(&self, err: &ProtocolError) {
        error!(error = %err, "Opening failed before the websocket was established");
        self.inner.status.send_replace(ConnectionStatus {
            state: ConnectionState::Closed,
            close_reason: Some(err.clone()),
        });
    }

    async fn start_transport(&self, resolved: &ResolvedHost) -> Result<()> {
        let url = resolved.websocket_url()?;
        let timeout = self.inner.config.timing.open_timeout;

        let (transport, events) = tokio::time::timeout(
            timeout,
            self.inner.connector.connect(&url, WS_SUBPROTOCOL),
        )
        .await
        .map_err(|_| {
            warn!(%url, ?timeout, "Websocket did not open in time");
            ProtocolError::Timeout
        })??;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::new(
            transport,
            events,
            rx,
            DriverContext {
                status: self.inner.status.clone(),
                delegate: self.inner.delegate.clone(),
                metrics: self.inner.metrics.clone(),
            },
            DriverSettings {
                download: self.inner.config.socket.download,
                timing: self.inner.config.timing.clone(),
                debug: self.inner.config.debug.clone(),
            },
        );
        tokio::spawn(driver.run());
        *self.inner.driver.lock().await = Some(tx);
        self.inner.metrics.connection_established();

        if self.inner.config.debug.socket_basic {
            debug!(%url, "Websocket opened");
        }
        Ok(())
    }

    async fn authenticate(&self, host: &ResolvedHost, params: &OpenParams) -> Result<()> {
        self.inner.metrics.auth_attempt();
        let tokens = self.supports(Feature::Tokens).await;
        let encrypted = tokens || self.supports(Feature::EncryptedConnectionFully).await;

        if !encrypted {
            self.advance(ConnectionState::Authenticating);
            let started = Instant::now();
            return self
                .password_auth(&params.user, &params.password)
                .await
                .map_err(|err| self.bad_auth(err, false, started));
        }

        self.advance(ConnectionState::KeyExchange);
        let (session, salt, started) = self.exchange_keys(host).await?;
        self.advance(ConnectionState::Authenticating);

        if !tokens {
            let auth_cmd = {
                let hash = self
                    .hash_algorithm()
                    .await
                    .hmac_hex(&format!("{}:{}", params.user, params.password.as_str()), &salt)?;
                session.encrypt_credentials(&hash, &params.user)?
            };
            self.notify_driver(DriverCommand::InstallSession(session)).await?;
            return self
                .send_command(&auth_cmd, Some(EncryptionMode::None))
                .await
                .map(drop)
                .map_err(|err| self.bad_auth(err, false, started));
        }

        self.notify_driver(DriverCommand::InstallSession(session)).await?;
        match &params.token {
            Some(token) => self
                .auth_with_token(&params.user, token, &salt)
                .await
                .map_err(|err| self.bad_auth(err, true, started)),
            None => self
                .acquire_token(&params.user, &params.password)
                .await
                .map_err(|err| self.bad_auth(err, false, started)),
        }
    }

    /// Key exchange; returns the new session, the one-time salt it produced and the
    /// moment the exchange was sent, which starts the salt validity window.
    #[instrument(skip_all)]
    async fn exchange_keys(
        &self,
        host: &ResolvedHost,
    ) -> Result<(SessionCrypto, String, Instant)> {
        let public_key = self
            .inner
            .public_key
            .get_or_fetch(self.inner.http.as_ref(), host)
            .await?;

        let session = SessionCrypto::generate(&self.inner.config.socket.unique_id)
            .with_rotation(self.inner.config.timing.salt_rotation)
            .with_secret_logging(self.inner.config.debug.encryption);
        let cmd = session.key_exchange_command(&public_key)?;

        let started = Instant::now();
        let response = match self.send_command(&cmd, Some(EncryptionMode::None)).await {
            Ok(response) => response,
            Err(err) if err.response_code() == Some(codes::UNAUTHORIZED) => {
                error!("Key exchange answered 401, the public key might have changed");
                self.inner.public_key.clear().await;
                return Err(ProtocolError::KeyExchangeFailed(err.to_string()));
            }
            Err(err) if err.is_server_rejection() => {
                return Err(ProtocolError::KeyExchangeFailed(err.to_string()));
            }
            Err(err) => return Err(err),
        };

        let cipher = response
            .value_str()
            .ok_or_else(|| ProtocolError::KeyExchangeFailed("Salt missing in answer".into()))?;
        let salt = session
            .decrypt(cipher)
            .map_err(|e| ProtocolError::KeyExchangeFailed(e.to_string()))?
            .trim_end_matches('\0')
            .to_string();
        Ok((session, salt, started))
    }

    /// Plain `authenticate` keyed with a salt from `getkey`
    async fn password_auth(&self, user: &str, password: &str) -> Result<()> {
        let salt = self
            .send_command(commands::GET_KEY, Some(EncryptionMode::None))
            .await?
            .value_str()
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::ResponseParseFailed("One-time salt missing".into()))?;
        let hash = self
            .hash_algorithm()
            .await
            .hmac_hex(&format!("{user}:{password}"), &salt)?;
        self.send_command(&commands::authenticate(&hash), Some(EncryptionMode::None))
            .await
            .map(drop)
    }

    async fn auth_with_token(&self, user: &str, token: &str, salt: &str) -> Result<()> {
        let hash = self.hash_algorithm().await.hmac_hex(token, salt)?;
        let response = self
            .send_command(
                &commands::authenticate_with_token(&hash, user),
                Some(EncryptionMode::RequestAndResponse),
            )
            .await?;

        let mut confirmed = TokenResponse::from_value(&response.value_json()?)?;
        confirmed.token = Some(token.to_string());
        let fallback = confirmed
            .token_rights
            .is_none()
            .then_some(self.inner.config.socket.required_permission);
        let record = TokenRecord::from_response(confirmed, user, fallback)?;

        debug!(rights = %record.rights, "Authenticated with token");
        self.inner.delegate.token_confirmed(&record);
        self.inner.tokens.add_to_handled_tokens(record).await
    }

    async fn acquire_token(&self, user: &str, password: &str) -> Result<()> {
        let record = self
            .inner
            .tokens
            .request_token(user, password, self.inner.config.socket.required_permission)
            .await?;
        debug!(rights = %record.rights, "Token received");
        self.inner.tokens.add_to_handled_tokens(record.clone()).await?;
        self.inner.delegate.token_received(&record);
        Ok(())
    }

    /// Turn a failed authentication step into the reason reported by `open`
    fn bad_auth(&self, err: ProtocolError, token_based: bool, started: Instant) -> ProtocolError {
        let code = err.response_code();
        let unauthorized = code == Some(codes::UNAUTHORIZED)
            || (token_based && code == Some(codes::INVALID_TOKEN));

        if unauthorized {
            let elapsed = started.elapsed();
            info!(?elapsed, token_based, "Authentication rejected");

            if elapsed > self.inner.config.timing.salt_validity {
                info!("Authentication took too long, the one-time salt may have expired");
                return ProtocolError::SocketFailed;
            }
            if token_based {
                self.inner.delegate.token_invalid();
                return ProtocolError::InvalidToken;
            }
            let last_password_change = match &err {
                ProtocolError::ServerError { unix, .. } => unix.unwrap_or(0),
                _ => 0,
            };
            return ProtocolError::WrongPassword {
                last_password_change,
            };
        }

        if code == Some(codes::BAD_REQUEST) {
            warn!("Authentication answered 400, closing");
            return ProtocolError::SocketFailed;
        }
        err
    }

    /// Send a command; `mode` defaults by server capability and command type
    pub async fn send(&self, cmd: &str, mode: Option<EncryptionMode>) -> Result<Reply> {
        let full_encryption = self.supports(Feature::EncryptedConnectionFully).await;
        let mode = resolve_mode(mode, cmd, full_encryption, self.is_download_connection());

        let (request, reply) = PendingRequest::new(cmd, mode);
        self.notify_driver(DriverCommand::Send(request)).await?;
        reply.await.map_err(|_| self.close_reason())?
    }

    /// Send a command that answers with an `LL` response
    pub async fn send_command(
        &self,
        cmd: &str,
        mode: Option<EncryptionMode>,
    ) -> Result<LxResponse> {
        self.send(cmd, mode).await?.into_response()
    }

    /// Fetch a file over a download connection, reopening it if it was idle-closed
    #[instrument(skip(self))]
    pub async fn download(&self, cmd: &str) -> Result<Reply> {
        if !self.is_download_connection() {
            return Err(ProtocolError::NotDownloadConnection);
        }

        {
            let _guard = self.inner.open_lock.lock().await;
            if self.state() == ConnectionState::Closed {
                let params = self
                    .inner
                    .last_open
                    .lock()
                    .await
                    .clone()
                    .ok_or_else(|| ProtocolError::Custom(constants::ERR_NOT_CONNECTED.into()))?;
                debug!("Download connection closed, reopening");
                self.establish(&params).await?;
            }
        }

        self.send(cmd, None).await
    }

    /// HMAC of `payload` keyed with a fresh one-time salt
    pub async fn get_salted_hash(&self, payload: &str) -> Result<String> {
        let mode = if self.supports(Feature::EncryptedConnectionFully).await {
            EncryptionMode::RequestAndResponse
        } else {
            EncryptionMode::None
        };
        let response = self.send_command(commands::GET_KEY, Some(mode)).await?;
        let salt = response
            .value_str()
            .ok_or_else(|| ProtocolError::ResponseParseFailed("One-time salt missing".into()))?;
        self.hash_algorithm().await.hmac_hex(payload, salt)
    }

    /// Close the socket; pending requests fail with `ManualClose`
    pub async fn close(&self) {
        self.close_with(ProtocolError::ManualClose).await;
    }

    /// Close the socket with a custom reason for pending requests
    pub async fn close_with(&self, reason: ProtocolError) {
        if self.inner.config.debug.socket_basic {
            debug!(%reason, "Closing the connection");
        }
        if !self.stop_driver(reason.clone()).await {
            // no socket yet; make a running open() give up
            self.inner.status.send_if_modified(|status| {
                if status.state == ConnectionState::Closed {
                    return false;
                }
                status.state = ConnectionState::Closed;
                status.close_reason = Some(reason);
                true
            });
        }
    }

    /// Ask the driver to close and wait until it did. Returns false without a driver.
    async fn stop_driver(&self, reason: ProtocolError) -> bool {
        let Some(driver) = self.inner.driver.lock().await.take() else {
            return false;
        };

        let mut status = self.inner.status.subscribe();
        if driver.send(DriverCommand::Close(reason)).is_ok() {
            let _ = status
                .wait_for(|status| status.state == ConnectionState::Closed)
                .await;
        }
        true
    }

    async fn notify_driver(&self, command: DriverCommand) -> Result<()> {
        let driver = self.inner.driver.lock().await;
        match driver.as_ref() {
            Some(sender) => sender.send(command).map_err(|_| self.close_reason()),
            None => Err(self.close_reason()),
        }
    }

    /// Why the connection is unusable
    fn close_reason(&self) -> ProtocolError {
        self.inner
            .status
            .borrow()
            .close_reason
            .clone()
            .unwrap_or(ProtocolError::NotReady)
    }
}

/// The token manager's view of its connection
struct ConnectionChannel(Weak<Inner>);

impl ConnectionChannel {
    fn connection(&self) -> Result<Connection> {
        self.0
            .upgrade()
            .map(|inner| Connection { inner })
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_DRIVER_GONE.into()))
    }
}

#[async_trait]
impl TokenChannel for ConnectionChannel {
    async fn send_command(&self, cmd: &str, mode: Option<EncryptionMode>) -> Result<LxResponse> {
        self.connection()?.send_command(cmd, mode).await
    }

    async fn salted_hash(&self, payload: &str) -> Result<String> {
        self.connection()?.get_salted_hash(payload).await
    }

    async fn supports(&self, feature: Feature) -> bool {
        match self.connection() {
            Ok(connection) => connection.supports(feature).await,
            Err(_) => false,
        }
    }
}
