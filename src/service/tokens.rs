//! # Token Lifecycle
//!
//! [`TokenManager`] acquires tokens with a password, keeps every handled token alive
//! by refreshing it before it expires and revokes tokens on request.
//!
//! ## Keepalive
//! Each token keeps one timer per permission it is kept alive for. A timer fires at
//! 90% of the remaining lifetime (at most 24h, 500ms if the lifetime is unknown or
//! over) and refreshes the token. A refresh the Miniserver rejects kills the token
//! (a dead connection token is reported through [`ConnectionDelegate::token_invalid`]);
//! a refresh that failed for connectivity reasons keeps it and tries again.
//!
//! Since firmware 10.0.9.13 a refresh may hand out a new token string. A new
//! connection token is reported through [`ConnectionDelegate::token_refreshed`] so
//! the host can persist it.
//!
//! ## Reset
//! [`TokenManager::reset`] drops every token and stops every timer. Timers that are
//! already running a refresh notice the reset and discard their result.

use crate::core::commands::{self, EncryptionMode};
use crate::core::response::LxResponse;
use crate::core::version::Feature;
use crate::error::{ProtocolError, Result};
use crate::protocol::crypto::HashAlgorithm;
use crate::protocol::permission::Permission;
use crate::protocol::token::{TokenRecord, TokenResponse};
use crate::service::delegate::ConnectionDelegate;
use crate::utils::time;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// What the token manager needs from a connection
#[async_trait]
pub trait TokenChannel: Send + Sync + 'static {
    /// Send a command and expect an `LL` answer
    async fn send_command(&self, cmd: &str, mode: Option<EncryptionMode>) -> Result<LxResponse>;

    /// HMAC of `payload` keyed with a fresh one-time salt
    async fn salted_hash(&self, payload: &str) -> Result<String>;

    async fn supports(&self, feature: Feature) -> bool;

    async fn hash_algorithm(&self) -> HashAlgorithm {
        if self.supports(Feature::Sha256).await {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Sha1
        }
    }
}

/// Identity and timing used by the token manager
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub unique_id: String,
    pub device_info: String,
    pub min_refresh_delay: Duration,
    pub max_refresh_delay: Duration,
    /// Verbose token logging
    pub verbose: bool,
}

/// Delay before a token with the given lifetime is refreshed
pub fn keepalive_delay(
    valid_until: Option<u64>,
    now: SystemTime,
    min: Duration,
    max: Duration,
) -> Duration {
    match valid_until
        .filter(|secs| *secs > 0)
        .and_then(|secs| time::remaining_until(secs, now))
        .filter(|remaining| !remaining.is_zero())
    {
        Some(remaining) => remaining.mul_f64(0.9).min(max),
        None => min,
    }
}

/// Answer of `jdev/sys/getkey2`
#[derive(Debug, Deserialize)]
struct UserSalt {
    key: String,
    salt: String,
    #[serde(rename = "hashAlg", default)]
    hash_alg: HashAlgorithm,
}

#[derive(Debug, Clone, Copy)]
enum TokenCommand {
    Refresh { jwt: bool },
    Check,
    Kill,
}

impl TokenCommand {
    fn build(self, hash: &str, user: &str) -> String {
        match self {
            TokenCommand::Refresh { jwt } => commands::refresh_token(hash, user, jwt),
            TokenCommand::Check => commands::check_token(hash, user),
            TokenCommand::Kill => commands::kill_token(hash, user),
        }
    }
}

struct TokenEntry {
    record: TokenRecord,
    keepalives: HashMap<Permission, JoinHandle<()>>,
}

impl TokenEntry {
    fn new(record: TokenRecord) -> Self {
        Self {
            record,
            keepalives: HashMap::new(),
        }
    }

    fn stop_all(&mut self) {
        for (_, handle) in self.keepalives.drain() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct TokenState {
    entries: Vec<TokenEntry>,
    /// Bumped on reset so in-flight refreshes can tell they are stale
    generation: u64,
}

impl TokenState {
    fn find(&self, permission: Permission, user: Option<&str>) -> Option<&TokenEntry> {
        self.entries.iter().find(|entry| {
            entry.record.permission.grants(permission)
                && user.map_or(true, |user| entry.record.username == user)
        })
    }

    fn entry_mut(&mut self, token: &str) -> Option<&mut TokenEntry> {
        self.entries.iter_mut().find(|entry| entry.record.token == token)
    }

    fn remove(&mut self, token: &str) -> Option<TokenRecord> {
        let idx = self.entries.iter().position(|entry| entry.record.token == token)?;
        let mut entry = self.entries.remove(idx);
        entry.stop_all();
        Some(entry.record)
    }

    /// Insert or replace, keeping running timers of a replaced record
    fn store(&mut self, record: TokenRecord) {
        match self.entry_mut(&record.token) {
            Some(entry) => entry.record = record,
            None => self.entries.push(TokenEntry::new(record)),
        }
    }

    fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.stop_all();
        }
        self.entries.clear();
        self.generation += 1;
    }
}

impl Drop for TokenState {
    fn drop(&mut self) {
        for entry in &mut self.entries {
            entry.stop_all();
        }
    }
}

struct TokenInner {
    channel: Arc<dyn TokenChannel>,
    delegate: Arc<dyn ConnectionDelegate>,
    settings: TokenSettings,
    state: Mutex<TokenState>,
}

/// Token map of one connection
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl TokenManager {
    pub fn new(
        channel: Arc<dyn TokenChannel>,
        delegate: Arc<dyn ConnectionDelegate>,
        settings: TokenSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                channel,
                delegate,
                settings,
                state: Mutex::new(TokenState::default()),
            }),
        }
    }

    fn verbose(&self) -> bool {
        self.inner.settings.verbose
    }

    /// Forget every token and stop every keepalive
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        if self.verbose() && !state.entries.is_empty() {
            debug!(tokens = state.entries.len(), "Resetting token map");
        }
        state.clear();
    }

    /// Snapshot of all handled tokens
    pub async fn tokens(&self) -> Vec<TokenRecord> {
        let state = self.inner.state.lock().await;
        state.entries.iter().map(|entry| entry.record.clone()).collect()
    }

    /// Acquire a new token with the user's password.
    ///
    /// The record is returned, not stored; see [`TokenManager::add_to_handled_tokens`].
    #[instrument(skip(self, password), fields(permission = %permission))]
    pub async fn request_token(
        &self,
        user: &str,
        password: &str,
        permission: Permission,
    ) -> Result<TokenRecord> {
        let channel = &self.inner.channel;
        let salts = channel
            .send_command(
                &commands::get_user_salt(user),
                Some(EncryptionMode::RequestAndResponse),
            )
            .await?;
        let salts: UserSalt = serde_json::from_value(salts.value_json()?)?;

        let pw_hash = salts.hash_alg.password_hash(password, &salts.salt);
        let hash = salts
            .hash_alg
            .hmac_hex(&format!("{user}:{pw_hash}"), &salts.key)?;

        let jwt = channel.supports(Feature::JwtSupport).await;
        let settings = &self.inner.settings;
        let cmd = commands::get_token(
            &hash,
            user,
            permission.bits(),
            &settings.unique_id,
            &settings.device_info,
            jwt,
        );

        let response = channel
            .send_command(&cmd, Some(EncryptionMode::RequestAndResponse))
            .await
            .inspect_err(|err| warn!(error = %err, "Requesting a token failed"))?;
        let record = TokenRecord::from_response(
            TokenResponse::from_value(&response.value_json()?)?,
            user,
            None,
        )?;

        if self.verbose() {
            debug!(rights = %record.rights, valid_until = ?record.valid_until, "Token received");
        }
        Ok(record)
    }

    /// First token whose permission contains `permission`, optionally of `user`
    pub async fn get_token(
        &self,
        permission: Permission,
        user: Option<&str>,
    ) -> Option<TokenRecord> {
        let state = self.inner.state.lock().await;
        state.find(permission, user).map(|entry| entry.record.clone())
    }

    /// Token for `permission` after asking the Miniserver whether it is still valid.
    ///
    /// A token that fails the check is killed.
    #[instrument(skip(self), fields(permission = %permission))]
    pub async fn get_verified_token(
        &self,
        permission: Permission,
        user: Option<&str>,
    ) -> Result<TokenRecord> {
        let record = self
            .get_token(permission, user)
            .await
            .ok_or(ProtocolError::NoToken)?;

        match self.check_or_refresh(&record).await {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(error = %err, "Token could not be verified, killing it");
                self.kill_token(&record.token, &record.username).await;
                Err(err)
            }
        }
    }

    async fn check_or_refresh(&self, record: &TokenRecord) -> Result<TokenRecord> {
        if self.inner.channel.supports(Feature::TokenRefreshAndCheck).await {
            self.check_token(record).await?;
            Ok(record.clone())
        } else {
            let refreshed = record.refreshed(self.refresh_token(record).await?);
            self.inner.state.lock().await.store(refreshed.clone());
            Ok(refreshed)
        }
    }

    /// Store a token and keep it alive for its permission
    pub async fn add_to_handled_tokens(&self, record: TokenRecord) -> Result<()> {
        record.validate()?;
        let permission = record.permission;
        self.inner.state.lock().await.store(record);
        self.keep_permission_token_alive(permission).await
    }

    /// (Re)start the keepalive of the token handling `permission`
    pub async fn keep_permission_token_alive(&self, permission: Permission) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let Some(token) = state
            .find(permission, None)
            .map(|entry| entry.record.token.clone())
        else {
            warn!(%permission, "No token to keep alive");
            return Err(ProtocolError::NoToken);
        };

        Self::stop_keepalive(&mut state, permission);
        self.schedule(&mut state, &token, permission);
        Ok(())
    }

    pub async fn stop_permission_keepalive(&self, permission: Permission) {
        let mut state = self.inner.state.lock().await;
        Self::stop_keepalive(&mut state, permission);
    }

    fn stop_keepalive(state: &mut TokenState, permission: Permission) {
        for entry in &mut state.entries {
            if let Some(handle) = entry.keepalives.remove(&permission) {
                handle.abort();
            }
        }
    }

    /// Stop every keepalive of `token` without forgetting it
    pub async fn remove_from_keepalive(&self, token: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(entry) = state.entry_mut(token) {
            entry.stop_all();
        }
    }

    pub async fn has_insecure_password(&self, token: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        state
            .entry_mut(token)
            .map(|entry| entry.record.unsecure_pass)
            .unwrap_or(false)
    }

    fn schedule(&self, state: &mut TokenState, token: &str, permission: Permission) {
        let generation = state.generation;
        let Some(entry) = state.entry_mut(token) else {
            return;
        };

        let settings = &self.inner.settings;
        let delay = keepalive_delay(
            entry.record.valid_until,
            SystemTime::now(),
            settings.min_refresh_delay,
            settings.max_refresh_delay,
        );
        if settings.verbose {
            debug!(%permission, delay_ms = delay.as_millis() as u64, "Token keepalive scheduled");
        }

        let manager = Arc::downgrade(&self.inner);
        let token = token.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            keepalive_fired(manager, token, permission, generation).await;
        });

        if let Some(previous) = entry.keepalives.insert(permission, handle) {
            previous.abort();
        }
    }

    /// Refresh the token; the answer carries the new lifetime
    pub async fn refresh_token(&self, record: &TokenRecord) -> Result<TokenResponse> {
        let jwt = self.inner.channel.supports(Feature::JwtSupport).await;
        let response = self
            .send_token_command(TokenCommand::Refresh { jwt }, &record.token, &record.username)
            .await?;
        TokenResponse::from_value(&response.value_json()?)
    }

    /// Ask whether the token is still valid without changing it
    pub async fn check_token(&self, record: &TokenRecord) -> Result<TokenResponse> {
        let response = self
            .send_token_command(TokenCommand::Check, &record.token, &record.username)
            .await?;
        TokenResponse::from_value(&response.value_json()?)
    }

    async fn send_token_command(
        &self,
        command: TokenCommand,
        token: &str,
        user: &str,
    ) -> Result<LxResponse> {
        let hash = self.inner.channel.salted_hash(token).await?;
        self.inner
            .channel
            .send_command(
                &command.build(&hash, user),
                Some(EncryptionMode::RequestAndResponse),
            )
            .await
    }

    /// Send a command authorized by a token instead of the connection's session
    pub async fn send_with_token(&self, cmd: &str, token: &str, user: &str) -> Result<LxResponse> {
        let hash = self.inner.channel.salted_hash(token).await?;
        let separator = if cmd.contains('?') { '&' } else { '?' };
        let auth_cmd = format!("{cmd}{separator}{}", commands::token_auth_arg(&hash, user));
        self.inner
            .channel
            .send_command(&auth_cmd, Some(EncryptionMode::RequestAndResponse))
            .await
    }

    /// Forget a token and revoke it. Failures are only logged.
    #[instrument(skip(self, token))]
    pub async fn kill_token(&self, token: &str, user: &str) {
        self.inner.state.lock().await.remove(token);

        match self.send_token_command(TokenCommand::Kill, token, user).await {
            Ok(_) => {
                if self.verbose() {
                    debug!("Token killed");
                }
            }
            Err(err @ (ProtocolError::ConnectionClosed { .. } | ProtocolError::NotReady)) => {
                info!(error = %err, "Could not kill token, connection is down");
            }
            Err(err) => warn!(error = %err, "Killing the token failed"),
        }
    }

    /// Kill the token handling `permission`.
    ///
    /// A connection token is only killed if `permission` itself is a connection permission.
    pub async fn kill_token_with_permission(
        &self,
        permission: Permission,
        user: Option<&str>,
    ) -> Result<()> {
        let record = self
            .get_token(permission, user)
            .await
            .ok_or(ProtocolError::NoToken)?;

        if record.is_connection_token() && !permission.is_connection_permission() {
            warn!(
                %permission,
                "Refusing to kill the connection token for a non-connection permission"
            );
            return Ok(());
        }

        self.kill_token(&record.token, &record.username).await;
        Ok(())
    }

    /// Kill every token, the connection token last since it carries the channel
    pub async fn kill_all_tokens(&self) {
        let (connection, others): (Vec<_>, Vec<_>) = self
            .tokens()
            .await
            .into_iter()
            .partition(TokenRecord::is_connection_token);

        for record in others.iter().chain(connection.iter()) {
            self.kill_token(&record.token, &record.username).await;
        }
    }

    /// The password changed: drop every other token and refresh the connection token
    /// in place so it stays valid.
    #[instrument(skip(self))]
    pub async fn respond_to_password_change(&self) -> Result<TokenRecord> {
        let mut connection_token = match self.get_token(Permission::APP, None).await {
            Some(record) => record,
            None => self
                .get_token(Permission::WEB, None)
                .await
                .ok_or(ProtocolError::NoToken)?,
        };

        self.reset().await;
        connection_token.clear_lifetime();

        let response = self.refresh_token(&connection_token).await?;
        let mut refreshed = connection_token.refreshed(response);
        refreshed.rights = connection_token.rights;

        self.add_to_handled_tokens(refreshed.clone()).await?;
        if self.inner.channel.supports(Feature::TokenRefreshAndCheck).await {
            self.inner.delegate.token_refreshed(&refreshed);
        }
        Ok(refreshed)
    }
}

async fn keepalive_fired(
    manager: Weak<TokenInner>,
    token: String,
    permission: Permission,
    generation: u64,
) {
    let Some(inner) = manager.upgrade() else {
        return;
    };
    let manager = TokenManager { inner };

    let record = {
        let mut state = manager.inner.state.lock().await;
        if state.generation != generation {
            return;
        }
        let Some(entry) = state.entry_mut(&token) else {
            return;
        };
        // this task is finishing; its handle must not be aborted from here on
        drop(entry.keepalives.remove(&permission));
        entry.record.clone()
    };

    if manager.verbose() {
        debug!(%permission, "Token keepalive fired, refreshing");
    }

    match manager.refresh_token(&record).await {
        Ok(response) => {
            let refreshed = record.refreshed(response);
            let replaced = refreshed.token != record.token;

            {
                let mut state = manager.inner.state.lock().await;
                if state.generation != generation {
                    return;
                }
                if replaced {
                    state.remove(&record.token);
                }
                state.store(refreshed.clone());
                manager.schedule(&mut state, &refreshed.token, permission);
            }

            if replaced && refreshed.is_connection_token() {
                info!("Connection token replaced by refresh");
                manager.inner.delegate.token_refreshed(&refreshed);
            }
        }
        Err(err) if err.is_server_rejection() => {
            warn!(error = %err, %permission, "Token refresh rejected, killing token");
            manager.kill_token(&record.token, &record.username).await;
            if record.is_connection_token() {
                manager.inner.delegate.token_invalid();
            }
        }
        Err(err) => {
            warn!(error = %err, %permission, "Token refresh failed, keeping token");
            let mut state = manager.inner.state.lock().await;
            if state.generation == generation {
                manager.schedule(&mut state, &record.token, permission);
            }
        }
    }
}
