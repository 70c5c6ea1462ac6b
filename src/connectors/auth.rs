//! Bearer-token lifecycle shared by the stream and request clients.
//!
//! Venues issue short-lived access tokens through a client-credentials grant
//! and offer no refresh token. [`TokenLifecycle`] keeps one token current:
//! proactively on a timer, synchronously when a caller finds it near expiry,
//! and reactively when the venue rejects it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tokens are refreshed this long before they expire.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(300);

/// Period of the proactive refresh task.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(3600);

/// Scope requested when none is configured.
pub const DEFAULT_SCOPE: &str = "oob";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Credential request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Credential response carried no access token")]
    MissingToken,

    #[error("Credential endpoint rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to parse credential response: {0}")]
    Parse(String),
}

/// Errors that can tell an authorization failure apart from other failures.
pub trait AuthFailure {
    fn is_unauthorized(&self) -> bool;
}

/// An access token and its validity window.
#[derive(Clone)]
pub struct Token {
    access_token: String,
    acquired_at: DateTime<Utc>,
    expires_at: Instant,
    refresh_deadline: Instant,
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn refresh_deadline(&self) -> Instant {
        self.refresh_deadline
    }

    /// Whether the token may still be handed out at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_deadline
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .field("refresh_deadline", &self.refresh_deadline)
            .finish()
    }
}

/// What the credential endpoint returns.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// Something that can issue access tokens.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<TokenGrant, AuthError>;
}

/// Client identity for the credentials grant.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

impl ClientCredentials {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Client-credentials grant over HTTP.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    token_url: String,
    credentials: ClientCredentials,
}

impl HttpCredentialSource {
    pub fn new(token_url: impl Into<String>, credentials: ClientCredentials) -> Self {
        Self::with_client(reqwest::Client::new(), token_url, credentials)
    }

    pub fn with_client(
        client: reqwest::Client,
        token_url: impl Into<String>,
        credentials: ClientCredentials,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            credentials,
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<TokenGrant, AuthError> {
        debug!("Requesting access token from {}", self.token_url);

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("appkey", self.credentials.client_id.as_str()),
                ("appsecretkey", self.credentials.client_secret.as_str()),
                ("scope", self.credentials.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| AuthError::Parse(e.to_string()))
    }
}

/// Timing knobs for [`TokenLifecycle`].
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub skew: Duration,
    pub refresh_period: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            skew: DEFAULT_SKEW,
            refresh_period: DEFAULT_REFRESH_PERIOD,
        }
    }
}

/// Anything that can hand out an access token string.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, force_refresh: bool) -> Result<String, AuthError>;
}

/// A fixed token for venues that authenticate with static keys.
#[derive(Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self, _force_refresh: bool) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Owns one bearer token and keeps it fresh.
pub struct TokenLifecycle {
    name: String,
    source: Arc<dyn CredentialSource>,
    config: TokenConfig,
    token: RwLock<Option<Token>>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every successful refresh.
    generation: AtomicU64,
    refresh_count: AtomicU64,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl TokenLifecycle {
    pub fn new(name: impl Into<String>, source: Arc<dyn CredentialSource>) -> Self {
        Self::with_config(name, source, TokenConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        source: Arc<dyn CredentialSource>,
        config: TokenConfig,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            config,
            token: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            refresh_count: AtomicU64::new(0),
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// The token currently held, fresh or not.
    pub fn current(&self) -> Option<Token> {
        self.token.read().clone()
    }

    /// Number of successful refreshes so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Returns a fresh token, refreshing first when none is held, when it is
    /// within the skew of expiry, or when `force_refresh` is set.
    ///
    /// Concurrent callers share one refresh. A forced refresh is skipped if
    /// another caller completed one while this caller waited for the lock.
    pub async fn get_token(&self, force_refresh: bool) -> Result<Token, AuthError> {
        let observed = self.generation.load(Ordering::SeqCst);

        if !force_refresh {
            if let Some(token) = self.fresh_token() {
                return Ok(token);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        if let Some(token) = self.fresh_token() {
            let refreshed_meanwhile = self.generation.load(Ordering::SeqCst) != observed;
            if !force_refresh || refreshed_meanwhile {
                return Ok(token);
            }
        }

        self.refresh_locked().await
    }

    pub async fn access_token(&self, force_refresh: bool) -> Result<String, AuthError> {
        Ok(self.get_token(force_refresh).await?.access_token)
    }

    /// Fetches a new token unconditionally.
    pub async fn refresh(&self) -> Result<Token, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    fn fresh_token(&self) -> Option<Token> {
        let now = Instant::now();
        self.token.read().as_ref().filter(|t| t.is_fresh(now)).cloned()
    }

    async fn refresh_locked(&self) -> Result<Token, AuthError> {
        let grant = self.source.fetch().await?;

        let Some(access_token) = grant.access_token.filter(|t| !t.is_empty()) else {
            warn!("[{}] Credential response had no token, keeping the previous one", self.name);
            return Err(AuthError::MissingToken);
        };

        let now = Instant::now();
        let Some(expires_at) = now.checked_add(Duration::from_secs(grant.expires_in)) else {
            warn!(
                "[{}] Credential response expiry of {}s is out of range, keeping the previous token",
                self.name, grant.expires_in
            );
            return Err(AuthError::Parse(format!(
                "expires_in of {}s is out of range",
                grant.expires_in
            )));
        };
        let token = Token {
            access_token,
            acquired_at: Utc::now(),
            expires_at,
            refresh_deadline: expires_at.checked_sub(self.config.skew).unwrap_or(now),
        };

        let previous = self.token.write().replace(token.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.refresh_count.fetch_add(1, Ordering::SeqCst);

        let renewed = previous.is_some_and(|p| p.access_token != token.access_token);
        info!(
            "[{}] Token refreshed{}, expires in {}s",
            self.name,
            if renewed { " (renewed)" } else { "" },
            grant.expires_in
        );

        Ok(token)
    }

    /// Starts periodic proactive refreshes. The first runs immediately.
    ///
    /// Returns `false` if a refresh task is already scheduled.
    pub fn start_background_refresh(self: &Arc<Self>, period: Duration) -> bool {
        let mut slot = self.background.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let name = self.name.clone();
        info!("[{}] Background refresh every {}s", name, period.as_secs());

        *slot = Some(tokio::spawn(async move {
            loop {
                let started = Instant::now();

                let Some(lifecycle) = weak.upgrade() else {
                    debug!("[{}] Token lifecycle dropped, background refresh ends", name);
                    return;
                };
                if let Err(e) = lifecycle.refresh().await {
                    warn!("[{}] Background refresh failed: {}", name, e);
                }
                drop(lifecycle);

                tokio::time::sleep(period.saturating_sub(started.elapsed())).await;
            }
        }));

        true
    }

    /// Cancels the background refresh task, if any.
    pub fn stop(&self) {
        if let Some(handle) = self.background.lock().take() {
            handle.abort();
            info!("[{}] Background refresh stopped", self.name);
        }
    }

    pub fn is_refreshing_in_background(&self) -> bool {
        self.background
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Runs `op` with the current token. If it fails with an authorization
    /// error, forces a refresh and runs it exactly once more.
    pub async fn with_reactive_refresh<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AuthFailure + From<AuthError>,
    {
        let token = self.access_token(false).await?;

        match op(token).await {
            Err(e) if e.is_unauthorized() => {
                warn!("[{}] Token rejected, refreshing and retrying once", self.name);
                let token = self.access_token(true).await?;
                op(token).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl TokenProvider for TokenLifecycle {
    async fn access_token(&self, force_refresh: bool) -> Result<String, AuthError> {
        TokenLifecycle::access_token(self, force_refresh).await
    }
}

impl std::fmt::Debug for TokenLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycle")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("token", &*self.token.read())
            .field("refresh_count", &self.refresh_count())
            .finish()
    }
}

impl Drop for TokenLifecycle {
    fn drop(&mut self) {
        if let Some(handle) = self.background.get_mut().take() {
            handle.abort();
        }
    }
}
