//! Request/response client sharing the stream's token lifecycle.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::auth::{AuthError, AuthFailure, TokenLifecycle};

/// Minimum spacing between two requests.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `rsp_cd` prefix the gateway uses for an expired or revoked token.
const GATEWAY_TOKEN_CODE: &str = "IGW00";

/// Decides from status and body whether the access token was rejected.
pub type TokenRejection = Arc<dyn Fn(StatusCode, &str) -> bool + Send + Sync>;

/// A `401`, or a `500` whose `rsp_cd` starts with `IGW00`.
pub fn gateway_token_rejection() -> TokenRejection {
    Arc::new(|status: StatusCode, body: &str| {
        if status == StatusCode::UNAUTHORIZED {
            return true;
        }
        status == StatusCode::INTERNAL_SERVER_ERROR
            && serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|value| {
                    value
                        .get("rsp_cd")?
                        .as_str()
                        .map(|code| code.starts_with(GATEWAY_TOKEN_CODE))
                })
                .unwrap_or(false)
    })
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Access token rejected")]
    Unauthorized,

    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
}

impl AuthFailure for ApiError {
    fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

#[derive(Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub min_interval: Duration,
    pub timeout: Duration,
    /// Responses matching this trigger one token refresh and a retry.
    pub token_rejected: TokenRejection,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            min_interval: DEFAULT_MIN_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            token_rejected: gateway_token_rejection(),
        }
    }
}

impl std::fmt::Debug for ApiClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClientConfig")
            .field("base_url", &self.base_url)
            .field("min_interval", &self.min_interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Bearer-authenticated JSON client with a request throttle.
pub struct ApiClient {
    name: String,
    client: Client,
    config: ApiClientConfig,
    tokens: Arc<TokenLifecycle>,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl ApiClient {
    pub fn new(
        name: impl Into<String>,
        config: ApiClientConfig,
        tokens: Arc<TokenLifecycle>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            name: name.into(),
            client,
            config,
            tokens,
            last_request: tokio::sync::Mutex::new(None),
        })
    }

    pub fn token_lifecycle(&self) -> &Arc<TokenLifecycle> {
        &self.tokens
    }

    /// Sends a request and decodes the JSON response. A rejected token (see
    /// [`ApiClientConfig::token_rejected`]) forces a refresh and the request
    /// is retried once.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        self.tokens
            .with_reactive_refresh(|token| self.send_once(method.clone(), path, body, token))
            .await
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: String,
    ) -> Result<Value, ApiError> {
        self.throttle().await;

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        debug!("[{}] {} {}", self.name, method, url);

        let mut request = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if (self.config.token_rejected)(status, &text) {
            warn!("[{}] {} rejected the access token ({})", self.name, url, status);
            return Err(ApiError::Unauthorized);
        }

        if !status.is_success() {
            warn!("[{}] {} answered {}", self.name, url, status);
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Parse(e.to_string()))
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.config.min_interval {
                tokio::time::sleep(self.config.min_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("name", &self.name)
            .field("base_url", &self.config.base_url)
            .field("min_interval", &self.config.min_interval)
            .finish()
    }
}
