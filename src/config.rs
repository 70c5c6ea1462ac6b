//! Environment-driven client configuration.

use std::str::FromStr;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::connectors::auth::DEFAULT_SCOPE;
use crate::connectors::{ApiClientConfig, ClientCredentials, StreamConfig, TokenConfig};

const PREFIX: &str = "MARKETLINK_";

/// Default JSON pointer for the topic key of inbound messages.
const DEFAULT_TOPIC_POINTER: &str = "/topic";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting MARKETLINK_{0}")]
    Missing(&'static str),

    #[error("Invalid value for MARKETLINK_{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// REST endpoint queried once for a snapshot before streaming starts.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub api: ApiClientConfig,
    pub path: String,
}

/// Everything the client binary needs to run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub token_url: String,
    pub credentials: ClientCredentials,
    pub token: TokenConfig,
    pub stream: StreamConfig,
    /// Cap on simultaneously open stream links. `None` is unlimited.
    pub max_connections: Option<usize>,
    pub snapshot: Option<SnapshotConfig>,
    pub topics: Vec<String>,
    pub topic_pointer: String,
    pub subscribe_header: Map<String, Value>,
}

impl ClientConfig {
    /// Reads `MARKETLINK_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, which receives full variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let credentials = ClientCredentials {
            client_id: env.required("CLIENT_ID")?,
            client_secret: env.required("CLIENT_SECRET")?,
            scope: env.get("SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        };

        let mut token = TokenConfig::default();
        if let Some(secs) = env.parse::<u64>("TOKEN_SKEW_SECS")? {
            token.skew = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("REFRESH_PERIOD_SECS")? {
            token.refresh_period = Duration::from_secs(secs);
        }

        let mut stream = StreamConfig::new(env.required("WS_URL")?);
        if let Some(raw) = env.get("MAX_RETRIES") {
            stream.max_retries = parse_retries(&raw)?;
        }
        if let Some(secs) = env.parse::<u64>("INITIAL_DELAY_SECS")? {
            stream.initial_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("MAX_DELAY_SECS")? {
            stream.max_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("RECONNECT_DELAY_SECS")? {
            stream.reconnect_delay = Duration::from_secs(secs);
        }

        let snapshot = match env.get("API_URL") {
            Some(url) => {
                let mut api = ApiClientConfig::new(url);
                if let Some(ms) = env.parse::<u64>("API_MIN_INTERVAL_MS")? {
                    api.min_interval = Duration::from_millis(ms);
                }
                Some(SnapshotConfig {
                    api,
                    path: env.required("SNAPSHOT_PATH")?,
                })
            }
            None => None,
        };

        let subscribe_header = match env.get("SUBSCRIBE_HEADER") {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(invalid("SUBSCRIBE_HEADER", "expected a JSON object")),
                Err(e) => return Err(invalid("SUBSCRIBE_HEADER", e)),
            },
            None => Map::new(),
        };

        Ok(Self {
            token_url: env.required("TOKEN_URL")?,
            credentials,
            token,
            stream,
            max_connections: env.parse("MAX_CONNECTIONS")?,
            snapshot,
            topics: env
                .get("TOPICS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            topic_pointer: env
                .get("TOPIC_POINTER")
                .unwrap_or_else(|| DEFAULT_TOPIC_POINTER.to_string()),
            subscribe_header,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(format!("{}{}", PREFIX, key).as_str()).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| raw.trim().parse::<T>().map_err(|e| invalid(key, e)))
            .transpose()
    }
}

fn invalid(key: &'static str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// `-1` or `unlimited` retry forever.
fn parse_retries(raw: &str) -> Result<Option<u32>, ConfigError> {
    match raw.trim() {
        "-1" => Ok(None),
        s if s.eq_ignore_ascii_case("unlimited") => Ok(None),
        s => s.parse().map(Some).map_err(|e| invalid("MAX_RETRIES", e)),
    }
}
