use directories::BaseDirs;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";
const DEFAULT_DEBOUNCE_MS: u64 = 800;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    InvalidUrl { name: &'static str, reason: String },
    #[error("invalid {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("unable to determine home directory")]
    NoHome,
}

/// Exponential backoff used by the push channel between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given (1-based) retry attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial.saturating_mul(1u32 << shift);
        delay.min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base, e.g. `https://prod.example.com/api`
    pub api_base: Url,
    /// STOMP-over-WebSocket endpoint
    pub push_url: Url,
    pub credentials_path: PathBuf,
    pub debounce: Duration,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_base: Url, push_url: Url, credentials_path: PathBuf) -> Self {
        Self {
            api_base,
            push_url,
            credentials_path,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Load configuration from `PRODSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_raw = env::var("PRODSYNC_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_base = parse_url("PRODSYNC_API_URL", &api_raw)?;

        let push_url = match non_empty_var("PRODSYNC_PUSH_URL") {
            Some(raw) => parse_url("PRODSYNC_PUSH_URL", &raw)?,
            None => derive_push_url(&api_base)?,
        };

        let credentials_path = match non_empty_var("PRODSYNC_CREDENTIALS_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_credentials_path()?,
        };

        let mut config = Self::new(api_base, push_url, credentials_path);
        if let Some(ms) = parse_u64("PRODSYNC_DEBOUNCE_MS")? {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64("PRODSYNC_RECONNECT_MAX_SECS")? {
            config.reconnect.max = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_u64("PRODSYNC_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }

    /// Absolute URL for an API path such as `/productions/PR-1`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidUrl {
        name,
        reason: err.to_string(),
    })
}

fn parse_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match non_empty_var(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(None),
    }
}

/// `http://host/api` → `ws://host/ws`, `https` → `wss`.
pub fn derive_push_url(api_base: &Url) -> Result<Url, ConfigError> {
    let mut url = api_base.clone();
    let scheme = if api_base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        name: "PRODSYNC_API_URL",
        reason: format!("cannot derive websocket url from {api_base}"),
    })?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url)
}

pub fn default_credentials_path() -> Result<PathBuf, ConfigError> {
    let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
    Ok(base.home_dir().join(".prodsync").join("credentials"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let config = ClientConfig::new(
            Url::parse("http://localhost:9000/api/").unwrap(),
            Url::parse("ws://localhost:9000/ws").unwrap(),
            PathBuf::from("/tmp/creds"),
        );
        assert_eq!(
            config.endpoint("/productions/PR-1"),
            "http://localhost:9000/api/productions/PR-1"
        );
    }

    #[test]
    fn push_url_follows_api_scheme() {
        let secure = derive_push_url(&Url::parse("https://plant.example.com/api").unwrap()).unwrap();
        assert_eq!(secure.as_str(), "wss://plant.example.com/ws");
        let plain = derive_push_url(&Url::parse("http://127.0.0.1:8080/api").unwrap()).unwrap();
        assert_eq!(plain.as_str(), "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }
}
