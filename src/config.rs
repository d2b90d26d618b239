//! Configuration for ats-client
//!
//! CLI arguments and environment variables (all `ATS_*`) via clap, resolved
//! into a [`ClientConfig`] the library consumes.

use clap::Args as ClapArgs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::credentials::FileCredentialStore;
use crate::stream::{BackoffStrategy, ConnectionSettings, ReconnectPolicy};

/// Resolved client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `http://localhost:8000`.
    pub base_url: String,
    /// REST prefix appended to `base_url`.
    pub api_prefix: String,
    /// Socket root. Derived from `base_url` when unset.
    pub ws_url: Option<Url>,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub credentials_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            ws_url: None,
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            reconnect: ReconnectPolicy::default(),
            credentials_path: FileCredentialStore::default_path(),
        }
    }
}

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_API_PREFIX: &str = "/api/v1";

impl ClientConfig {
    /// Config pointing at `base_url` with every other setting defaulted.
    pub fn for_server(base_url: &str) -> Result<Self, String> {
        parse_http_url(base_url)?;
        Ok(Self {
            base_url: base_url.to_string(),
            ..Default::default()
        })
    }

    /// REST root, e.g. `http://localhost:8000/api/v1`.
    pub fn api_base(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            normalize_prefix(&self.api_prefix)
        )
    }

    /// Socket root: `ws_url`, or `base_url` with `http(s)` swapped for `ws(s)`.
    pub fn ws_base(&self) -> Result<Url, String> {
        if let Some(ws) = &self.ws_url {
            return Ok(ws.clone());
        }
        let mut ws = parse_http_url(&self.base_url)?;
        let scheme = if ws.scheme() == "https" { "wss" } else { "ws" };
        ws.set_scheme(scheme)
            .map_err(|_| format!("Cannot derive a socket URL from {}", self.base_url))?;
        Ok(ws)
    }

    pub fn connection_settings(&self) -> Result<ConnectionSettings, String> {
        Ok(ConnectionSettings {
            ws_base: self.ws_base()?,
            handshake_timeout: self.handshake_timeout,
            ping_interval: self.ping_interval,
            liveness_timeout: self.liveness_timeout,
            reconnect: self.reconnect,
        })
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("Invalid base URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("Base URL must be http or https, got '{}'", other)),
    }
}

/// Connection options shared by every subcommand.
#[derive(ClapArgs, Debug, Clone)]
pub struct Args {
    /// Server root URL
    #[arg(long, env = "ATS_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// REST API prefix
    #[arg(long, env = "ATS_API_PREFIX", default_value = DEFAULT_API_PREFIX)]
    pub api_prefix: String,

    /// Socket root URL (ws:// or wss://). Derived from the base URL if unset
    #[arg(long, env = "ATS_WS_URL")]
    pub ws_url: Option<String>,

    /// HTTP request timeout in milliseconds
    #[arg(long, env = "ATS_REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Socket handshake timeout in milliseconds
    #[arg(long, env = "ATS_HANDSHAKE_TIMEOUT_MS", default_value = "10000")]
    pub handshake_timeout_ms: u64,

    /// Transport ping interval in seconds
    #[arg(long, env = "ATS_PING_INTERVAL_SECS", default_value = "30")]
    pub ping_interval_secs: u64,

    /// Seconds without inbound traffic before a socket is considered dead
    #[arg(long, env = "ATS_LIVENESS_TIMEOUT_SECS", default_value = "90")]
    pub liveness_timeout_secs: u64,

    /// Delay before each reconnect attempt in milliseconds
    #[arg(long, env = "ATS_RECONNECT_DELAY_MS", default_value = "3000")]
    pub reconnect_delay_ms: u64,

    /// Reconnect attempts before a connection gives up
    #[arg(long, env = "ATS_MAX_RECONNECT_ATTEMPTS", default_value = "5")]
    pub max_reconnect_attempts: u32,

    /// Double the reconnect delay after each failed attempt
    #[arg(long, env = "ATS_EXPONENTIAL_BACKOFF", default_value = "false")]
    pub exponential_backoff: bool,

    /// Upper bound for exponential reconnect delays in milliseconds
    #[arg(long, env = "ATS_MAX_RECONNECT_DELAY_MS", default_value = "30000")]
    pub max_reconnect_delay_ms: u64,

    /// Where the token pair is persisted
    #[arg(long, env = "ATS_CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ATS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("ATS_REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("ATS_HANDSHAKE_TIMEOUT_MS must be greater than zero".to_string());
        }
        if self.ping_interval_secs == 0 {
            return Err("ATS_PING_INTERVAL_SECS must be greater than zero".to_string());
        }
        if self.liveness_timeout_secs <= self.ping_interval_secs {
            return Err(
                "ATS_LIVENESS_TIMEOUT_SECS must be longer than ATS_PING_INTERVAL_SECS".to_string(),
            );
        }
        if self.exponential_backoff && self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(
                "ATS_MAX_RECONNECT_DELAY_MS must be at least ATS_RECONNECT_DELAY_MS".to_string(),
            );
        }
        self.client_config().map(|_| ())
    }

    pub fn client_config(&self) -> Result<ClientConfig, String> {
        let ws_url = match &self.ws_url {
            Some(raw) => {
                let url = Url::parse(raw).map_err(|e| format!("Invalid socket URL '{}': {}", raw, e))?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(format!("Socket URL must be ws or wss, got '{}'", url.scheme()));
                }
                Some(url)
            }
            None => None,
        };

        let strategy = if self.exponential_backoff {
            BackoffStrategy::Exponential {
                max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            }
        } else {
            BackoffStrategy::Fixed
        };

        Ok(ClientConfig {
            base_url: parse_http_url(&self.base_url)?.to_string(),
            api_prefix: self.api_prefix.clone(),
            ws_url,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            reconnect: ReconnectPolicy {
                delay: Duration::from_millis(self.reconnect_delay_ms),
                max_attempts: self.max_reconnect_attempts,
                strategy,
            },
            credentials_path: self
                .credentials_file
                .clone()
                .unwrap_or_else(FileCredentialStore::default_path),
        })
    }
}
