//! Streaming endpoint identity

use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::ConnectionError;

const SUITE_PREFIX: &str = "suite:";

/// Logical streaming endpoint. At most one live connection exists per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionTarget {
    /// Agent control channel, `/ws/agent`.
    Agent,
    /// Log stream of one test suite run, `/ws/client?suite_id=<id>`.
    SuiteLog(String),
}

impl ConnectionTarget {
    pub fn suite_log(suite_id: impl Into<String>) -> Self {
        Self::SuiteLog(suite_id.into())
    }

    /// Stable key, `agent` or `suite:<id>`.
    pub fn key(&self) -> String {
        match self {
            Self::Agent => "agent".to_string(),
            Self::SuiteLog(id) => format!("{}{}", SUITE_PREFIX, id),
        }
    }

    /// Socket URL for this target under `ws_base`, carrying `token`.
    pub fn endpoint_url(&self, ws_base: &Url, token: &str) -> Result<Url, ConnectionError> {
        if !matches!(ws_base.scheme(), "ws" | "wss") {
            return Err(ConnectionError::InvalidTarget(format!(
                "unsupported socket scheme '{}'",
                ws_base.scheme()
            )));
        }
        let mut url = ws_base.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        match self {
            Self::Agent => {
                url.set_path(&format!("{}/ws/agent", prefix));
                url.query_pairs_mut().clear().append_pair("token", token);
            }
            Self::SuiteLog(id) => {
                url.set_path(&format!("{}/ws/client", prefix));
                url.query_pairs_mut()
                    .clear()
                    .append_pair("token", token)
                    .append_pair("suite_id", id);
            }
        }
        Ok(url)
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for ConnectionTarget {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "agent" {
            return Ok(Self::Agent);
        }
        match s.strip_prefix(SUITE_PREFIX) {
            Some(id) if !id.is_empty() => Ok(Self::SuiteLog(id.to_string())),
            _ => Err(ConnectionError::InvalidTarget(s.to_string())),
        }
    }
}
