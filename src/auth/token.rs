//! Token and credential types
//!
//! `TokenPair` is the in-memory credential owned by the auth session and the
//! shape persisted by the credential store. The wire types accept both the
//! backend's snake_case fields and camelCase variants.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access/refresh token pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "access_token")]
    pub access: String,
    #[serde(rename = "refresh_token")]
    pub refresh: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True once the advertised expiry has passed. Pairs without an expiry
    /// never report expired; the server stays the authority.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Username/password pair for `POST /auth/login`.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// `data` payload returned by login and refresh.
#[derive(Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type", alias = "tokenType")]
    pub token_type: String,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenResponse {
    /// Build the pair to install. A refresh response may omit the refresh
    /// token, in which case the previous one stays valid.
    pub fn into_pair(self, previous_refresh: Option<&str>, now: DateTime<Utc>) -> Option<TokenPair> {
        let refresh = self
            .refresh_token
            .filter(|r| !r.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))?;
        if self.access_token.is_empty() {
            return None;
        }
        let mut pair = TokenPair::new(self.access_token, refresh);
        if let Some(secs) = self.expires_in.filter(|s| *s > 0) {
            pair = pair.with_expiry(now + Duration::seconds(secs));
        }
        Some(pair)
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("user", &self.user)
            .finish()
    }
}

/// Current user as returned by `GET /auth/profile` and embedded in login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default = "default_active")]
    pub status: bool,
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_debug_redacts_tokens() {
        let pair = TokenPair::new("secret-access", "secret-refresh");
        let printed = format!("{:?}", pair);
        assert!(!printed.contains("secret-access"));
        assert!(!printed.contains("secret-refresh"));

        let creds = Credentials::new("alice", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_token_response_debug_redacts_tokens() {
        let resp: TokenResponse = serde_json::from_str(
            r#"{"access_token":"secret-access","refresh_token":"secret-refresh","expires_in":60}"#,
        )
        .unwrap();
        let printed = format!("{:?}", resp);
        assert!(!printed.contains("secret-access"));
        assert!(!printed.contains("secret-refresh"));
        assert!(printed.contains("expires_in: Some(60)"));

        let no_refresh: TokenResponse = serde_json::from_str(r#"{"access_token":"x"}"#).unwrap();
        assert!(format!("{:?}", no_refresh).contains("refresh_token: None"));
    }

    #[test]
    fn test_token_response_accepts_both_casings() {
        let snake: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a1","refresh_token":"r1","token_type":"bearer","expires_in":1800}"#,
        )
        .unwrap();
        let camel: TokenResponse =
            serde_json::from_str(r#"{"accessToken":"a1","refreshToken":"r1","expiresIn":1800}"#)
                .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = snake.into_pair(None, now).unwrap();
        let b = camel.into_pair(None, now).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.expires_at, Some(now + Duration::seconds(1800)));
    }

    #[test]
    fn test_refresh_response_keeps_previous_refresh_token() {
        let resp: TokenResponse = serde_json::from_str(r#"{"access_token":"a2"}"#).unwrap();
        let pair = resp.into_pair(Some("r1"), Utc::now()).unwrap();
        assert_eq!(pair.access, "a2");
        assert_eq!(pair.refresh, "r1");
    }

    #[test]
    fn test_missing_refresh_token_without_fallback_is_rejected() {
        let resp: TokenResponse = serde_json::from_str(r#"{"access_token":"a1"}"#).unwrap();
        assert!(resp.into_pair(None, Utc::now()).is_none());
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let pair = TokenPair::new("a", "r").with_expiry(now);
        assert!(pair.is_expired_at(now));
        assert!(!pair.is_expired_at(now - Duration::seconds(1)));
        assert!(!TokenPair::new("a", "r").is_expired_at(now));
    }

    #[test]
    fn test_store_document_field_names() {
        let json = serde_json::to_value(TokenPair::new("a1", "r1")).unwrap();
        assert_eq!(json["access_token"], "a1");
        assert_eq!(json["refresh_token"], "r1");
        assert!(json.get("expires_at").is_none());
    }
}
