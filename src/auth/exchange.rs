//! Login / refresh / logout round trips
//!
//! The session never talks HTTP directly; it goes through an `AuthExchange`.
//! `HttpAuthExchange` is the production implementation. It deliberately does
//! not go through the gateway's 401 handling: a 401 here is final.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::token::{Credentials, RefreshRequest, TokenResponse};
use super::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use crate::error::AuthError;
use crate::gateway::envelope::{error_message, ApiEnvelope};
use crate::gateway::{new_request_id, REQUEST_ID_HEADER};

/// Server-side token operations used by the auth session.
#[async_trait]
pub trait AuthExchange: Send + Sync {
    /// Exchange credentials for a token pair.
    async fn login(&self, credentials: &Credentials) -> Result<TokenResponse, AuthError>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError>;

    /// Tell the server the access token is no longer in use.
    async fn logout(&self, access_token: &str) -> Result<(), AuthError>;
}

/// `AuthExchange` over the platform's `/auth/*` endpoints.
#[derive(Debug, Clone)]
pub struct HttpAuthExchange {
    http: Client,
    api_base: String,
}

impl HttpAuthExchange {
    /// `api_base` is the full API root, e.g. `http://localhost:8000/api/v1`.
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, api_base))
    }

    pub fn with_client(http: Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_token_request<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, Vec<u8>), AuthError> {
        let url = format!("{}{}", self.api_base, path);
        let request_id = new_request_id();
        debug!(path = %path, request_id = %request_id, "Auth exchange");

        let response = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, request_id)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok((status, body.to_vec()))
    }
}

/// Decode the token payload from a 2xx envelope.
fn decode_tokens(body: &[u8]) -> Result<Result<TokenResponse, String>, String> {
    let envelope = ApiEnvelope::from_body(body).map_err(|e| e.to_string())?;
    if envelope.is_error() {
        return Ok(Err(envelope.message));
    }
    envelope
        .into_data::<TokenResponse>()
        .map(Ok)
        .map_err(|e| format!("malformed token payload: {}", e))
}

#[async_trait]
impl AuthExchange for HttpAuthExchange {
    async fn login(&self, credentials: &Credentials) -> Result<TokenResponse, AuthError> {
        let (status, body) = self.post_token_request(LOGIN_PATH, credentials).await?;

        if status.is_success() {
            return match decode_tokens(&body) {
                Ok(Ok(tokens)) => Ok(tokens),
                Ok(Err(rejected)) => Err(AuthError::InvalidCredentials(rejected)),
                Err(malformed) => Err(AuthError::Network(malformed)),
            };
        }
        if status.is_server_error() {
            return Err(AuthError::Network(error_message(status, &body)));
        }
        Err(AuthError::InvalidCredentials(error_message(status, &body)))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let (status, body) = self
            .post_token_request(REFRESH_PATH, &RefreshRequest { refresh_token })
            .await?;

        if !status.is_success() {
            return Err(AuthError::RefreshFailed(format!(
                "{} {}",
                status.as_u16(),
                error_message(status, &body)
            )));
        }
        match decode_tokens(&body) {
            Ok(Ok(tokens)) => Ok(tokens),
            Ok(Err(rejected)) => Err(AuthError::RefreshFailed(rejected)),
            Err(malformed) => Err(AuthError::RefreshFailed(malformed)),
        }
    }

    async fn logout(&self, access_token: &str) -> Result<(), AuthError> {
        let url = format!("{}{}", self.api_base, LOGOUT_PATH);
        let response = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, new_request_id())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthError::Network(format!("logout returned {}", response.status())))
        }
    }
}
