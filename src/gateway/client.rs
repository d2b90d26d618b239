//! Authenticated REST client

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::envelope::{error_message, ApiEnvelope, ResponseStatus};
use super::{new_request_id, REQUEST_ID_HEADER};
use crate::auth::{AuthSession, UserProfile, LOGIN_PATH, PROFILE_PATH, REFRESH_PATH};
use crate::error::{HttpError, Result};

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Return `error` envelopes as-is instead of failing with
    /// `HttpError::Business`. Used by bulk endpoints whose error envelope
    /// carries per-row detail.
    pub raw_envelope: bool,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn raw_envelope() -> Self {
        Self {
            raw_envelope: true,
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// REST client that attaches the session's token and recovers from one 401.
#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    api_base: String,
    auth: AuthSession,
}

impl HttpGateway {
    pub fn new(api_base: impl Into<String>, timeout: Duration, auth: AuthSession) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, api_base, auth))
    }

    pub fn with_client(http: Client, api_base: impl Into<String>, auth: AuthSession) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    /// Issue a request and unwrap the response envelope.
    ///
    /// A 401 triggers one refresh and one retry with the new token. A 401 on
    /// the retry, or on the login/refresh endpoints, is final and the retry
    /// case ends the session.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<ApiEnvelope> {
        let token = self.auth.current_access_token();
        let (status, bytes) = self.send(&method, path, body, options, token.as_deref()).await?;

        if status != StatusCode::UNAUTHORIZED {
            return self.finish(status, &bytes, options);
        }
        if is_auth_endpoint(path) {
            return Err(HttpError::Unauthorized);
        }

        debug!(method = %method, path = %path, "401 received, refreshing token");
        let refreshed = match self.auth.refresh_from(token.as_deref()).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(path = %path, error = %e, "Refresh failed after 401");
                return Err(HttpError::Unauthorized);
            }
        };

        let (status, bytes) = self
            .send(&method, path, body, options, Some(&refreshed.access))
            .await?;
        if status == StatusCode::UNAUTHORIZED {
            warn!(method = %method, path = %path, "Retried request rejected again");
            self.auth.expire();
            return Err(HttpError::Unauthorized);
        }
        self.finish(status, &bytes, options)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None, &RequestOptions::default())
            .await?
            .into_data()
    }

    pub async fn get_with<T: DeserializeOwned>(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<T> {
        self.request(Method::GET, path, None, options).await?.into_data()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.with_body(Method::POST, path, body).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.with_body(Method::PUT, path, body).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.with_body(Method::PATCH, path, body).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::DELETE, path, None, &RequestOptions::default())
            .await?
            .into_data()
    }

    /// `GET /auth/profile`
    pub async fn profile(&self) -> Result<UserProfile> {
        self.get(PROFILE_PATH).await
    }

    async fn with_body<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request(method, path, Some(&body), &RequestOptions::default())
            .await?
            .into_data()
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let url = format!("{}{}", self.api_base, path);
        let request_id = new_request_id();

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(REQUEST_ID_HEADER, &request_id);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, path = %path, request_id = %request_id, "Sending request");
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(status = status.as_u16(), request_id = %request_id, "Response received");

        Ok((status, bytes.to_vec()))
    }

    fn finish(&self, status: StatusCode, body: &[u8], options: &RequestOptions) -> Result<ApiEnvelope> {
        if status.is_server_error() {
            return Err(HttpError::Server {
                status: status.as_u16(),
                message: error_message(status, body),
            });
        }
        if !status.is_success() {
            return Err(HttpError::Client {
                status: status.as_u16(),
                message: error_message(status, body),
            });
        }

        let envelope = ApiEnvelope::from_body(body)?;
        match envelope.status {
            ResponseStatus::Error if !options.raw_envelope => Err(envelope.to_business_error()),
            ResponseStatus::Warning => {
                warn!(message = %envelope.message, "Server returned a warning");
                Ok(envelope)
            }
            _ => Ok(envelope),
        }
    }
}

/// Endpoints whose 401 means the credentials themselves are bad.
fn is_auth_endpoint(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    path == LOGIN_PATH || path == REFRESH_PATH
}
