//! Standard response envelope
//!
//! Every `/api/v1` response is wrapped as
//! `{status: success|error|warning, message, data, code, timestamp, requestId?}`.
//! Bodies that are not shaped like an envelope are treated as bare `data`.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, alias = "requestId")]
    pub request_id: Option<String>,
}

impl ApiEnvelope {
    /// Wrap a bare payload as a successful envelope.
    pub fn success(data: Option<Value>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: String::new(),
            data,
            code: None,
            timestamp: None,
            request_id: None,
        }
    }

    /// Parse a response body. Empty bodies are a success with no data.
    pub fn from_body(body: &[u8]) -> Result<Self, HttpError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::success(None));
        }
        let value: Value = serde_json::from_slice(body)?;
        if looks_like_envelope(&value) {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(Self::success(Some(value)))
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// Business error for an `error` envelope.
    pub fn to_business_error(&self) -> HttpError {
        HttpError::Business {
            message: self.message.clone(),
            code: self.code.unwrap_or_default(),
        }
    }

    /// Decode `data` into `T`. Missing data decodes as JSON `null`, which
    /// suits `()` and `Option<_>` targets.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let value = self.data.unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(HttpError::from)
    }
}

fn looks_like_envelope(value: &Value) -> bool {
    matches!(
        value.get("status").and_then(Value::as_str),
        Some("success" | "error" | "warning")
    )
}

/// Human-readable message for a non-2xx response: `message`, then FastAPI's
/// `detail`, then the canonical reason phrase.
pub fn error_message(status: StatusCode, body: &[u8]) -> String {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let field = |name: &str| {
        parsed.as_ref().and_then(|v| v.get(name)).and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Null | Value::String(_) => None,
            other => Some(other.to_string()),
        })
    };
    field("message")
        .or_else(|| field("detail"))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_string())
}
