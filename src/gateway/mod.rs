//! HTTP Gateway
//!
//! Every REST call the platform makes goes through [`HttpGateway::request`]:
//!
//! ```text
//! caller ──> HttpGateway ──(Bearer, X-Request-ID)──> /api/v1/...
//!               │    ▲
//!      401 ─────┘    └── retry once with refreshed token
//!               ▼
//!          AuthSession::refresh_from(rejected)   (single-flight)
//! ```
//!
//! The gateway itself holds no auth state.

pub mod client;
pub mod envelope;

pub use client::{HttpGateway, RequestOptions};
pub use envelope::{ApiEnvelope, ResponseStatus};

use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Fresh request id, e.g. `req_5f0c...`.
pub fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}
