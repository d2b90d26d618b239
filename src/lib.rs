//! ats-client - authenticated, reconnecting client core for the ATS
//! test-management platform
//!
//! Everything a front end needs beneath its screens: token lifecycle, REST
//! calls that survive access-token expiry, and shared streaming channels that
//! survive network blips.
//!
//! ## Components
//!
//! - **Credentials**: durable token slot (`credentials.json`)
//! - **Auth**: login, single-flight refresh, logout, session events
//! - **Gateway**: REST with bearer auth, request ids, envelope unwrapping and
//!   the 401 → refresh → retry-once protocol
//! - **Stream**: one reconnecting socket per target (agent channel, suite
//!   logs) fanned out to any number of subscribers
//! - **Client**: [`AtsClient`] wiring it all from a [`ClientConfig`]

pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod stream;

pub use auth::{AuthSession, AuthState, Credentials, SessionEvent, TokenPair, UserProfile};
pub use client::AtsClient;
pub use config::{Args, ClientConfig};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{AuthError, ClientError, ConnectionError, DispatchError, HttpError, Result};
pub use gateway::{ApiEnvelope, HttpGateway, RequestOptions};
pub use stream::{
    ConnectionRegistry, ConnectionState, ConnectionTarget, InboundMessage, LogEvent,
    OutboundMessage, Subscription,
};
