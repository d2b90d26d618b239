//! Client facade
//!
//! Wires the credential store, auth session, HTTP gateway and connection
//! registry together from one [`ClientConfig`].

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::auth::{AuthExchange, AuthSession, Credentials, HttpAuthExchange, SessionEvent, TokenPair};
use crate::config::ClientConfig;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::error::{AuthError, ClientError};
use crate::gateway::HttpGateway;
use crate::stream::{ConnectionRegistry, Connector, TokenProvider, WsConnector};

/// Authenticated, reconnecting client for the ATS platform.
///
/// When the session expires (refresh rejected, or a retried request rejected
/// again), every streaming connection is torn down.
#[derive(Clone)]
pub struct AtsClient {
    config: ClientConfig,
    auth: AuthSession,
    gateway: HttpGateway,
    streams: ConnectionRegistry,
}

impl AtsClient {
    /// Production client: file-backed credentials, reqwest, tokio-tungstenite.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let exchange = HttpAuthExchange::new(config.api_base(), config.request_timeout)?;
        let store = FileCredentialStore::new(config.credentials_path.clone());
        Self::with_parts(config, Arc::new(exchange), Arc::new(store), Arc::new(WsConnector))
    }

    /// Client over caller-supplied auth exchange, credential store and socket
    /// connector.
    pub fn with_parts(
        config: ClientConfig,
        exchange: Arc<dyn AuthExchange>,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let settings = config.connection_settings().map_err(ClientError::Config)?;
        let auth = AuthSession::new(exchange, store);
        let gateway = HttpGateway::new(config.api_base(), config.request_timeout, auth.clone())?;
        let tokens: Arc<dyn TokenProvider> = Arc::new(auth.clone());
        let streams = ConnectionRegistry::new(settings, connector, tokens);

        spawn_expiry_watch(&auth, &streams);

        Ok(Self {
            config,
            auth,
            gateway,
            streams,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn gateway(&self) -> &HttpGateway {
        &self.gateway
    }

    pub fn streams(&self) -> &ConnectionRegistry {
        &self.streams
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<TokenPair, AuthError> {
        self.auth.login(credentials).await
    }

    /// Pick up a previously persisted session.
    pub fn restore(&self) -> bool {
        self.auth.restore()
    }

    /// End the session and close every streaming connection.
    pub async fn logout(&self) {
        self.streams.teardown_all();
        self.auth.logout().await;
    }
}

/// Tear down streams whenever the session expires. Holds the registry
/// weakly; the task ends once either the registry or the session is gone.
fn spawn_expiry_watch(auth: &AuthSession, streams: &ConnectionRegistry) {
    let mut events = auth.events();
    let streams = streams.downgrade();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Expired) => match streams.upgrade() {
                    Some(registry) => {
                        info!("Session expired, closing streaming connections");
                        registry.teardown_all();
                    }
                    None => return,
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Session event watcher lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    });
}
