//! Connection Registry
//!
//! Keeps one [`Connection`] per target and fans local subscribers out over
//! it. Connections are created on first subscribe and stay in the map for
//! reuse; when a target's last subscriber leaves, its socket is closed
//! immediately and the connection waits in `Idle` for the next subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};

use super::connection::{Connection, ConnectionSettings, ConnectionStatus};
use super::dispatcher::{MessageFilter, MessageHandler, SubscriptionId};
use super::message::{InboundMessage, LogEvent, OutboundMessage, SUITE_LOG};
use super::target::ConnectionTarget;
use super::transport::{Connector, TokenProvider};

struct RegistryInner {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    connections: Mutex<HashMap<ConnectionTarget, Arc<Connection>>>,
}

/// Shared registry of streaming connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

/// Non-owning counterpart of [`ConnectionRegistry`] for background tasks.
#[derive(Clone)]
pub(crate) struct WeakRegistry {
    inner: Weak<RegistryInner>,
}

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<ConnectionRegistry> {
        self.inner.upgrade().map(|inner| ConnectionRegistry { inner })
    }
}

impl ConnectionRegistry {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                connector,
                tokens,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handle that does not keep the registry alive.
    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionTarget, Arc<Connection>>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connection for `target`, created in `Idle` if missing.
    fn connection_for(&self, target: &ConnectionTarget) -> Arc<Connection> {
        let mut connections = self.connections();
        let connection = connections.entry(target.clone()).or_insert_with(|| {
            debug!(target_key = %target, "Creating connection");
            Arc::new(Connection::spawn(
                target.clone(),
                self.inner.settings.clone(),
                Arc::clone(&self.inner.connector),
                Arc::clone(&self.inner.tokens),
            ))
        });
        Arc::clone(connection)
    }

    /// Register `handler` for messages of `filter` (`"*"` for all) on
    /// `target`, opening the connection if needed.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe<H: MessageHandler>(
        &self,
        target: ConnectionTarget,
        filter: impl Into<MessageFilter>,
        handler: H,
    ) -> Subscription {
        let connection = self.connection_for(&target);
        let id = connection.attach(filter.into(), Arc::new(handler));
        debug!(target_key = %target, subscription = id, "Subscribed");
        Subscription {
            connection,
            id: Some(id),
        }
    }

    /// Subscribe to a suite's log lines as typed [`LogEvent`]s.
    pub fn subscribe_suite_logs<F>(&self, suite_id: impl Into<String>, on_event: F) -> Subscription
    where
        F: Fn(LogEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            ConnectionTarget::suite_log(suite_id),
            SUITE_LOG,
            move |message: &InboundMessage| -> anyhow::Result<()> {
                on_event(message.data_as::<LogEvent>()?);
                Ok(())
            },
        )
    }

    /// Send on `target`'s connection. False if there is none or it is not
    /// open.
    pub fn send(&self, target: &ConnectionTarget, message: &OutboundMessage) -> bool {
        let connection = self.connections().get(target).cloned();
        match connection {
            Some(connection) => connection.send(message),
            None => false,
        }
    }

    pub fn connection(&self, target: &ConnectionTarget) -> Option<Arc<Connection>> {
        self.connections().get(target).cloned()
    }

    pub fn status(&self, target: &ConnectionTarget) -> Option<ConnectionStatus> {
        self.connection(target).map(|c| c.status())
    }

    /// Retry a connection that gave up, if it still has subscribers.
    pub fn reconnect(&self, target: &ConnectionTarget) -> bool {
        match self.connection(target) {
            Some(connection) if connection.subscriber_count() > 0 => {
                connection.ensure_open();
                true
            }
            _ => false,
        }
    }

    /// Drop `target`'s subscribers and close its socket.
    pub fn close(&self, target: &ConnectionTarget) {
        let removed = self.connections().remove(target);
        if let Some(connection) = removed {
            connection.shutdown();
            info!(target_key = %target, "Connection torn down");
        }
    }

    /// Close every connection and drop every subscription.
    pub fn teardown_all(&self) {
        let drained: Vec<Arc<Connection>> = self.connections().drain().map(|(_, c)| c).collect();
        if drained.is_empty() {
            return;
        }
        for connection in &drained {
            connection.shutdown();
        }
        info!(count = drained.len(), "All connections torn down");
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One handler registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    connection: Arc<Connection>,
    id: Option<SubscriptionId>,
}

impl Subscription {
    pub fn target(&self) -> &ConnectionTarget {
        self.connection.target()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Watch the connection this subscription rides on.
    pub fn watch(&self) -> tokio::sync::watch::Receiver<ConnectionStatus> {
        self.connection.watch()
    }

    /// Remove exactly this registration.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.connection.detach(id);
            debug!(target_key = %self.connection.target(), subscription = id, "Unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::machine::ConnectionState;
    use crate::stream::mock::{MockConnector, MockTokens};
    use std::time::Duration;
    use url::Url;

    fn registry() -> (ConnectionRegistry, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let registry = ConnectionRegistry::new(
            ConnectionSettings::new(Url::parse("ws://localhost:8000").unwrap()),
            connector.clone(),
            Arc::new(MockTokens::new("a1")),
        );
        (registry, connector)
    }

    fn noop(_: &InboundMessage) -> anyhow::Result<()> {
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_subscribers_share_one_socket() {
        let (registry, connector) = registry();

        let subs: Vec<Subscription> = (0..5)
            .map(|_| registry.subscribe(ConnectionTarget::Agent, "*", noop))
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(registry.len(), 1);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(registry.connection(&ConnectionTarget::Agent).unwrap().subscriber_count(), 5);
        drop(subs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_closes_but_keeps_entry() {
        let (registry, connector) = registry();
        let a = registry.subscribe(ConnectionTarget::Agent, "status", noop);
        let b = registry.subscribe(ConnectionTarget::Agent, "*", noop);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let conn = registry.connection(&ConnectionTarget::Agent).unwrap();
        assert!(conn.is_open());

        a.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.is_open());

        drop(b);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(registry.len(), 1);

        // Resubscribing reuses the entry and dials again
        let _c = registry.subscribe(ConnectionTarget::Agent, "*", noop);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.is_open());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_connection() {
        let (registry, _connector) = registry();
        let msg = OutboundMessage::new("heartbeat");
        assert!(!registry.send(&ConnectionTarget::Agent, &msg));

        let _sub = registry.subscribe(ConnectionTarget::Agent, "*", noop);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.send(&ConnectionTarget::Agent, &msg));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_all_clears_everything() {
        let (registry, _connector) = registry();
        let agent = registry.subscribe(ConnectionTarget::Agent, "*", noop);
        let logs = registry.subscribe(ConnectionTarget::suite_log("s1"), "*", noop);
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.teardown_all();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.is_empty());
        assert_eq!(agent.status().state, ConnectionState::Idle);
        assert_eq!(logs.status().state, ConnectionState::Idle);
        assert!(!registry.send(&ConnectionTarget::Agent, &OutboundMessage::new("x")));
    }
}
