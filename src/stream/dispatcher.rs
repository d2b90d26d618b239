//! Message Dispatcher
//!
//! Routes decoded frames to the handlers registered on one connection.
//! Exact-type handlers run first, then wildcard handlers, each group in
//! registration order. A failing or panicking handler is logged and skipped;
//! the remaining handlers still see the message.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::message::InboundMessage;
use super::target::ConnectionTarget;
use crate::error::DispatchError;

pub type SubscriptionId = u64;

/// Which messages a handler wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    Type(String),
    All,
}

impl MessageFilter {
    fn matches_exactly(&self, kind: &str) -> bool {
        matches!(self, Self::Type(t) if t == kind)
    }
}

impl From<&str> for MessageFilter {
    /// `"*"` is the wildcard.
    fn from(s: &str) -> Self {
        if s == "*" {
            Self::All
        } else {
            Self::Type(s.to_string())
        }
    }
}

impl From<String> for MessageFilter {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

/// Receives inbound messages. Closures `Fn(&InboundMessage) -> anyhow::Result<()>`
/// implement this.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        self(message)
    }
}

struct Registration {
    id: SubscriptionId,
    filter: MessageFilter,
    handler: Arc<dyn MessageHandler>,
}

pub struct Dispatcher {
    target: ConnectionTarget,
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(target: ConnectionTarget) -> Self {
        Self {
            target,
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, filter: MessageFilter, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Registration { id, filter, handler });
        id
    }

    /// Remove one registration. Returns how many remain, or `None` if `id`
    /// was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> Option<usize> {
        let mut registrations = self.lock();
        let index = registrations.iter().position(|r| r.id == id)?;
        registrations.remove(index);
        Some(registrations.len())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode a text frame, logging and dropping it if malformed.
    pub fn decode_text(&self, text: &str) -> Option<InboundMessage> {
        self.log_decode(InboundMessage::decode(text))
    }

    pub fn decode_binary(&self, bytes: &[u8]) -> Option<InboundMessage> {
        self.log_decode(InboundMessage::decode_bytes(bytes))
    }

    fn log_decode(&self, result: Result<InboundMessage, DispatchError>) -> Option<InboundMessage> {
        match result {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(target_key = %self.target, error = %e, "Dropping malformed frame");
                None
            }
        }
    }

    /// Deliver `message` to every interested handler. Returns the number of
    /// handlers that accepted it.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        // Snapshot so handlers can subscribe or unsubscribe while running.
        let handlers: Vec<(SubscriptionId, Arc<dyn MessageHandler>)> = {
            let registrations = self.lock();
            registrations
                .iter()
                .filter(|r| r.filter.matches_exactly(&message.kind))
                .chain(registrations.iter().filter(|r| r.filter == MessageFilter::All))
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect()
        };

        if handlers.is_empty() {
            debug!(target_key = %self.target, kind = %message.kind, "No handler for message");
            return 0;
        }

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(target_key = %self.target, kind = %message.kind, subscription = id, error = %e, "Handler failed");
                }
                Err(_) => {
                    error!(target_key = %self.target, kind = %message.kind, subscription = id, "Handler panicked");
                }
            }
        }
        delivered
    }
}
