//! Scripted connector for tests
//!
//! Stands in for a socket server. Every accepted connection is handed to the
//! test as a [`MockSocket`] through which it can push frames, read what the
//! client sent, or drop the link.

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use super::transport::{Connector, Frame, FrameSink, FrameStream, TokenProvider};
use crate::error::ConnectionError;

/// Test side of one accepted connection.
pub struct MockSocket {
    pub url: Url,
    to_client: fmpsc::UnboundedSender<Result<Frame, ConnectionError>>,
    from_client: fmpsc::UnboundedReceiver<Frame>,
}

impl MockSocket {
    /// Deliver a frame to the client. False once the client side is gone.
    pub fn push(&self, frame: Frame) -> bool {
        self.to_client.unbounded_send(Ok(frame)).is_ok()
    }

    pub fn push_text(&self, text: &str) -> bool {
        self.push(Frame::text(text))
    }

    /// Close from the server side with `code`, then hang up.
    pub fn close_with(self, code: u16, reason: &str) {
        let _ = self.to_client.unbounded_send(Ok(Frame::close(code, reason)));
    }

    /// Hang up without a close frame.
    pub fn drop_link(self) {}

    /// Next frame the client wrote, waiting for it.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }

    /// Next frame the client wrote, if one is already queued.
    pub fn try_sent(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }

    /// Token the client put on the URL.
    pub fn token(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    }
}

/// Connector whose behaviour is switched by the test.
pub struct MockConnector {
    accepting: AtomicBool,
    hanging: AtomicBool,
    attempts: Mutex<Vec<Url>>,
    sockets_tx: mpsc::UnboundedSender<MockSocket>,
    sockets_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockSocket>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Accepts every connection.
    pub fn new() -> Self {
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        Self {
            accepting: AtomicBool::new(true),
            hanging: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
            sockets_tx,
            sockets_rx: tokio::sync::Mutex::new(sockets_rx),
        }
    }

    /// Refuse (false) or accept (true) subsequent handshakes.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Make subsequent handshakes never complete.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Number of handshakes attempted so far.
    pub fn attempts(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or_default()
    }

    pub fn attempted_urls(&self) -> Vec<Url> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Wait for the next accepted connection.
    pub async fn next_socket(&self) -> Option<MockSocket> {
        self.sockets_rx.lock().await.recv().await
    }

    pub async fn try_next_socket(&self) -> Option<MockSocket> {
        self.sockets_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), ConnectionError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(url.clone());
        }
        if self.hanging.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConnectionError::HandshakeFailed("connection refused".into()));
        }

        let (to_client, client_stream) = fmpsc::unbounded();
        let (client_sink, from_client) = fmpsc::unbounded();

        let _ = self.sockets_tx.send(MockSocket {
            url: url.clone(),
            to_client,
            from_client,
        });

        let sink = client_sink.sink_map_err(|e| ConnectionError::Transport(e.to_string()));
        Ok((Box::pin(sink), client_stream.boxed()))
    }
}

/// Token provider with a settable token that records rejections.
#[derive(Default)]
pub struct MockTokens {
    token: Mutex<Option<String>>,
    rejected: Mutex<Vec<String>>,
    reject_delay: Mutex<Duration>,
}

impl MockTokens {
    pub fn new(token: &str) -> Self {
        Self {
            token: Mutex::new(Some(token.to_string())),
            rejected: Mutex::new(Vec::new()),
            reject_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make each rejection take `delay` to settle, like a slow refresh.
    pub fn set_reject_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.reject_delay.lock() {
            *slot = delay;
        }
    }

    pub fn set(&self, token: Option<&str>) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = token.map(str::to_string);
        }
    }

    pub fn rejected(&self) -> Vec<String> {
        self.rejected.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TokenProvider for MockTokens {
    async fn access_token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    async fn token_rejected(&self, token: &str) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.push(token.to_string());
        }
        let delay = self.reject_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
