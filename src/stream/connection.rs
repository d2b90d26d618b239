//! Connection
//!
//! One reconnecting socket to one target. A long-lived driver task owns the
//! socket and the [`StateMachine`]; the [`Connection`] handle talks to it over
//! a command channel and observes it through a watch channel.
//!
//! ```text
//! Connection ──Command──> driver task ──Frame──> socket
//!     ▲                       │
//!     └──watch<Status>────────┤
//!                             └──InboundMessage──> Dispatcher ──> handlers
//! ```
//!
//! Inbound frames are dispatched on the driver task itself, so every handler
//! sees a target's messages in wire order. Dropping the last handle stops the
//! driver, including any pending reconnect timer.

use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use super::dispatcher::{Dispatcher, MessageFilter, MessageHandler, SubscriptionId};
use super::machine::{Action, ConnectionState, Event, ReconnectPolicy, StateMachine};
use super::message::{OutboundMessage, PING, PONG};
use super::target::ConnectionTarget;
use super::transport::{CloseInfo, Connector, Frame, FrameSink, FrameStream, TokenProvider, CLOSE_POLICY_VIOLATION};
use crate::error::ConnectionError;

const OUTBOUND_CAPACITY: usize = 64;

/// Timing and reconnect settings shared by every connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// `ws://` or `wss://` root the per-target paths are appended to.
    pub ws_base: Url,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionSettings {
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Observable connection status. `error` carries the reason the connection
/// last settled in `Idle` on its own, e.g. exhausted attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<ConnectionError>,
}

#[derive(Debug)]
enum Command {
    EnsureOpen,
    Close,
}

/// Handle to one target's connection.
pub struct Connection {
    target: ConnectionTarget,
    commands: mpsc::UnboundedSender<Command>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Frame>>>>,
    status: watch::Receiver<ConnectionStatus>,
    dispatcher: Arc<Dispatcher>,
    /// Serializes subscriber changes with the commands they imply.
    membership: Mutex<()>,
}

impl Connection {
    /// Create the connection and its driver task. The connection starts in
    /// `Idle`; nothing is dialed until [`Connection::ensure_open`].
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        target: ConnectionTarget,
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Idle,
            error: None,
        });
        let outbound = Arc::new(Mutex::new(None));
        let dispatcher = Arc::new(Dispatcher::new(target.clone()));

        let driver = Driver {
            machine: StateMachine::new(settings.reconnect),
            target: target.clone(),
            settings,
            connector,
            tokens,
            dispatcher: Arc::clone(&dispatcher),
            commands: commands_rx,
            outbound: Arc::clone(&outbound),
            status: status_tx,
        };
        tokio::spawn(driver.run());

        Self {
            target,
            commands: commands_tx,
            outbound,
            status: status_rx,
            dispatcher,
            membership: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Bring the link up. No-op while connecting, open or waiting to
    /// reconnect.
    pub fn ensure_open(&self) {
        self.command(Command::EnsureOpen);
    }

    /// Close the link and cancel any pending reconnect. Subscribers stay
    /// registered.
    pub fn close(&self) {
        self.command(Command::Close);
    }

    /// Send a message if the link is open. Nothing is queued for later.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(target_key = %self.target, error = %e, "Outbound message dropped");
                false
            }
        }
    }

    pub fn try_send(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(ConnectionError::NotOpen)?;
        sender
            .try_send(Frame::Text(message.to_text()))
            .map_err(|_| ConnectionError::NotOpen)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Receiver that yields every status change.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.dispatcher.len()
    }

    /// Register a handler and make sure the link is up.
    pub(crate) fn attach(&self, filter: MessageFilter, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let _membership = lock(&self.membership);
        let id = self.dispatcher.register(filter, handler);
        self.command(Command::EnsureOpen);
        id
    }

    /// Remove a handler; the last one out closes the link.
    pub(crate) fn detach(&self, id: SubscriptionId) {
        let _membership = lock(&self.membership);
        if self.dispatcher.unregister(id) == Some(0) {
            debug!(target_key = %self.target, "Last subscriber left, closing");
            self.command(Command::Close);
        }
    }

    /// Drop every handler and close.
    pub(crate) fn shutdown(&self) {
        let _membership = lock(&self.membership);
        self.dispatcher.clear();
        self.command(Command::Close);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(target_key = %self.target, "Connection driver is gone");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How an open session ended.
enum SessionEnd {
    Dropped(Option<CloseInfo>),
    Closed,
    Shutdown,
}

/// Whether the driver keeps running.
enum Flow {
    Continue,
    Exit,
}

struct Driver {
    machine: StateMachine,
    target: ConnectionTarget,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    dispatcher: Arc<Dispatcher>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Frame>>>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let flow = match self.machine.state() {
                ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Open => {
                    match self.commands.recv().await {
                        Some(command) => self.on_idle_command(command),
                        None => Flow::Exit,
                    }
                }
                ConnectionState::Connecting { attempt } => self.connect(attempt).await,
                ConnectionState::Backoff { attempt } => self.backoff(attempt).await,
            };
            if let Flow::Exit = flow {
                debug!(target_key = %self.target, "Connection driver stopped");
                return;
            }
        }
    }

    fn on_idle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::EnsureOpen => {
                self.apply(Event::Start);
            }
            Command::Close => {}
        }
        Flow::Continue
    }

    /// Apply an event, publish the new status and log the action.
    fn apply(&mut self, event: Event) -> Option<Action> {
        let action = self.machine.on_event(event);
        let state = self.machine.state();

        let error = match action {
            Some(Action::GiveUp { attempts }) => {
                error!(target_key = %self.target, attempts, "Reconnect attempts exhausted");
                Some(ConnectionError::AttemptsExhausted { attempts })
            }
            Some(Action::ScheduleReconnect { attempt, delay }) => {
                info!(target_key = %self.target, attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                None
            }
            _ => None,
        };

        self.status.send_modify(|status| {
            status.state = state;
            if event == Event::Start || error.is_some() {
                status.error = error;
            }
        });
        action
    }

    /// Run the close sequence from any state.
    fn close_now(&mut self) {
        if self.apply(Event::CloseRequested).is_some() {
            self.apply(Event::Closed);
            info!(target_key = %self.target, "Connection closed");
        }
    }

    async fn connect(&mut self, attempt: u32) -> Flow {
        debug!(target_key = %self.target, attempt, "Opening connection");
        let handshake = handshake(
            Arc::clone(&self.connector),
            Arc::clone(&self.tokens),
            self.target.clone(),
            self.settings.ws_base.clone(),
            self.settings.handshake_timeout,
        );
        tokio::pin!(handshake);

        let result = loop {
            tokio::select! {
                result = &mut handshake => break result,
                command = self.commands.recv() => match command {
                    Some(Command::EnsureOpen) => {}
                    Some(Command::Close) => {
                        self.close_now();
                        return Flow::Continue;
                    }
                    None => return Flow::Exit,
                },
            }
        };

        match result {
            Ok((sink, stream, token)) => {
                self.apply(Event::HandshakeSucceeded);
                info!(target_key = %self.target, attempt, "Connection open");
                self.session(sink, stream, token).await
            }
            Err(e) => {
                warn!(target_key = %self.target, attempt, error = %e, "Connection attempt failed");
                self.apply(Event::HandshakeFailed);
                Flow::Continue
            }
        }
    }

    async fn backoff(&mut self, attempt: u32) -> Flow {
        let timer = sleep(self.machine.policy().delay_for(attempt));
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => {
                    self.apply(Event::TimerFired);
                    return Flow::Continue;
                }
                command = self.commands.recv() => match command {
                    Some(Command::EnsureOpen) => {}
                    Some(Command::Close) => {
                        self.close_now();
                        return Flow::Continue;
                    }
                    None => return Flow::Exit,
                },
            }
        }
    }

    /// Pump an open socket until it drops or is closed.
    async fn session(&mut self, mut sink: FrameSink, mut stream: FrameStream, token: String) -> Flow {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *lock(&self.outbound) = Some(outbound_tx);

        let ping_interval = self.settings.ping_interval;
        let liveness_timeout = self.settings.liveness_timeout;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let liveness = sleep(liveness_timeout);
        tokio::pin!(liveness);

        let end = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        liveness.as_mut().reset(Instant::now() + liveness_timeout);
                        if let Some(info) = self.on_frame(frame, &mut sink).await {
                            break SessionEnd::Dropped(info);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(target_key = %self.target, error = %e, "Socket error");
                        break SessionEnd::Dropped(None);
                    }
                    None => break SessionEnd::Dropped(None),
                },
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(target_key = %self.target, error = %e, "Send failed");
                        break SessionEnd::Dropped(None);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Frame::Ping(Vec::new())).await {
                        warn!(target_key = %self.target, error = %e, "Ping failed");
                        break SessionEnd::Dropped(None);
                    }
                }
                _ = &mut liveness => {
                    warn!(target_key = %self.target, timeout_secs = liveness_timeout.as_secs(), "No traffic within liveness timeout");
                    break SessionEnd::Dropped(None);
                }
                command = self.commands.recv() => match command {
                    Some(Command::EnsureOpen) => {}
                    Some(Command::Close) => break SessionEnd::Closed,
                    None => break SessionEnd::Shutdown,
                },
            }
        };

        *lock(&self.outbound) = None;

        match end {
            SessionEnd::Dropped(info) => {
                let rejected = matches!(&info, Some(close) if close.code == CLOSE_POLICY_VIOLATION);
                info!(
                    target_key = %self.target,
                    code = ?info.as_ref().map(|c| c.code),
                    "Connection dropped"
                );
                if rejected {
                    warn!(target_key = %self.target, "Server rejected the access token");
                    let tokens = Arc::clone(&self.tokens);
                    let refresh = tokens.token_rejected(&token);
                    tokio::pin!(refresh);
                    // Stay responsive to close and shutdown while the refresh runs.
                    loop {
                        tokio::select! {
                            _ = &mut refresh => break,
                            command = self.commands.recv() => match command {
                                Some(Command::EnsureOpen) => {}
                                Some(Command::Close) => {
                                    self.apply(Event::Dropped);
                                    self.close_now();
                                    return Flow::Continue;
                                }
                                None => return Flow::Exit,
                            },
                        }
                    }
                }
                self.apply(Event::Dropped);
                Flow::Continue
            }
            SessionEnd::Closed => {
                let _ = sink.send(Frame::Close(None)).await;
                let _ = sink.close().await;
                self.close_now();
                Flow::Continue
            }
            SessionEnd::Shutdown => {
                let _ = sink.send(Frame::Close(None)).await;
                let _ = sink.close().await;
                Flow::Exit
            }
        }
    }

    /// Handle one inbound frame. Returns `Some` when the server closed.
    async fn on_frame(&self, frame: Frame, sink: &mut FrameSink) -> Option<Option<CloseInfo>> {
        let message = match frame {
            Frame::Text(text) => self.dispatcher.decode_text(&text),
            Frame::Binary(data) => self.dispatcher.decode_binary(&data),
            Frame::Ping(_) | Frame::Pong(_) => None,
            Frame::Close(info) => return Some(info),
        };
        let message = message?;

        match message.kind.as_str() {
            PING => {
                if let Err(e) = sink.send(Frame::Text(OutboundMessage::pong().to_text())).await {
                    debug!(target_key = %self.target, error = %e, "Failed to answer ping");
                }
            }
            PONG => {}
            _ => {
                self.dispatcher.dispatch(&message);
            }
        }
        None
    }
}

async fn handshake(
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    target: ConnectionTarget,
    ws_base: Url,
    handshake_timeout: Duration,
) -> Result<(FrameSink, FrameStream, String), ConnectionError> {
    let token = tokens
        .access_token()
        .await
        .ok_or_else(|| ConnectionError::HandshakeFailed("no access token".into()))?;
    let url = target.endpoint_url(&ws_base, &token)?;

    let (sink, stream) = timeout(handshake_timeout, connector.connect(&url))
        .await
        .map_err(|_| ConnectionError::HandshakeFailed("handshake timed out".into()))??;
    Ok((sink, stream, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::message::InboundMessage;
    use crate::stream::mock::{MockConnector, MockTokens};

    fn settings() -> ConnectionSettings {
        ConnectionSettings::new(Url::parse("ws://localhost:8000").unwrap())
    }

    fn spawn(connector: &Arc<MockConnector>, tokens: &Arc<MockTokens>) -> Connection {
        Connection::spawn(
            ConnectionTarget::Agent,
            settings(),
            connector.clone(),
            tokens.clone(),
        )
    }

    async fn wait_for(conn: &Connection, state: ConnectionState) {
        let mut watch = conn.watch();
        while watch.borrow_and_update().state != state {
            watch.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_open_connects_once() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::new("a1"));
        let conn = spawn(&connector, &tokens);
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.ensure_open();
        conn.ensure_open();
        wait_for(&conn, ConnectionState::Open).await;
        conn.ensure_open();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.attempts(), 1);
        let socket = connector.next_socket().await.unwrap();
        assert_eq!(socket.token().as_deref(), Some("a1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_while_open() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::new("a1"));
        let conn = spawn(&connector, &tokens);
        let msg = OutboundMessage::new("cancel_execution").with("execution_id", "e1");

        assert!(!conn.send(&msg));
        assert_eq!(conn.try_send(&msg), Err(ConnectionError::NotOpen));

        conn.ensure_open();
        wait_for(&conn, ConnectionState::Open).await;
        let mut socket = connector.next_socket().await.unwrap();

        assert!(conn.send(&msg));
        assert_eq!(
            socket.next_sent().await,
            Some(Frame::text(r#"{"type":"cancel_execution","execution_id":"e1"}"#))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ping_is_answered_and_not_forwarded() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::new("a1"));
        let conn = spawn(&connector, &tokens);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.attach(
            MessageFilter::All,
            Arc::new(move |m: &InboundMessage| -> anyhow::Result<()> {
                sink.lock().unwrap().push(m.kind.clone());
                Ok(())
            }),
        );
        wait_for(&conn, ConnectionState::Open).await;
        let mut socket = connector.next_socket().await.unwrap();

        socket.push_text(r#"{"type":"ping"}"#);
        assert_eq!(socket.next_sent().await, Some(Frame::text(r#"{"type":"pong"}"#)));
        socket.push_text(r#"{"type":"pong"}"#);
        socket.push_text(r#"{"type":"connected"}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["connected".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timeout_drops_silent_link() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::new("a1"));
        let conn = spawn(&connector, &tokens);
        conn.ensure_open();
        wait_for(&conn, ConnectionState::Open).await;
        let mut socket = connector.next_socket().await.unwrap();

        // Transport pings go out on the ping interval
        assert_eq!(socket.next_sent().await, Some(Frame::Ping(Vec::new())));

        // Nothing comes back, so the link is declared dead
        wait_for(&conn, ConnectionState::Backoff { attempt: 1 }).await;
        wait_for(&conn, ConnectionState::Open).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_counts_as_failure() {
        let connector = Arc::new(MockConnector::new());
        connector.set_hanging(true);
        let tokens = Arc::new(MockTokens::new("a1"));
        let conn = spawn(&connector, &tokens);

        conn.ensure_open();
        wait_for(&conn, ConnectionState::Backoff { attempt: 1 }).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_violation_close_reports_rejected_token() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::new("a1"));
        let conn = spawn(&connector, &tokens);
        conn.ensure_open();
        wait_for(&conn, ConnectionState::Open).await;

        let socket = connector.next_socket().await.unwrap();
        tokens.set(Some("a2"));
        socket.close_with(CLOSE_POLICY_VIOLATION, "invalid token");

        wait_for(&conn, ConnectionState::Backoff { attempt: 1 }).await;
        assert_eq!(tokens.rejected(), vec!["a1".to_string()]);

        wait_for(&conn, ConnectionState::Open).await;
        let socket = connector.next_socket().await.unwrap();
        assert_eq!(socket.token().as_deref(), Some("a2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_token_refresh_is_prompt() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::new("a1"));
        tokens.set_reject_delay(Duration::from_secs(30));
        let conn = spawn(&connector, &tokens);
        conn.ensure_open();
        wait_for(&conn, ConnectionState::Open).await;

        let socket = connector.next_socket().await.unwrap();
        socket.close_with(CLOSE_POLICY_VIOLATION, "invalid token");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tokens.rejected(), vec!["a1".to_string()]);
        assert_eq!(conn.state(), ConnectionState::Open);

        let started = Instant::now();
        conn.close();
        wait_for(&conn, ConnectionState::Idle).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        // No reconnect once the refresh would have finished.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_is_a_failed_attempt() {
        let connector = Arc::new(MockConnector::new());
        let tokens = Arc::new(MockTokens::default());
        let conn = spawn(&connector, &tokens);

        conn.ensure_open();
        wait_for(&conn, ConnectionState::Backoff { attempt: 1 }).await;
        assert_eq!(connector.attempts(), 0);
    }
}
