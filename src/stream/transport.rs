//! Socket transport seam
//!
//! The connection driver only sees [`Frame`]s flowing through a boxed sink
//! and stream. [`WsConnector`] produces them from a tokio-tungstenite socket;
//! tests plug in [`crate::stream::mock::MockConnector`] instead.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthSession;
use crate::error::ConnectionError;

/// Close code the server uses when the token on the URL is not accepted.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// One socket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseInfo {
            code,
            reason: reason.into(),
        }))
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(info) => Message::Close(info.map(|info| CloseFrame {
                code: CloseCode::from(info.code),
                reason: info.reason.into(),
            })),
        }
    }
}

fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(frame) => Some(Frame::Close(frame.map(|f| CloseInfo {
            code: u16::from(f.code),
            reason: f.reason.into_owned(),
        }))),
        // Raw frames only show up when writing
        Message::Frame(_) => None,
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<Frame, ConnectionError>>;

/// Opens a socket to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), ConnectionError>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), ConnectionError> {
        debug!(host = url.host_str().unwrap_or_default(), path = url.path(), "Connecting to WebSocket");

        let (ws, _) = connect_async(url.as_str()).await?;
        let (write, read) = ws.split();

        let sink = write
            .with(|frame: Frame| future::ready(Ok::<Message, WsError>(frame.into())))
            .sink_map_err(|e| ConnectionError::Transport(e.to_string()));

        let stream = read.filter_map(|item| {
            future::ready(match item {
                Ok(message) => frame_from_message(message).map(Ok),
                Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), stream.boxed()))
    }
}

/// Supplies the token for each connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Token to put on the next connection URL. Read fresh on every attempt.
    async fn access_token(&self) -> Option<String>;

    /// The server closed the socket because `token` was not accepted.
    async fn token_rejected(&self, _token: &str) {}
}

#[async_trait]
impl TokenProvider for AuthSession {
    async fn access_token(&self) -> Option<String> {
        self.current_access_token()
    }

    async fn token_rejected(&self, token: &str) {
        if let Err(e) = self.refresh_from(Some(token)).await {
            warn!(error = %e, "Refresh after socket token rejection failed");
        }
    }
}
