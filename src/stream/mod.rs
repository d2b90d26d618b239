//! Streaming connections
//!
//! Long-lived sockets to the agent control channel and to per-suite log
//! channels, shared between any number of local subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ConnectionRegistry   target -> Connection, Subscription RAII  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Connection           driver task: handshake, backoff, ping    │
//! │   StateMachine       Idle/Connecting/Open/Closing/Backoff(N)  │
//! │   Dispatcher         type -> handlers, then wildcards         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Connector            WsConnector (tokio-tungstenite) | mock   │
//! │ TokenProvider        AuthSession, read fresh per attempt      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Module       | Concern                                      |
//! |--------------|----------------------------------------------|
//! | `target`     | Target identity and socket URLs              |
//! | `message`    | Inbound/outbound envelopes, log events       |
//! | `transport`  | Frames, `Connector`, `TokenProvider`          |
//! | `machine`    | Pure reconnect state machine                 |
//! | `connection` | Driver task per target                       |
//! | `dispatcher` | Handler table and fan-out                    |
//! | `registry`   | One connection per target, subscriptions     |
//! | `mock`       | Scripted connector and tokens for tests      |

pub mod connection;
pub mod dispatcher;
pub mod machine;
pub mod message;
pub mod mock;
pub mod registry;
pub mod target;
pub mod transport;

pub use connection::{Connection, ConnectionSettings, ConnectionStatus};
pub use dispatcher::{Dispatcher, MessageFilter, MessageHandler, SubscriptionId};
pub use machine::{BackoffStrategy, ConnectionState, ReconnectPolicy, StateMachine};
pub use message::{InboundMessage, LogEvent, OutboundMessage};
pub use registry::{ConnectionRegistry, Subscription};
pub use target::ConnectionTarget;
pub use transport::{Connector, Frame, TokenProvider, WsConnector};
