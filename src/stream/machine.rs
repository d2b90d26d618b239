//! Connection state machine
//!
//! Pure transition logic, no I/O. The connection driver feeds it events and
//! performs the returned actions; tests feed it synthetic events.
//!
//! ```text
//!            Start                 handshake ok
//!   Idle ─────────────> Connecting ────────────> Open
//!    ▲                   │     ▲                  │
//!    │ attempts          │fail │ timer            │ drop
//!    │ exhausted         ▼     │                  │
//!    └──────────────── Backoff(N) <───────────────┘
//!
//!   any ── CloseRequested ──> Closing ── Closed ──> Idle
//! ```
//!
//! `Backoff(N)` waits before reconnect attempt N. A failed initial connect or
//! a dropped link enters `Backoff(1)`; a failed attempt N enters
//! `Backoff(N + 1)` unless N already reached `max_attempts`, in which case the
//! machine settles in `Idle` until the next `Start`.

use std::fmt;
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay before every attempt.
    Fixed,
    /// Delay doubles per attempt, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Bounded reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 5,
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential { max_delay } => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay.saturating_mul(1u32 << shift).min(max_delay)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// `attempt` is 0 for the initial connect, N for reconnect attempt N.
    Connecting { attempt: u32 },
    Open,
    Closing,
    Backoff { attempt: u32 },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Backoff { attempt } => write!(f, "backoff (next attempt {})", attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Someone wants the link up.
    Start,
    HandshakeSucceeded,
    HandshakeFailed,
    /// An open link closed without being asked to.
    Dropped,
    /// The backoff delay elapsed.
    TimerFired,
    CloseRequested,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect { attempt: u32 },
    ScheduleReconnect { attempt: u32, delay: Duration },
    CloseSocket,
    GiveUp { attempts: u32 },
}

/// Connection lifecycle.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
}

impl StateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Apply `event`. Events that make no sense in the current state are
    /// ignored and return `None`.
    pub fn on_event(&mut self, event: Event) -> Option<Action> {
        use ConnectionState as S;

        let (next, action) = match (self.state, event) {
            (S::Idle, Event::Start) => (S::Connecting { attempt: 0 }, Some(Action::Connect { attempt: 0 })),

            (S::Connecting { .. }, Event::HandshakeSucceeded) => (S::Open, None),
            (S::Connecting { attempt }, Event::HandshakeFailed) => self.after_failure(attempt),
            (S::Open, Event::Dropped) => self.after_failure(0),

            (S::Backoff { attempt }, Event::TimerFired) => {
                (S::Connecting { attempt }, Some(Action::Connect { attempt }))
            }

            (S::Idle, Event::CloseRequested) => return None,
            (_, Event::CloseRequested) => (S::Closing, Some(Action::CloseSocket)),
            (S::Closing, Event::Closed) => (S::Idle, None),

            _ => return None,
        };

        self.state = next;
        action
    }

    fn after_failure(&self, attempt: u32) -> (ConnectionState, Option<Action>) {
        if attempt >= self.policy.max_attempts {
            return (ConnectionState::Idle, Some(Action::GiveUp { attempts: attempt }));
        }
        let next = attempt + 1;
        (
            ConnectionState::Backoff { attempt: next },
            Some(Action::ScheduleReconnect {
                attempt: next,
                delay: self.policy.delay_for(next),
            }),
        )
    }
}
