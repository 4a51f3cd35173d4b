//! Connection state machine
//!
//! [`ConnectionState`] is the single source of truth exposed to the UI. All
//! changes go through [`transition`], which maps the current state and a
//! [`Trigger`] to the next state (or rejects the trigger). [`StateMachine`]
//! holds the live value and publishes [`ManagerEvent`]s to subscribers.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    NoConfigSelected,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    AuthFailed,
    Error,
}

impl ConnectionState {
    /// Status text shown next to the connect button
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::NoConfigSelected => "Select a configuration",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::AuthFailed => "Authentication failed",
            ConnectionState::Error => "Error",
        }
    }

    /// A tunnel is starting or up
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Something that happened to the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ConfigSelected,
    ConfigCleared,
    ConnectRequested,
    /// "Initialization Sequence Completed" seen in the log
    SuccessMarker,
    /// Status poller reported `connected` enough times in a row
    StatusConnectedStreak,
    AuthFailure,
    /// Fatal marker, timeout, launch failure, poll escalation or unexpected exit
    Failure,
    DisconnectRequested,
    /// Status poller reported the tunnel gone while connected
    ProcessGone,
    TeardownComplete,
}

/// The transition function. `None` means the trigger is ignored in `current`.
pub fn transition(current: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (current, trigger) {
        (NoConfigSelected | AuthFailed | Error, Trigger::ConfigSelected) => Some(Disconnected),
        (Disconnected | AuthFailed | Error, Trigger::ConfigCleared) => Some(NoConfigSelected),
        (NoConfigSelected | Disconnected | AuthFailed | Error, Trigger::ConnectRequested) => {
            Some(Connecting)
        }
        (Connecting, Trigger::SuccessMarker | Trigger::StatusConnectedStreak) => Some(Connected),
        (Connecting | Connected, Trigger::AuthFailure) => Some(AuthFailed),
        (Connecting | Connected, Trigger::Failure) => Some(Error),
        (Connecting | Connected, Trigger::DisconnectRequested) => Some(Disconnecting),
        (Connected, Trigger::ProcessGone) => Some(Disconnected),
        (Disconnecting, Trigger::TeardownComplete) => Some(Disconnected),
        _ => None,
    }
}

/// Why a session ended up in `Error` or `AuthFailed`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionFailure {
    #[error("Failed to launch helper: {0}")]
    Launch(String),
    #[error("{message}\n{hint}")]
    Privilege { message: String, hint: String },
    #[error("Authentication failed. Please check your credentials.")]
    Authentication,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Could not resolve the VPN server address: {0}")]
    ResolveFailed(String),
    #[error("OpenVPN reported a fatal error: {0}")]
    Fatal(String),
    #[error("Status checks keep failing: {0}")]
    PollFailure(String),
    #[error("Connection process terminated unexpectedly")]
    UnexpectedExit,
    #[error("Connection attempt timed out after {0} seconds")]
    Timeout(u64),
    #[error("Helper did not finish starting within {0} seconds")]
    HandshakeTimeout(u64),
}

impl SessionFailure {
    pub fn trigger(&self) -> Trigger {
        match self {
            SessionFailure::Authentication => Trigger::AuthFailure,
            _ => Trigger::Failure,
        }
    }
}

/// Notification published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ManagerEvent {
    StateChanged(ConnectionState),
    Log(String),
    Failed(SessionFailure),
    /// Teardown finished; no process, auth file or firewall rule is left behind
    SessionEnded,
}

pub struct StateMachine {
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ManagerEvent>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(ConnectionState::NoConfigSelected),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Sets the state and notifies. Returns `false` if it already was `new_state`.
    pub fn set_state(&self, new_state: ConnectionState) -> bool {
        let mut state = self.lock();
        if *state == new_state {
            return false;
        }
        *state = new_state;
        info!("VPN state changed to: {:?}", new_state);
        // Sent under the lock so notifications keep transition order
        let _ = self.events.send(ManagerEvent::StateChanged(new_state));
        true
    }

    /// Applies `trigger` through [`transition`]. Returns the new state if it changed.
    pub fn apply(&self, trigger: Trigger) -> Option<ConnectionState> {
        let mut state = self.lock();
        let Some(next) = transition(*state, trigger) else {
            debug!("Ignoring {:?} in state {:?}", trigger, *state);
            return None;
        };
        if next == *state {
            return None;
        }
        *state = next;
        info!("VPN state changed to: {:?} ({:?})", next, trigger);
        let _ = self.events.send(ManagerEvent::StateChanged(next));
        Some(next)
    }

    /// Forwards a line to subscribers
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        let _ = self.events.send(ManagerEvent::Log(line));
    }

    pub fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
