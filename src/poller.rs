//! Status poll interpretation
//!
//! The helper's `status` action is a second opinion next to the log markers.
//! [`PollTracker`] turns a stream of poll results into reconciliation actions.

use crate::helper::HelperError;
use crate::state::{ConnectionState, SessionFailure};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Connected,
    Error,
    Disconnected,
}

impl PollStatus {
    /// `connected` and `error` are recognised; anything else means disconnected.
    pub fn parse(output: &str) -> Self {
        let output = output.trim();
        if output.eq_ignore_ascii_case("connected") {
            PollStatus::Connected
        } else if output.eq_ignore_ascii_case("error") {
            PollStatus::Error
        } else {
            PollStatus::Disconnected
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Connected => "connected",
            PollStatus::Error => "error",
            PollStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    None,
    /// Enough consecutive `connected` answers while connecting
    Promote,
    /// The tunnel went away while connected
    ProcessGone,
    Fail(SessionFailure),
}

#[derive(Debug, Clone)]
pub struct PollTracker {
    threshold: u32,
    max_failures: u32,
    streak: u32,
    failures: u32,
}

impl PollTracker {
    pub fn new(threshold: u32, max_failures: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            max_failures: max_failures.max(1),
            streak: 0,
            failures: 0,
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Feeds one poll outcome observed in `state`
    pub fn observe(
        &mut self,
        state: ConnectionState,
        result: Result<PollStatus, &HelperError>,
    ) -> PollAction {
        let status = match result {
            Ok(status) => {
                self.failures = 0;
                status
            }
            Err(e) => {
                self.streak = 0;
                self.failures += 1;
                warn!(
                    "Status check failed ({}/{}): {}",
                    self.failures, self.max_failures, e
                );
                if self.failures >= self.max_failures {
                    return PollAction::Fail(SessionFailure::PollFailure(e.to_string()));
                }
                return PollAction::None;
            }
        };

        match (state, status) {
            (ConnectionState::Connecting, PollStatus::Connected) => {
                self.streak += 1;
                debug!("Status connected ({}/{})", self.streak, self.threshold);
                if self.streak >= self.threshold {
                    self.streak = 0;
                    PollAction::Promote
                } else {
                    PollAction::None
                }
            }
            (ConnectionState::Connecting | ConnectionState::Connected, PollStatus::Error) => {
                self.streak = 0;
                PollAction::Fail(SessionFailure::Fatal(
                    "helper status reported an error".to_string(),
                ))
            }
            (ConnectionState::Connected, PollStatus::Disconnected) => {
                self.streak = 0;
                PollAction::ProcessGone
            }
            _ => {
                if status != PollStatus::Connected {
                    self.streak = 0;
                }
                PollAction::None
            }
        }
    }
}
