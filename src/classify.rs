//! OpenVPN log line classification
//!
//! OpenVPN's human-readable log is the only signal of tunnel progress. Each
//! line is matched against an ordered marker table; the first family that
//! matches wins. More specific families come before the generic fatal one so
//! that e.g. a resolve failure is reported as such.
//!
//! | Order | Family | Markers | Case |
//! |-------|--------|---------|------|
//! | 1 | success | `Initialization Sequence Completed` | exact |
//! | 2 | auth failure | `AUTH_FAILED`, `AUTH FAILURE`, `AUTHENTICATION FAILED` | any |
//! | 3 | resolve failure | `RESOLVE: Cannot resolve host address` | any |
//! | 4 | connection reset | `Connection reset`, `Connection refused` | exact |
//! | 5 | fatal | `FATAL`, `TLS ERROR`, `VERIFY ERROR`, `CANNOT RESOLVE`, `NETWORK IS UNREACHABLE`, `OPTIONS ERROR`, `RESOLVE:` | any |

use crate::state::{SessionFailure, Trigger};

const SUCCESS_MARKERS: &[&str] = &["Initialization Sequence Completed"];

const AUTH_FAILURE_MARKERS: &[&str] = &["AUTH_FAILED", "AUTH FAILURE", "AUTHENTICATION FAILED"];

const RESOLVE_FAILURE_MARKERS: &[&str] = &["RESOLVE: CANNOT RESOLVE HOST ADDRESS"];

const CONNECTION_RESET_MARKERS: &[&str] = &["Connection reset", "Connection refused"];

const FATAL_MARKERS: &[&str] = &[
    "FATAL",
    "TLS ERROR",
    "VERIFY ERROR",
    "CANNOT RESOLVE",
    "NETWORK IS UNREACHABLE",
    "OPTIONS ERROR",
    "RESOLVE:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Success,
    AuthFailure,
    ResolveFailure,
    ConnectionReset,
    Fatal,
    Plain,
}

impl LineKind {
    /// State machine trigger for this line, if any
    pub fn trigger(&self) -> Option<Trigger> {
        match self {
            LineKind::Success => Some(Trigger::SuccessMarker),
            LineKind::AuthFailure => Some(Trigger::AuthFailure),
            LineKind::ResolveFailure | LineKind::ConnectionReset | LineKind::Fatal => {
                Some(Trigger::Failure)
            }
            LineKind::Plain => None,
        }
    }

    /// Failure carried by this line, with the line itself as detail
    pub fn failure(&self, line: &str) -> Option<SessionFailure> {
        let detail = line.trim().to_string();
        match self {
            LineKind::AuthFailure => Some(SessionFailure::Authentication),
            LineKind::ResolveFailure => Some(SessionFailure::ResolveFailed(detail)),
            LineKind::ConnectionReset => Some(SessionFailure::ConnectionFailed(detail)),
            LineKind::Fatal => Some(SessionFailure::Fatal(detail)),
            LineKind::Success | LineKind::Plain => None,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Classify a single log line. Never fails; unmatched lines are [`LineKind::Plain`].
pub fn classify(line: &str) -> LineKind {
    if contains_any(line, SUCCESS_MARKERS) {
        return LineKind::Success;
    }

    let upper = line.to_uppercase();

    if contains_any(&upper, AUTH_FAILURE_MARKERS) {
        LineKind::AuthFailure
    } else if contains_any(&upper, RESOLVE_FAILURE_MARKERS) {
        LineKind::ResolveFailure
    } else if contains_any(line, CONNECTION_RESET_MARKERS) {
        LineKind::ConnectionReset
    } else if contains_any(&upper, FATAL_MARKERS) {
        LineKind::Fatal
    } else {
        LineKind::Plain
    }
}
