//! Session teardown
//!
//! Every way a session can end goes through [`TeardownController::run`]:
//! terminate the process group, ask the helper to stop, then release the auth
//! file and leak protection no matter what failed before.

use crate::auth::AuthMaterial;
use crate::helper::Helper;
use crate::platform::LeakProtection;
use crate::process::ManagedProcess;
use crate::state::{StateMachine, Trigger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DISCONNECTED_MESSAGE: &str = "Disconnected successfully.";

/// Resources owned by one connection attempt
#[derive(Debug)]
pub struct Session {
    pub config_name: String,
    pub process: Option<ManagedProcess>,
    pub auth: Option<AuthMaterial>,
    pub leak_engaged: bool,
}

impl Session {
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            process: None,
            auth: None,
            leak_engaged: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// User asked to disconnect: Disconnecting, then Disconnected
    Requested,
    /// The tunnel went away on its own; state already settled
    Ended,
    /// Error-driven; AuthFailed/Error stay as they are
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    /// SIGKILL was needed
    pub escalated: bool,
    /// `helper stop` succeeded
    pub stop_ok: bool,
}

pub struct TeardownController {
    helper: Helper,
    leak_protection: Arc<dyn LeakProtection>,
    log_path: PathBuf,
    kill_grace: Duration,
}

impl TeardownController {
    pub fn new(
        helper: Helper,
        leak_protection: Arc<dyn LeakProtection>,
        log_path: PathBuf,
        kill_grace: Duration,
    ) -> Self {
        Self {
            helper,
            leak_protection,
            log_path,
            kill_grace,
        }
    }

    pub async fn run(
        &self,
        session: &mut Session,
        machine: &StateMachine,
        reason: TeardownReason,
    ) -> TeardownReport {
        info!("Tearing down session {} ({:?})", session.config_name, reason);
        if reason == TeardownReason::Requested {
            machine.apply(Trigger::DisconnectRequested);
        }

        let mut report = TeardownReport::default();

        if let Some(mut process) = session.process.take() {
            report.escalated = process.terminate(self.kill_grace).await;
        }

        match self.helper.stop(&session.config_name, &self.log_path).await {
            Ok(()) => report.stop_ok = true,
            Err(e) => {
                warn!("Helper stop failed: {}", e);
                machine.log(format!("Helper stop failed: {}", e));
            }
        }

        if let Some(mut auth) = session.auth.take() {
            if let Err(e) = auth.release() {
                warn!("Failed to remove auth file: {}", e);
            }
        }

        if session.leak_engaged {
            if let Err(e) = self.leak_protection.release().await {
                warn!("Failed to release leak protection: {}", e);
                machine.log(e.to_string());
            }
            session.leak_engaged = false;
        }

        if reason == TeardownReason::Requested {
            if report.stop_ok {
                machine.log(DISCONNECTED_MESSAGE);
            }
            machine.apply(Trigger::TeardownComplete);
        }
        report
    }
}
