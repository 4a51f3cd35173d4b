//! Linux IPv6 leak protection via ip6tables
//!
//! While a session is up, IPv6 output that does not go through a tun device
//! is rejected. Rules are tagged with a comment so release only removes ours.

use super::{LeakFuture, LeakProtection, PlatformError};
use crate::helper::Helper;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const RULE_COMMENT: &str = "ovpn-manager-leak";

pub struct Ip6tablesLeakProtection {
    helper: Helper,
    program: PathBuf,
    timeout: Duration,
    engaged: AtomicBool,
}

impl Ip6tablesLeakProtection {
    pub fn new(helper: Helper, timeout: Duration) -> Self {
        Self::with_program(helper, Helper::tool("ip6tables"), timeout)
    }

    pub(crate) fn with_program(helper: Helper, program: PathBuf, timeout: Duration) -> Self {
        Self {
            helper,
            program,
            timeout,
            engaged: AtomicBool::new(false),
        }
    }

    /// Rule specs in insertion order; loopback first so it stays reachable
    fn rules() -> [Vec<&'static str>; 2] {
        [
            vec![
                "OUTPUT", "-o", "lo", "-m", "comment", "--comment", RULE_COMMENT, "-j", "ACCEPT",
            ],
            vec![
                "OUTPUT", "!", "-o", "tun+", "-m", "comment", "--comment", RULE_COMMENT, "-j",
                "REJECT",
            ],
        ]
    }

    async fn run(&self, action: &str, rule: &[&str]) -> Result<(), String> {
        let mut args = vec![OsString::from(action)];
        args.extend(rule.iter().map(OsString::from));
        let invocation = self.helper.escalate(&self.program, args);

        let output = self
            .helper
            .run_bounded("ip6tables", invocation, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(stderr.trim().to_string());
        }
        Ok(())
    }

    async fn insert_rules(&self) -> Result<(), PlatformError> {
        if self.engaged.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // -I prepends, so insert in reverse to keep the loopback rule on top
        for rule in Self::rules().iter().rev() {
            if let Err(e) = self.run("-I", rule).await {
                if let Err(rollback) = self.delete_rules().await {
                    debug!("Rollback after failed insert: {}", rollback);
                }
                return Err(PlatformError::EngageError(e));
            }
        }
        info!("IPv6 leak protection engaged");
        Ok(())
    }

    async fn delete_rules(&self) -> Result<(), PlatformError> {
        if !self.engaged.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        for rule in Self::rules().iter() {
            if let Err(e) = self.run("-D", rule).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(PlatformError::ReleaseError(e)),
            None => {
                info!("IPv6 leak protection released");
                Ok(())
            }
        }
    }
}

impl LeakProtection for Ip6tablesLeakProtection {
    fn engage(&self) -> LeakFuture<'_> {
        Box::pin(self.insert_rules())
    }

    fn release(&self) -> LeakFuture<'_> {
        Box::pin(self.delete_rules())
    }
}
