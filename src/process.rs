//! Supervised helper process
//!
//! The helper is spawned in its own process group so that signals reach the
//! escalation wrapper and everything it started. Termination is SIGTERM to the
//! group, a bounded wait, then SIGKILL.

use crate::helper::Invocation;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

const LIVENESS_STEP: Duration = Duration::from_millis(100);
const KILL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Terminate,
    Kill,
}

#[derive(Debug)]
pub struct ManagedProcess {
    child: Option<Child>,
    pgid: Option<i32>,
    started_at: Instant,
}

impl ManagedProcess {
    /// Spawns `invocation` with all three stdio streams piped, in a new process group.
    pub fn spawn(invocation: &Invocation) -> io::Result<Self> {
        let mut cmd = invocation.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        // With process_group(0) the group id is the leader's pid
        let pgid = child.id().map(|pid| pid as i32);
        debug!("Spawned {} (pgid {:?})", invocation.display(), pgid);

        Ok(Self {
            child: Some(child),
            pgid,
            started_at: Instant::now(),
        })
    }

    /// Tracks a process group we did not spawn ourselves
    #[cfg(test)]
    pub(crate) fn from_group(pgid: i32) -> Self {
        Self {
            child: None,
            pgid: Some(pgid),
            started_at: Instant::now(),
        }
    }

    /// Points signals at `pgid` instead of the spawned group
    #[cfg(test)]
    pub(crate) fn set_group(&mut self, pgid: i32) {
        self.pgid = Some(pgid);
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    /// Waits for the spawned child itself (not the whole group).
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process handle already released",
            )),
        }
    }

    /// Non-blocking exit check of the spawned child; reaps it if it exited.
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to query helper process: {}", e);
                None
            }
        }
    }

    /// Drops the handle of an exited helper; the group id is kept for teardown.
    pub fn release_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.try_wait();
        }
    }

    /// True while the child or any other member of its group is running.
    /// Zombie members do not count.
    pub fn is_alive(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return true;
            }
        }
        self.group_alive()
    }

    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        let Some(pgid) = self.pgid else {
            return false;
        };
        match killpg(Pid::from_raw(pgid), None) {
            // EPERM: members exist but belong to another user (escalated helper)
            Ok(()) | Err(Errno::EPERM) => group_has_running_member(pgid).unwrap_or(true),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn send(&mut self, stop: StopSignal) {
        let signal = match stop {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match self.pgid {
            Some(pgid) => match killpg(Pid::from_raw(pgid), signal) {
                Ok(()) => debug!("Sent {:?} to process group {}", signal, pgid),
                Err(Errno::ESRCH) => debug!("Process group {} already gone", pgid),
                Err(e) => warn!("Failed to send {:?} to process group {}: {}", signal, pgid, e),
            },
            None => {
                if let Some(child) = self.child.as_mut() {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill helper process: {}", e);
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn send(&mut self, _stop: StopSignal) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill helper process: {}", e);
            }
        }
    }

    async fn wait_gone(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LIVENESS_STEP).await;
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Returns true if SIGKILL was needed.
    ///
    /// Signal failures are logged and never abort the sequence.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        if !self.is_alive() {
            debug!("Helper process group already exited");
            return false;
        }

        self.send(StopSignal::Terminate);
        if self.wait_gone(grace).await {
            return false;
        }

        warn!(
            "Helper did not exit within {}s, sending SIGKILL",
            grace.as_secs_f32()
        );
        self.send(StopSignal::Kill);
        if !self.wait_gone(KILL_SETTLE).await {
            warn!("Helper process group {:?} still present after SIGKILL", self.pgid);
        }
        true
    }
}

/// Scans `/proc` for members of `pgid`. `None` when no member is visible,
/// `Some(false)` when every visible member is a zombie.
#[cfg(target_os = "linux")]
fn group_has_running_member(pgid: i32) -> Option<bool> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let mut seen = false;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        // Entries vanish while we scan
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        let Some((state, group)) = parse_stat(&stat) else {
            continue;
        };
        if group != pgid {
            continue;
        }
        if !matches!(state, 'Z' | 'X') {
            return Some(true);
        }
        seen = true;
    }
    seen.then_some(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn group_has_running_member(_pgid: i32) -> Option<bool> {
    None
}

/// State and process group from a `/proc/<pid>/stat` line
#[cfg(target_os = "linux")]
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    // comm may contain spaces and parentheses, so fields start after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}
