//! Privileged helper invocation
//!
//! The helper is an external program with a fixed command line contract:
//!
//! ```text
//! helper start  <config_path> <log_path> [--auth-user-pass <auth_file>] [--proto udp4|tcp4]
//! helper stop   <config_name> <log_path>
//! helper status <config_name>
//! ```
//!
//! `start` may read `username\npassword\n` from stdin. This module builds those
//! command lines, wraps them in the configured escalation tool, and runs the
//! short-lived `stop`/`status` actions with a timeout.

use crate::config::{Config, Escalation, Proto};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use which::which;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("helper {action} timed out after {secs}s")]
    Timeout { action: &'static str, secs: u64 },
    #[error("helper {action} exited with code {code:?}: {stderr}")]
    Failed {
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Appended to launch errors whose stderr matches [`needs_privilege_hint`]
pub const PRIVILEGE_HINT: &str = "Hint: the helper needs passwordless privileges. \
Add a NOPASSWD sudoers rule for the helper script (e.g. in /etc/sudoers.d/), \
or set `helper.escalation = \"sudo-askpass\"` with an askpass program.";

const PRIVILEGE_MARKERS: &[&str] = &[
    "password is required",
    "password required",
    "askpass",
    "no tty present",
    "terminal is required",
];

/// True if helper stderr says escalation wanted a password it could not get
pub fn needs_privilege_hint(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    PRIVILEGE_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperAction {
    Start,
    Stop,
    Status,
}

impl HelperAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperAction::Start => "start",
            HelperAction::Stop => "stop",
            HelperAction::Status => "status",
        }
    }
}

/// A fully resolved command line: program, arguments, extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl Invocation {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Program plus arguments, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(|a| a.as_os_str()))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct Helper {
    path: PathBuf,
    escalation: Escalation,
    askpass: Option<PathBuf>,
    status_timeout: Duration,
    stop_timeout: Duration,
}

impl Helper {
    pub fn new(path: PathBuf, escalation: Escalation) -> Self {
        Self {
            path,
            escalation,
            askpass: None,
            status_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.helper.path.clone(),
            escalation: config.helper.escalation,
            askpass: config.helper.askpass.clone(),
            status_timeout: config.timeouts.status(),
            stop_timeout: config.timeouts.stop(),
        }
    }

    pub(crate) fn tool(name: &str) -> PathBuf {
        which(name).unwrap_or_else(|_| PathBuf::from(name))
    }

    fn askpass(&self) -> Option<OsString> {
        self.askpass
            .as_ref()
            .map(|p| p.clone().into_os_string())
            .or_else(|| std::env::var_os("SUDO_ASKPASS"))
    }

    /// Wraps `program <args>` in the escalation tool
    pub fn escalate(&self, program: &Path, program_args: Vec<OsString>) -> Invocation {
        let target = program.as_os_str().to_os_string();
        let (program, mut args, mut env) = match self.escalation {
            Escalation::None => (program.to_path_buf(), Vec::new(), Vec::new()),
            Escalation::Sudo => (
                Self::tool("sudo"),
                vec![OsString::from("-n"), target],
                Vec::new(),
            ),
            Escalation::SudoAskpass => (
                Self::tool("sudo"),
                vec![OsString::from("-A"), target],
                Vec::new(),
            ),
            Escalation::Pkexec => (Self::tool("pkexec"), vec![target], Vec::new()),
        };

        if self.escalation == Escalation::SudoAskpass {
            if let Some(askpass) = self.askpass() {
                env.push((OsString::from("SUDO_ASKPASS"), askpass));
            }
        }

        args.extend(program_args);
        Invocation { program, args, env }
    }

    fn wrap(&self, helper_args: Vec<OsString>) -> Invocation {
        self.escalate(&self.path, helper_args)
    }

    pub fn start_invocation(
        &self,
        config_path: &Path,
        log_path: &Path,
        auth_file: Option<&Path>,
        proto: Option<Proto>,
    ) -> Invocation {
        let mut args = vec![
            OsString::from(HelperAction::Start.as_str()),
            config_path.as_os_str().to_os_string(),
            log_path.as_os_str().to_os_string(),
        ];
        if let Some(auth_file) = auth_file {
            args.push(OsString::from("--auth-user-pass"));
            args.push(auth_file.as_os_str().to_os_string());
        }
        if let Some(proto) = proto {
            args.push(OsString::from("--proto"));
            args.push(OsString::from(proto.as_arg()));
        }
        self.wrap(args)
    }

    pub fn stop_invocation(&self, config_name: &str, log_path: &Path) -> Invocation {
        self.wrap(vec![
            OsString::from(HelperAction::Stop.as_str()),
            OsString::from(config_name),
            log_path.as_os_str().to_os_string(),
        ])
    }

    pub fn status_invocation(&self, config_name: &str) -> Invocation {
        self.wrap(vec![
            OsString::from(HelperAction::Status.as_str()),
            OsString::from(config_name),
        ])
    }

    /// Runs a short-lived command, killing it if it outlives `timeout`
    pub(crate) async fn run_bounded(
        &self,
        action: &'static str,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<Output, HelperError> {
        debug!("Running: {}", invocation.display());
        let child = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HelperError::Spawn {
                program: invocation.program.display().to_string(),
                source,
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(HelperError::Timeout {
                action,
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Asks the helper about `config_name`; returns its trimmed stdout
    pub async fn status(&self, config_name: &str) -> Result<String, HelperError> {
        let output = self
            .run_bounded(
                HelperAction::Status.as_str(),
                self.status_invocation(config_name),
                self.status_timeout,
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() && !output.status.success() {
            return Err(HelperError::Failed {
                action: HelperAction::Status.as_str(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Stops `config_name` and archives its log. Idempotent on the helper side.
    pub async fn stop(&self, config_name: &str, log_path: &Path) -> Result<(), HelperError> {
        let output = self
            .run_bounded(
                HelperAction::Stop.as_str(),
                self.stop_invocation(config_name, log_path),
                self.stop_timeout,
            )
            .await?;

        if !output.status.success() {
            return Err(HelperError::Failed {
                action: HelperAction::Stop.as_str(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(inv: &Invocation) -> Vec<String> {
        inv.args
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_start_without_escalation() {
        let helper = Helper::new(PathBuf::from("/opt/helper.sh"), Escalation::None);
        let inv = helper.start_invocation(
            Path::new("/tmp/a.ovpn"),
            Path::new("/tmp/openvpn.log"),
            None,
            None,
        );

        assert_eq!(inv.program, PathBuf::from("/opt/helper.sh"));
        assert_eq!(args(&inv), vec!["start", "/tmp/a.ovpn", "/tmp/openvpn.log"]);
        assert!(inv.env.is_empty());
    }

    #[test]
    fn test_start_with_auth_file_and_proto() {
        let helper = Helper::new(PathBuf::from("/opt/helper.sh"), Escalation::Sudo);
        let inv = helper.start_invocation(
            Path::new("/tmp/a.ovpn"),
            Path::new("/tmp/openvpn.log"),
            Some(Path::new("/tmp/ovpn-auth-x.txt")),
            Some(Proto::Udp4),
        );

        assert!(inv.program.ends_with("sudo"));
        assert_eq!(
            args(&inv),
            vec![
                "-n",
                "/opt/helper.sh",
                "start",
                "/tmp/a.ovpn",
                "/tmp/openvpn.log",
                "--auth-user-pass",
                "/tmp/ovpn-auth-x.txt",
                "--proto",
                "udp4",
            ]
        );
    }

    #[test]
    fn test_askpass_environment() {
        let mut config = Config::default();
        config.helper.path = PathBuf::from("/opt/helper.sh");
        config.helper.escalation = Escalation::SudoAskpass;
        config.helper.askpass = Some(PathBuf::from("/usr/bin/ssh-askpass"));
        let helper = Helper::from_config(&config);

        let inv = helper.status_invocation("office");
        assert_eq!(args(&inv), vec!["-A", "/opt/helper.sh", "status", "office"]);
        assert_eq!(
            inv.env,
            vec![(
                OsString::from("SUDO_ASKPASS"),
                OsString::from("/usr/bin/ssh-askpass")
            )]
        );
    }

    #[test]
    fn test_pkexec_stop() {
        let helper = Helper::new(PathBuf::from("/opt/helper.sh"), Escalation::Pkexec);
        let inv = helper.stop_invocation("office", Path::new("/tmp/openvpn.log"));

        assert!(inv.program.ends_with("pkexec"));
        assert_eq!(
            args(&inv),
            vec!["/opt/helper.sh", "stop", "office", "/tmp/openvpn.log"]
        );
    }

    #[test]
    fn test_privilege_hint_detection() {
        assert!(needs_privilege_hint("sudo: a password is required\n"));
        assert!(needs_privilege_hint(
            "sudo: no askpass program specified, try setting SUDO_ASKPASS"
        ));
        assert!(needs_privilege_hint(
            "sudo: a terminal is required to read the password"
        ));
        assert!(!needs_privilege_hint("Options error: bad config"));
        assert!(!needs_privilege_hint(""));
    }

    #[test]
    fn test_invocation_display() {
        let helper = Helper::new(PathBuf::from("/opt/helper.sh"), Escalation::None);
        let inv = helper.status_invocation("office");
        assert_eq!(inv.display(), "/opt/helper.sh status office");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_reads_stdout() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let script = temp_dir.path().join("helper.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"  connected \"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let helper = Helper::new(script, Escalation::None);
        assert_eq!(helper.status("office").await.unwrap(), "connected");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let script = temp_dir.path().join("helper.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut helper = Helper::new(script, Escalation::None);
        helper.status_timeout = Duration::from_millis(200);

        let err = helper.status("office").await.unwrap_err();
        assert!(matches!(err, HelperError::Timeout { action: "status", .. }));
    }

    #[tokio::test]
    async fn test_missing_helper_is_spawn_error() {
        let helper = Helper::new(
            PathBuf::from("/nonexistent/ovpn-helper"),
            Escalation::None,
        );
        let err = helper
            .stop("office", Path::new("/tmp/openvpn.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, HelperError::Spawn { .. }));
    }
}
