//! End-to-end sessions against shell-script helpers

#![cfg(unix)]

use ovpn_manager::config::{CredentialMode, Escalation, LaunchMode};
use ovpn_manager::{
    Config, ConnectionRequest, ConnectionState, Credentials, LaunchError, ManagerEvent,
    SessionFailure, VpnManager,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

const GUARD_MESSAGE: &str = "Already connected or a connection attempt is in progress.";

/// Writes `helper.sh`; `$1` is config path and `$2` log path inside `start`.
/// `stop` leaves a `stopped` file next to the script.
fn write_helper(dir: &Path, start: &str, status: &str) -> PathBuf {
    let path = dir.join("helper.sh");
    let script = format!(
        "#!/bin/sh\n\
         here=\"$(dirname \"$0\")\"\n\
         cmd=\"$1\"\n\
         shift\n\
         case \"$cmd\" in\n\
         start)\n{}\n;;\n\
         status)\n{}\n;;\n\
         stop)\ntouch \"$here/stopped\"\nexit 0\n;;\n\
         esac\n",
        start, status
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(dir: &Path, helper: PathBuf, launch: LaunchMode) -> Config {
    let auth_dir = dir.join("auth");
    std::fs::create_dir_all(&auth_dir).unwrap();

    let mut config = Config::default();
    config.helper.path = helper;
    config.helper.escalation = Escalation::None;
    config.connection.log_path = dir.join("openvpn.log");
    config.connection.auth_dir = Some(auth_dir);
    config.connection.launch = launch;
    config.timeouts.poll_interval_ms = 50;
    config.timeouts.handshake_secs = 5;
    config.timeouts.status_secs = 2;
    config.timeouts.stop_secs = 2;
    config.timeouts.kill_grace_secs = 1;
    config
}

fn ovpn_file(dir: &Path) -> PathBuf {
    let path = dir.join("office.ovpn");
    std::fs::write(&path, "client\nremote vpn.example.com 1194\n").unwrap();
    path
}

async fn wait_for<F>(
    rx: &mut broadcast::Receiver<ManagerEvent>,
    seen: &mut Vec<ManagerEvent>,
    pred: F,
) -> bool
where
    F: Fn(&ManagerEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let hit = pred(&event);
                    seen.push(event);
                    if hit {
                        return true;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or(false)
}

fn drain(rx: &mut broadcast::Receiver<ManagerEvent>, seen: &mut Vec<ManagerEvent>) {
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
}

fn states(seen: &[ManagerEvent]) -> Vec<ConnectionState> {
    seen.iter()
        .filter_map(|event| match event {
            ManagerEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn failures(seen: &[ManagerEvent]) -> Vec<SessionFailure> {
    seen.iter()
        .filter_map(|event| match event {
            ManagerEvent::Failed(failure) => Some(failure.clone()),
            _ => None,
        })
        .collect()
}

fn logs(seen: &[ManagerEvent]) -> Vec<String> {
    seen.iter()
        .filter_map(|event| match event {
            ManagerEvent::Log(line) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

fn is_state(state: ConnectionState) -> impl Fn(&ManagerEvent) -> bool {
    move |event| *event == ManagerEvent::StateChanged(state)
}

fn is_session_end(event: &ManagerEvent) -> bool {
    *event == ManagerEvent::SessionEnded
}

#[tokio::test]
async fn test_success_marker_in_log() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(
        temp_dir.path(),
        "read user; read pass\n\
         [ \"$user\" = bob ] || exit 2\n\
         echo \"Initialization Sequence Completed\" >> \"$2\"\n\
         exit 0",
        "echo connected",
    );
    let mut config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    config.connection.credentials = CredentialMode::Stdin;
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::new("bob", "secret"))
            .unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_state(ConnectionState::Connected)).await);

    manager.disconnect().await;
    drain(&mut rx, &mut seen);

    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
    assert!(failures(&seen).is_empty());
    assert!(seen.contains(&ManagerEvent::SessionEnded));
    assert_eq!(manager.active_process_group(), None);

    let logs = logs(&seen);
    let position = |text: &str| logs.iter().position(|line| line.contains(text));
    let connecting = position("Connecting to ").expect("connecting line");
    let established = position("Connection established successfully.").expect("established line");
    let disconnected = position("Disconnected successfully.").expect("disconnected line");
    assert!(logs[connecting].ends_with("office.ovpn..."));
    assert!(connecting < established && established < disconnected);
}

#[tokio::test]
async fn test_background_stdout_marker_and_teardown() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(
        temp_dir.path(),
        "echo \"Initialization Sequence Completed\"\nexec sleep 30",
        "echo connected",
    );
    let config = test_config(temp_dir.path(), helper, LaunchMode::Background);
    let manager = VpnManager::new(config).unwrap();
    manager.select_config(ovpn_file(temp_dir.path())).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_state(ConnectionState::Connected)).await);

    let pgid = manager.active_process_group().expect("session holds a process group");

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.active_process_group(), None);

    let probe = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), None);
    assert!(probe.is_err(), "process group {} still alive", pgid);
}

#[tokio::test]
async fn test_privilege_failure_carries_hint() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(
        temp_dir.path(),
        "echo \"sudo: a password is required\" >&2\nexit 1",
        "echo disconnected",
    );
    let config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::new("bob", "secret"))
            .unwrap();
    let err = manager.connect(request).await.unwrap_err();
    drain(&mut rx, &mut seen);

    match err {
        LaunchError::Session(SessionFailure::Privilege { message, hint }) => {
            assert!(message.contains("a password is required"));
            assert!(hint.contains("NOPASSWD"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Error,
        ]
    );
    assert!(seen.iter().any(|event| matches!(
        event,
        ManagerEvent::Log(line) if line.contains("NOPASSWD")
    )));
    assert_eq!(failures(&seen).len(), 1);
}

#[tokio::test]
async fn test_auth_failure_cleans_up() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(
        temp_dir.path(),
        "[ \"$3\" = \"--auth-user-pass\" ] && cp \"$4\" \"$here/seen-auth\"\n\
         echo \"AUTH: Received control message: AUTH_FAILED\" >> \"$2\"\n\
         exit 0",
        "echo disconnected",
    );
    let mut config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    config.connection.credentials = CredentialMode::File;
    let auth_dir = config.connection.auth_dir.clone().unwrap();
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::new("bob", "secret"))
            .unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_session_end).await);

    assert_eq!(manager.state(), ConnectionState::AuthFailed);
    assert_eq!(failures(&seen), vec![SessionFailure::Authentication]);
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("seen-auth")).unwrap(),
        "bob\nsecret\n"
    );
    assert_eq!(std::fs::read_dir(&auth_dir).unwrap().count(), 0);
    assert_eq!(manager.active_process_group(), None);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::AuthFailed);
    assert_eq!(std::fs::read_dir(&auth_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_connect_guard_logs_once() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(temp_dir.path(), "exec sleep 30", "echo disconnected");
    let config = test_config(temp_dir.path(), helper, LaunchMode::Background);
    let manager = VpnManager::new(config).unwrap();

    let config_file = ovpn_file(temp_dir.path());
    let request = ConnectionRequest::new(&config_file, Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let mut rx = manager.subscribe();
    let mut seen = Vec::new();
    let again = ConnectionRequest::new(&config_file, Credentials::default()).unwrap();
    assert!(matches!(
        manager.connect(again).await,
        Err(LaunchError::AlreadyActive)
    ));
    drain(&mut rx, &mut seen);

    let guard_logs = seen
        .iter()
        .filter(|event| **event == ManagerEvent::Log(GUARD_MESSAGE.to_string()))
        .count();
    assert_eq!(guard_logs, 1);
    assert!(states(&seen).is_empty());

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_status_streak_promotes_without_marker() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(temp_dir.path(), "exit 0", "echo connected");
    let config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_state(ConnectionState::Connected)).await);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_tunnel_gone_while_connected() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(
        temp_dir.path(),
        "touch \"$here/up\"\n\
         echo \"Initialization Sequence Completed\" >> \"$2\"\n\
         exit 0",
        "if [ -f \"$here/up\" ]; then echo connected; else echo disconnected; fi",
    );
    let config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_state(ConnectionState::Connected)).await);

    std::fs::remove_file(temp_dir.path().join("up")).unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_session_end).await);

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(failures(&seen).is_empty());
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_connect_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(temp_dir.path(), "exit 0", "echo disconnected");
    let mut config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    config.timeouts.connect_secs = 1;
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_session_end).await);

    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(failures(&seen), vec![SessionFailure::Timeout(1)]);
}

#[tokio::test]
async fn test_unexpected_exit_in_background_mode() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(temp_dir.path(), "sleep 0.2\nexit 0", "echo disconnected");
    let config = test_config(temp_dir.path(), helper, LaunchMode::Background);
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_session_end).await);

    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(failures(&seen), vec![SessionFailure::UnexpectedExit]);
}

#[tokio::test]
async fn test_missing_helper_fails_launch() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(
        temp_dir.path(),
        temp_dir.path().join("no-such-helper.sh"),
        LaunchMode::Handshake,
    );
    let manager = VpnManager::new(config).unwrap();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    let err = manager.connect(request).await.unwrap_err();

    assert!(matches!(
        err,
        LaunchError::Session(SessionFailure::Launch(_))
    ));
    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(manager.active_process_group(), None);
}

#[tokio::test]
async fn test_disconnect_during_handshake() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(temp_dir.path(), "exec sleep 30", "echo disconnected");
    let config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    let connector = manager.clone();
    let connect = tokio::spawn(async move { connector.connect(request).await });
    assert!(wait_for(&mut rx, &mut seen, is_state(ConnectionState::Connecting)).await);

    manager.disconnect().await;
    let result = connect.await.unwrap();

    assert!(matches!(result, Err(LaunchError::Cancelled)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    drain(&mut rx, &mut seen);
    assert!(states(&seen).ends_with(&[
        ConnectionState::Disconnecting,
        ConnectionState::Disconnected
    ]));
}

#[tokio::test]
async fn test_reconnect_after_error() {
    let temp_dir = TempDir::new().unwrap();
    let flag = temp_dir.path().join("allow");
    let helper = write_helper(
        temp_dir.path(),
        "[ -f \"$here/allow\" ] || { echo \"Options error: bad config\" >&2; exit 1; }\n\
         echo \"Initialization Sequence Completed\" >> \"$2\"\n\
         exit 0",
        "echo connected",
    );
    let config = test_config(temp_dir.path(), helper, LaunchMode::Handshake);
    let manager = VpnManager::new(config).unwrap();
    let config_file = ovpn_file(temp_dir.path());

    let request = ConnectionRequest::new(&config_file, Credentials::default()).unwrap();
    assert!(manager.connect(request).await.is_err());
    assert_eq!(manager.state(), ConnectionState::Error);

    std::fs::write(&flag, "").unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();
    let request = ConnectionRequest::new(&config_file, Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    assert!(wait_for(&mut rx, &mut seen, is_state(ConnectionState::Connected)).await);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_dropping_manager_tears_session_down() {
    let temp_dir = TempDir::new().unwrap();
    let helper = write_helper(temp_dir.path(), "exec sleep 30", "echo disconnected");
    let config = test_config(temp_dir.path(), helper, LaunchMode::Background);
    let manager = VpnManager::new(config).unwrap();
    let mut rx = manager.subscribe();
    let mut seen = Vec::new();

    let request =
        ConnectionRequest::new(ovpn_file(temp_dir.path()), Credentials::default()).unwrap();
    manager.connect(request).await.unwrap();
    let pgid = manager.active_process_group().expect("session holds a process group");

    drop(manager);

    assert!(wait_for(&mut rx, &mut seen, is_session_end).await);
    assert!(temp_dir.path().join("stopped").exists());
    let probe = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), None);
    assert!(probe.is_err(), "process group {} still alive", pgid);
}
