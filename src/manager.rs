//! Connection manager
//!
//! [`VpnManager`] is the facade the UI talks to. Each connection attempt is
//! owned by a supervising task that launches the helper, watches its output
//! and the shared log, polls status, and finally runs teardown. The manager
//! talks to that task through a command channel; state flows back through the
//! [`StateMachine`] event bus.

use crate::auth::{AuthMaterial, Credentials};
use crate::classify::classify;
use crate::config::{Config, CredentialMode, LaunchMode};
use crate::helper::{needs_privilege_hint, Helper, Invocation, PRIVILEGE_HINT};
use crate::logtail::LogTail;
use crate::platform::{get_leak_protection, LeakProtection, PlatformError};
use crate::poller::{PollAction, PollStatus, PollTracker};
use crate::process::ManagedProcess;
use crate::state::{ConnectionState, ManagerEvent, SessionFailure, StateMachine, Trigger};
use crate::teardown::{Session, TeardownController, TeardownReason};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const LOG_HEADER: &str = "--- Log started ---";
const GUARD_MESSAGE: &str = "Already connected or a connection attempt is in progress.";
const NOT_CONNECTED_MESSAGE: &str = "Not connected.";
const CONNECTION_LOST_MESSAGE: &str = "VPN connection is no longer active.";
const CONNECTED_MESSAGE: &str = "Connection established successfully.";
const COMMAND_CAPACITY: usize = 4;
const LINE_CAPACITY: usize = 256;
const STDERR_KEEP: usize = 20;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),
    #[error("Cannot change the configuration while a session is active")]
    SessionActive,
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Already connected or a connection attempt is in progress.")]
    AlreadyActive,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Session(#[from] SessionFailure),
    #[error("Connection attempt was cancelled")]
    Cancelled,
}

/// What the UI hands over on "connect"
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    config_path: PathBuf,
    credentials: Credentials,
}

impl ConnectionRequest {
    pub fn new(
        config_path: impl Into<PathBuf>,
        credentials: Credentials,
    ) -> Result<Self, RequestError> {
        let config_path = config_path.into();
        if !config_path.is_file() {
            return Err(RequestError::ConfigNotFound(config_path));
        }
        Ok(Self {
            config_path,
            credentials,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Name used for `helper status`/`helper stop`: the file stem
    pub fn config_name(&self) -> String {
        config_name(&self.config_path)
    }
}

pub fn config_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "openvpn".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connecting, connected, or on the way down
fn is_busy(state: ConnectionState) -> bool {
    state.is_active() || state == ConnectionState::Disconnecting
}

enum Command {
    Disconnect(oneshot::Sender<()>),
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

struct Inner {
    config: Config,
    helper: Helper,
    machine: StateMachine,
    teardown: TeardownController,
    leak_protection: Arc<dyn LeakProtection>,
    selected: Mutex<Option<PathBuf>>,
    pgid: Mutex<Option<i32>>,
}

/// Dropping the last clone closes the command channel, which tears the session down.
#[derive(Clone)]
pub struct VpnManager {
    inner: Arc<Inner>,
    // Not in `Inner`: the supervisor must not keep its own command sender alive
    active: Arc<tokio::sync::Mutex<Option<SessionHandle>>>,
}

impl VpnManager {
    pub fn new(config: Config) -> Result<Self, PlatformError> {
        let helper = Helper::from_config(&config);
        let leak_protection: Arc<dyn LeakProtection> =
            Arc::from(get_leak_protection(&config.leak_protection, &helper)?);
        let teardown = TeardownController::new(
            helper.clone(),
            Arc::clone(&leak_protection),
            config.connection.log_path.clone(),
            config.timeouts.kill_grace(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                helper,
                machine: StateMachine::new(),
                teardown,
                leak_protection,
                selected: Mutex::new(None),
                pgid: Mutex::new(None),
            }),
            active: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.machine.subscribe()
    }

    pub fn selected_config(&self) -> Option<PathBuf> {
        lock(&self.inner.selected).clone()
    }

    /// Process group of the live helper, if a session holds one
    pub fn active_process_group(&self) -> Option<i32> {
        *lock(&self.inner.pgid)
    }

    pub fn select_config(&self, path: impl Into<PathBuf>) -> Result<(), RequestError> {
        let path = path.into();
        if !path.is_file() {
            return Err(RequestError::ConfigNotFound(path));
        }
        if is_busy(self.state()) {
            return Err(RequestError::SessionActive);
        }
        info!("Selected configuration {}", path.display());
        *lock(&self.inner.selected) = Some(path);
        self.inner.machine.apply(Trigger::ConfigSelected);
        Ok(())
    }

    /// The selected configuration was removed
    pub fn clear_config(&self) -> Result<(), RequestError> {
        if is_busy(self.state()) {
            return Err(RequestError::SessionActive);
        }
        *lock(&self.inner.selected) = None;
        self.inner.machine.apply(Trigger::ConfigCleared);
        Ok(())
    }

    /// Starts a session for `request`.
    ///
    /// Returns once the helper is up: immediately after spawn in background
    /// mode, after the helper exits 0 in handshake mode. Failures are also
    /// published as log, state and [`ManagerEvent::Failed`].
    pub async fn connect(&self, request: ConnectionRequest) -> Result<(), LaunchError> {
        if !request.config_path().is_file() {
            return Err(RequestError::ConfigNotFound(request.config_path().to_path_buf()).into());
        }

        let machine = &self.inner.machine;
        let mut active = self.active.lock().await;

        if machine.state() == ConnectionState::NoConfigSelected {
            *lock(&self.inner.selected) = Some(request.config_path().to_path_buf());
            machine.apply(Trigger::ConfigSelected);
        }

        if let Some(previous) = active.take() {
            if previous.task.is_finished() || !is_busy(machine.state()) {
                // Let a finishing teardown complete before starting over
                if let Err(e) = previous.task.await {
                    error!("Previous session task failed: {}", e);
                }
            } else {
                *active = Some(previous);
            }
        }

        if machine.apply(Trigger::ConnectRequested).is_none() {
            info!("{}", GUARD_MESSAGE);
            machine.log(GUARD_MESSAGE);
            return Err(LaunchError::AlreadyActive);
        }

        let connecting = format!("Connecting to {}...", request.config_path().display());
        info!("{}", connecting);
        machine.log(connecting);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = Supervisor::new(Arc::clone(&self.inner), request, command_rx, ready_tx);
        let task = tokio::spawn(supervisor.run());
        *active = Some(SessionHandle {
            commands: command_tx,
            task,
        });
        drop(active);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(LaunchError::Cancelled),
        }
    }

    /// Tears the session down and waits for teardown to finish.
    ///
    /// In `AuthFailed`/`Error` the state is kept; without a session this only logs.
    pub async fn disconnect(&self) {
        let machine = &self.inner.machine;
        let mut active = self.active.lock().await;

        let Some(handle) = active.take() else {
            if !is_busy(machine.state()) {
                info!("{}", NOT_CONNECTED_MESSAGE);
                machine.log(NOT_CONNECTED_MESSAGE);
            }
            return;
        };

        if !handle.task.is_finished() {
            info!("Disconnecting...");
            let (ack_tx, ack_rx) = oneshot::channel();
            if handle.commands.send(Command::Disconnect(ack_tx)).await.is_ok() {
                // Dropped unanswered if the session was already ending
                let _ = ack_rx.await;
            }
        } else if !is_busy(machine.state()) {
            machine.log(NOT_CONNECTED_MESSAGE);
        }

        if let Err(e) = handle.task.await {
            error!("Session task failed: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSource {
    Stdout,
    Stderr,
    Log,
}

#[derive(Debug)]
struct OutputLine {
    source: LineSource,
    text: String,
}

/// How a session ends
#[derive(Debug)]
enum End {
    Requested,
    /// Tunnel went away on its own
    Ended,
    Failed(SessionFailure),
}

enum Wake {
    Command(Option<Command>),
    Line(Option<OutputLine>),
    Exited(io::Result<ExitStatus>),
    Tick,
    TimedOut,
}

/// Forwards lines of a child pipe; invalid UTF-8 is replaced
fn forward_lines<R>(reader: R, source: LineSource, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { source, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Stopped reading helper {:?}: {}", source, e);
                    break;
                }
            }
        }
    });
}

fn spawn_failure(invocation: &Invocation, e: io::Error) -> SessionFailure {
    if e.kind() == io::ErrorKind::NotFound {
        SessionFailure::Launch(format!(
            "{} not found. Is the helper installed and sudo available?",
            invocation.program.display()
        ))
    } else {
        SessionFailure::Launch(format!("{}: {}", invocation.program.display(), e))
    }
}

struct Supervisor {
    inner: Arc<Inner>,
    request: ConnectionRequest,
    session: Session,
    commands: mpsc::Receiver<Command>,
    line_tx: Option<mpsc::Sender<OutputLine>>,
    lines: mpsc::Receiver<OutputLine>,
    lines_open: bool,
    tail: LogTail,
    tracker: PollTracker,
    stderr: Vec<String>,
    ready: Option<oneshot::Sender<Result<(), LaunchError>>>,
    disconnect_ack: Option<oneshot::Sender<()>>,
}

impl Supervisor {
    fn new(
        inner: Arc<Inner>,
        request: ConnectionRequest,
        commands: mpsc::Receiver<Command>,
        ready: oneshot::Sender<Result<(), LaunchError>>,
    ) -> Self {
        let (line_tx, lines) = mpsc::channel(LINE_CAPACITY);
        let tracker = PollTracker::new(
            inner.config.poll.connected_threshold,
            inner.config.poll.max_failures,
        );
        let session = Session::new(request.config_name());
        Self {
            inner,
            request,
            session,
            commands,
            line_tx: Some(line_tx),
            lines,
            lines_open: true,
            tail: LogTail::new(),
            tracker,
            stderr: Vec::new(),
            ready: Some(ready),
            disconnect_ack: None,
        }
    }

    async fn run(mut self) {
        let end = match self.launch().await {
            Err(failure) => End::Failed(failure),
            Ok(()) => match self.inner.config.connection.launch {
                LaunchMode::Handshake => match self.handshake().await {
                    Some(end) => end,
                    None => self.monitor().await,
                },
                LaunchMode::Background => {
                    self.report_ready(Ok(()));
                    self.monitor().await
                }
            },
        };
        self.finish(end).await;
    }

    fn report_ready(&mut self, result: Result<(), LaunchError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }

    /// Truncates the shared log; if that is not allowed, skips what is already there
    fn prepare_log(&mut self) {
        let path = &self.inner.config.connection.log_path;
        self.tail.reset();
        match std::fs::write(path, format!("{}\n", LOG_HEADER)) {
            Ok(()) => debug!("Truncated {}", path.display()),
            Err(e) => {
                warn!("Cannot truncate {}: {}", path.display(), e);
                if let Err(e) = self.tail.poll_lines(path) {
                    debug!("Cannot read {}: {}", path.display(), e);
                }
            }
        }
    }

    async fn launch(&mut self) -> Result<(), SessionFailure> {
        self.prepare_log();

        let inner = Arc::clone(&self.inner);
        let connection = &inner.config.connection;

        inner
            .leak_protection
            .engage()
            .await
            .map_err(|e| SessionFailure::Launch(e.to_string()))?;
        self.session.leak_engaged = true;

        let credentials = self.request.credentials().clone();
        let use_file = connection.credentials == CredentialMode::File && !credentials.is_empty();
        let use_stdin = connection.credentials == CredentialMode::Stdin && !credentials.is_empty();

        if use_file {
            let auth = AuthMaterial::create(connection.auth_dir.as_deref(), &credentials)
                .map_err(|e| SessionFailure::Launch(format!("Failed to write auth file: {}", e)))?;
            self.session.auth = Some(auth);
        }

        let invocation = inner.helper.start_invocation(
            self.request.config_path(),
            &connection.log_path,
            self.session.auth.as_ref().map(|auth| auth.path()),
            connection.proto,
        );
        info!("Starting helper: {}", invocation.display());

        let mut process =
            ManagedProcess::spawn(&invocation).map_err(|e| spawn_failure(&invocation, e))?;
        *lock(&inner.pgid) = process.pgid();

        if let Some(tx) = self.line_tx.take() {
            if let Some(stdout) = process.take_stdout() {
                forward_lines(stdout, LineSource::Stdout, tx.clone());
            }
            if let Some(stderr) = process.take_stderr() {
                forward_lines(stderr, LineSource::Stderr, tx);
            }
        }

        let stdin = process.take_stdin();
        self.session.process = Some(process);

        if let Some(mut stdin) = stdin {
            if use_stdin {
                if let Err(e) = stdin.write_all(credentials.payload().as_bytes()).await {
                    warn!("Failed to pass credentials to helper: {}", e);
                }
            }
            // Closing stdin tells the helper there is nothing more to read
            drop(stdin);
        }

        Ok(())
    }

    /// Waits for the helper to finish starting. `None` means go on to monitoring.
    async fn handshake(&mut self) -> Option<End> {
        let limit = self.inner.config.timeouts.handshake();
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            let wake = {
                let Some(process) = self.session.process.as_mut() else {
                    return Some(End::Failed(SessionFailure::UnexpectedExit));
                };
                tokio::select! {
                    cmd = self.commands.recv() => Wake::Command(cmd),
                    line = self.lines.recv(), if self.lines_open => Wake::Line(line),
                    status = process.wait() => Wake::Exited(status),
                    _ = &mut deadline => Wake::TimedOut,
                }
            };

            match wake {
                Wake::Command(cmd) => return Some(self.on_command(cmd)),
                Wake::Line(Some(line)) => {
                    if let Some(end) = self.on_line(line) {
                        return Some(end);
                    }
                }
                Wake::Line(None) => self.lines_open = false,
                Wake::Exited(Ok(status)) if status.success() => {
                    info!("Helper started {}", self.session.config_name);
                    if let Some(process) = self.session.process.as_mut() {
                        process.release_child();
                    }
                    self.report_ready(Ok(()));
                    return None;
                }
                Wake::Exited(Ok(status)) => {
                    return Some(End::Failed(self.exit_failure(status).await));
                }
                Wake::Exited(Err(e)) => {
                    return Some(End::Failed(SessionFailure::Launch(e.to_string())));
                }
                Wake::Tick => {}
                Wake::TimedOut => {
                    warn!("Helper did not finish within {}s", limit.as_secs());
                    return Some(End::Failed(SessionFailure::HandshakeTimeout(
                        limit.as_secs(),
                    )));
                }
            }
        }
    }

    async fn monitor(&mut self) -> End {
        let mut ticker = tokio::time::interval(self.inner.config.timeouts.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                line = self.lines.recv(), if self.lines_open => Wake::Line(line),
                _ = ticker.tick() => Wake::Tick,
            };

            let end = match wake {
                Wake::Command(cmd) => Some(self.on_command(cmd)),
                Wake::Line(Some(line)) => self.on_line(line),
                Wake::Line(None) => {
                    self.lines_open = false;
                    None
                }
                Wake::Tick => self.tick().await,
                Wake::Exited(_) | Wake::TimedOut => None,
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    fn on_command(&mut self, cmd: Option<Command>) -> End {
        match cmd {
            Some(Command::Disconnect(ack)) => {
                self.disconnect_ack = Some(ack);
            }
            None => info!("Manager dropped, ending session"),
        }
        End::Requested
    }

    /// Forwards a line and applies what it says
    fn on_line(&mut self, line: OutputLine) -> Option<End> {
        if line.source == LineSource::Stderr {
            if self.stderr.len() == STDERR_KEEP {
                self.stderr.remove(0);
            }
            self.stderr.push(line.text.clone());
        }
        self.inner.machine.log(line.text.as_str());

        let kind = classify(&line.text);
        if let Some(failure) = kind.failure(&line.text) {
            return Some(End::Failed(failure));
        }
        // Failure triggers are applied once, when the session is finished
        if let Some(trigger) = kind.trigger() {
            self.advance(trigger);
        }
        None
    }

    fn advance(&self, trigger: Trigger) {
        if self.inner.machine.apply(trigger) == Some(ConnectionState::Connected) {
            self.inner.machine.log(CONNECTED_MESSAGE);
        }
    }

    fn read_log(&mut self) -> Option<End> {
        let path = self.inner.config.connection.log_path.clone();
        match self.tail.poll_lines(&path) {
            Ok(lines) => {
                for text in lines {
                    let end = self.on_line(OutputLine {
                        source: LineSource::Log,
                        text,
                    });
                    if end.is_some() {
                        return end;
                    }
                }
                None
            }
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Collects output still in flight after the helper exited
    async fn drain_lines(&mut self) -> Option<End> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.lines_open {
            match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Ok(Some(line)) => {
                    if let Some(end) = self.on_line(line) {
                        return Some(end);
                    }
                }
                Ok(None) => self.lines_open = false,
                Err(_) => break,
            }
        }
        None
    }

    async fn exit_failure(&mut self, status: ExitStatus) -> SessionFailure {
        if let Some(End::Failed(failure)) = self.drain_lines().await {
            return failure;
        }
        if let Some(End::Failed(failure)) = self.read_log() {
            return failure;
        }

        let stderr = self.stderr.join("\n");
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        warn!("Helper exited with code {}", code);

        if needs_privilege_hint(&stderr) {
            return SessionFailure::Privilege {
                message: stderr.trim().to_string(),
                hint: PRIVILEGE_HINT.to_string(),
            };
        }

        match self.inner.config.connection.launch {
            LaunchMode::Handshake if stderr.trim().is_empty() => {
                SessionFailure::Launch(format!("helper exited with code {}", code))
            }
            LaunchMode::Handshake => SessionFailure::Launch(format!(
                "helper exited with code {}: {}",
                code,
                stderr.trim()
            )),
            LaunchMode::Background => SessionFailure::UnexpectedExit,
        }
    }

    async fn tick(&mut self) -> Option<End> {
        if let Some(end) = self.read_log() {
            return Some(end);
        }

        let exited = self
            .session
            .process
            .as_mut()
            .and_then(|process| process.try_exit());
        if let Some(status) = exited {
            return Some(End::Failed(self.exit_failure(status).await));
        }

        let state = self.inner.machine.state();
        if self.inner.config.poll.enabled && state.is_active() {
            let result = self
                .inner
                .helper
                .status(&self.session.config_name)
                .await
                .map(|output| PollStatus::parse(&output));

            match self.tracker.observe(state, result.as_ref().copied()) {
                PollAction::None => {}
                PollAction::Promote => {
                    info!("Helper reports the tunnel is up");
                    self.advance(Trigger::StatusConnectedStreak);
                }
                PollAction::ProcessGone => {
                    info!("{}", CONNECTION_LOST_MESSAGE);
                    self.inner.machine.log(CONNECTION_LOST_MESSAGE);
                    self.inner.machine.apply(Trigger::ProcessGone);
                    return Some(End::Ended);
                }
                PollAction::Fail(failure) => return Some(End::Failed(failure)),
            }
        }

        if self.inner.machine.state() == ConnectionState::Connecting {
            let limit = self.inner.config.timeouts.connect();
            let elapsed = self
                .session
                .process
                .as_ref()
                .map(ManagedProcess::elapsed)
                .unwrap_or_default();
            if elapsed >= limit {
                warn!("Still connecting after {}s, giving up", limit.as_secs());
                return Some(End::Failed(SessionFailure::Timeout(limit.as_secs())));
            }
        }

        None
    }

    fn record_failure(&self, failure: &SessionFailure) {
        error!("{}", failure);
        let machine = &self.inner.machine;
        machine.log(failure.to_string());
        machine.apply(failure.trigger());
        machine.emit(ManagerEvent::Failed(failure.clone()));
    }

    async fn finish(mut self, end: End) {
        let reason = match &end {
            End::Requested => TeardownReason::Requested,
            End::Ended => TeardownReason::Ended,
            End::Failed(failure) => {
                self.record_failure(failure);
                TeardownReason::Failed
            }
        };

        let report = self
            .inner
            .teardown
            .run(&mut self.session, &self.inner.machine, reason)
            .await;
        *lock(&self.inner.pgid) = None;
        debug!(
            "Teardown finished (escalated: {}, helper stop ok: {})",
            report.escalated, report.stop_ok
        );
        self.inner.machine.emit(ManagerEvent::SessionEnded);

        let result = match end {
            End::Failed(failure) => Err(LaunchError::Session(failure)),
            End::Requested | End::Ended => Err(LaunchError::Cancelled),
        };
        self.report_ready(result);
        if let Some(ack) = self.disconnect_ack.take() {
            let _ = ack.send(());
        }
    }
}
