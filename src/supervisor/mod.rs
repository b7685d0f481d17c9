//! Lifecycle of the single gateway child process.
//!
//! A [`Supervisor`] owns at most one live gateway. `start` stops any running
//! instance first, spawns the new one with platform spawn options, writes the
//! pid file and waits for readiness. A monitor thread owns the `Child`, reaps
//! it, and records an unexpected exit as [`GatewayState::Crashed`]; nothing is
//! restarted automatically.

mod launch;
mod tail;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use launch::{
    build_launch_env, gateway_url, merge_search_path, resolve_program, GatewayLaunch, LaunchEnv,
    Readiness, SpeechModel, CONFIG_PATH_ENV, NO_RESPAWN_ENV, PLAIN_PROCESS_ENV, PORT_ENV,
    REMOTE_SPEECH_MODEL, SPEECH_MODEL_ENV, STATE_DIR_ENV, TOKEN_ENV,
};
pub use tail::{TailBuffer, TAIL_CAPACITY_BYTES};

use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic;
use crate::platform::Platform;
use crate::state::{read_pid_record, PidRecord, PID_FILE_NAME, STDERR_LOG_NAME, STDOUT_LOG_NAME};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROCESS_READY_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Crashed,
}

/// Control surface the backup engine needs from whoever runs the gateway.
pub trait GatewayControl {
    fn stop(&self) -> Result<()>;
    /// Start with the most recently configured launch parameters.
    fn start(&self) -> Result<()>;
    fn token(&self) -> Option<String>;
    fn set_token(&self, token: String);
}

/// Decides whether a started gateway answers on its port.
pub trait HealthProbe: Send + Sync {
    fn is_ready(&self, port: u16, token: &str) -> bool;
}

pub struct HttpHealthProbe {
    client: reqwest::blocking::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpHealthProbe {
    /// Any HTTP response counts; only connection failures mean "not yet".
    fn is_ready(&self, port: u16, token: &str) -> bool {
        self.client
            .get(format!("{}health", gateway_url(port)))
            .bearer_auth(token)
            .send()
            .is_ok()
    }
}

/// What a `gateway.pid` left on disk says about a gateway from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedGateway {
    /// No pid file, its process exited, or the pid now belongs to another
    /// process.
    Gone,
    /// Alive, and its identity matches the one recorded at spawn.
    Running(u32),
    /// Alive, but nothing ties it to the gateway that wrote the file.
    Unverified(u32),
}

pub fn recorded_gateway(platform: &dyn Platform, pid_path: &Path) -> RecordedGateway {
    let Some(record) = read_pid_record(pid_path) else {
        return RecordedGateway::Gone;
    };
    let pid = record.pid;
    if pid == std::process::id() || !platform.is_process_alive(pid) {
        return RecordedGateway::Gone;
    }
    match (record.identity, platform.process_identity(pid)) {
        (Some(recorded), Some(current)) if recorded == current => RecordedGateway::Running(pid),
        (Some(_), Some(_)) => RecordedGateway::Gone,
        _ => RecordedGateway::Unverified(pid),
    }
}

#[derive(Debug, Clone)]
pub struct GatewayProcess {
    pub pid: u32,
    pub port: u16,
    pub token: String,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// Process group id on hosts where the gateway leads its own group.
    pub process_group: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl GatewayProcess {
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join(PID_FILE_NAME)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayInfo {
    pub state: GatewayState,
    pub url: Option<String>,
    pub token: Option<String>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<String>,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

#[derive(Debug)]
struct Shared {
    state: GatewayState,
    process: Option<GatewayProcess>,
    tail: TailBuffer,
    exit_code: Option<i32>,
    /// Bumped on each spawn so stale threads never touch a newer instance.
    generation: u64,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: GatewayState::NotStarted,
            process: None,
            tail: TailBuffer::default(),
            exit_code: None,
            generation: 0,
        }
    }
}

type SharedState = Arc<(Mutex<Shared>, Condvar)>;

pub struct Supervisor {
    platform: Arc<dyn Platform>,
    probe: Box<dyn HealthProbe>,
    stop_timeout: Duration,
    shared: SharedState,
    launch: Mutex<Option<GatewayLaunch>>,
}

impl Supervisor {
    pub fn new(platform: Arc<dyn Platform>, probe: Box<dyn HealthProbe>) -> Self {
        Self {
            platform,
            probe,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            shared: Arc::new((Mutex::new(Shared::default()), Condvar::new())),
            launch: Mutex::new(None),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    fn lock_shared(&self) -> Result<MutexGuard<'_, Shared>> {
        self.shared
            .0
            .lock()
            .map_err(|_| WardenError::Process("supervisor state lock poisoned".to_string()))
    }

    fn configured_launch(&self) -> Result<Option<GatewayLaunch>> {
        self.launch
            .lock()
            .map(|launch| launch.clone())
            .map_err(|_| WardenError::Process("supervisor launch lock poisoned".to_string()))
    }

    /// Record launch parameters without starting anything.
    pub fn configure(&self, launch: GatewayLaunch) -> Result<()> {
        let mut slot = self
            .launch
            .lock()
            .map_err(|_| WardenError::Process("supervisor launch lock poisoned".to_string()))?;
        *slot = Some(launch);
        Ok(())
    }

    pub fn state(&self) -> GatewayState {
        self.lock_shared()
            .map(|shared| shared.state)
            .unwrap_or(GatewayState::NotStarted)
    }

    pub fn is_running(&self) -> bool {
        self.lock_shared()
            .map(|shared| shared.process.is_some())
            .unwrap_or(false)
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_shared()
            .ok()
            .and_then(|shared| shared.process.as_ref().map(|p| p.pid))
    }

    pub fn info(&self) -> GatewayInfo {
        let launch = self.configured_launch().ok().flatten();
        let Ok(shared) = self.lock_shared() else {
            return GatewayInfo {
                state: GatewayState::NotStarted,
                url: None,
                token: None,
                pid: None,
                port: None,
                started_at: None,
                exit_code: None,
                stderr_tail: String::new(),
            };
        };
        let port = shared
            .process
            .as_ref()
            .map(|p| p.port)
            .or(launch.as_ref().map(|l| l.port));
        GatewayInfo {
            state: shared.state,
            url: port.map(gateway_url),
            token: shared
                .process
                .as_ref()
                .map(|p| p.token.clone())
                .or(launch.map(|l| l.token)),
            pid: shared.process.as_ref().map(|p| p.pid),
            port,
            started_at: shared.process.as_ref().map(|p| p.started_at.to_rfc3339()),
            exit_code: shared.exit_code,
            stderr_tail: shared.tail.snapshot(),
        }
    }

    /// Configure `launch` and start it, replacing any running gateway.
    pub fn start_with(&self, launch: GatewayLaunch) -> Result<GatewayInfo> {
        self.configure(launch)?;
        self.start_configured()?;
        Ok(self.info())
    }

    fn start_configured(&self) -> Result<()> {
        let launch = self.configured_launch()?.ok_or_else(|| {
            WardenError::Config("gateway launch parameters are not configured".to_string())
        })?;

        if self.is_running() {
            info!("gateway already running; stopping it before starting a new instance");
            self.stop()?;
        }
        self.reap_stale_pid_file(&launch);

        let (pid, generation) = self.spawn(&launch)?;
        let startup_timeout = self.platform.gateway_spawn_options().startup_timeout;
        self.wait_ready(&launch, pid, generation, startup_timeout)
    }

    /// A pid file whose process still matches its recorded identity means an
    /// earlier host left a gateway behind holding the same port and state
    /// directory. Anything else named by the file is never signalled.
    fn reap_stale_pid_file(&self, launch: &GatewayLaunch) {
        let pid_path = launch.state_dir.join(PID_FILE_NAME);
        match recorded_gateway(self.platform.as_ref(), &pid_path) {
            RecordedGateway::Gone => {}
            RecordedGateway::Running(pid) => {
                warn!(pid, "reaping gateway left behind by a previous run");
                self.terminate_tree(pid);
            }
            RecordedGateway::Unverified(pid) => {
                warn!(pid, "pid file names a live process that cannot be verified as the gateway; leaving it alone");
            }
        }
        let _ = fs::remove_file(&pid_path);
    }

    /// Graceful tree termination for half the stop timeout, then a forced
    /// kill of the whole tree for the rest. Returns whether the tree exited.
    fn terminate_tree(&self, pid: u32) -> bool {
        if let Err(err) = self.platform.kill_process_tree(pid, false) {
            warn!(pid, error = %err, "graceful termination failed");
        }
        let graceful = self.stop_timeout / 2;
        if self.wait_for_exit(pid, graceful) {
            return true;
        }
        warn!(pid, "gateway tree ignored termination; forcing");
        if let Err(err) = self.platform.kill_process_tree(pid, true) {
            warn!(pid, error = %err, "forced termination failed");
        }
        self.wait_for_exit(pid, self.stop_timeout.saturating_sub(graceful))
    }

    fn spawn(&self, launch: &GatewayLaunch) -> Result<(u32, u64)> {
        fs::create_dir_all(&launch.logs_dir)?;
        fs::create_dir_all(&launch.state_dir)?;
        let stdout_log = launch.logs_dir.join(STDOUT_LOG_NAME);
        let stderr_log = launch.logs_dir.join(STDERR_LOG_NAME);
        let stdout_file = open_append(&stdout_log)?;
        let stderr_file = open_append(&stderr_log)?;

        let options = self.platform.gateway_spawn_options();
        let inherited_path = std::env::var_os("PATH");
        let env_plan = build_launch_env(launch, inherited_path.as_ref())?;
        let search_path = env_plan.set.get("PATH").cloned().unwrap_or_default();
        let program = resolve_program(&launch.program, &search_path)?;

        let mut cmd = options.defaults.command(&program);
        cmd.args(&launch.args)
            .args(&options.extra_launch_args)
            .current_dir(&launch.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::piped());
        for (key, value) in &env_plan.set {
            cmd.env(key, value);
        }
        for key in &env_plan.remove {
            cmd.env_remove(key);
        }
        #[cfg(unix)]
        if options.process_group_leader {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|err| {
            WardenError::Process(format!(
                "failed to start gateway {}: {err}",
                program.display()
            ))
        })?;
        let pid = child.id();
        let stderr = child.stderr.take();

        let process = GatewayProcess {
            pid,
            port: launch.port,
            token: launch.token.clone(),
            state_dir: launch.state_dir.clone(),
            config_path: launch.config_path.clone(),
            stdout_log,
            stderr_log,
            process_group: options.process_group_leader.then_some(pid),
            started_at: Utc::now(),
        };
        let record = PidRecord {
            pid,
            identity: self.platform.process_identity(pid),
        };
        if let Err(err) = write_atomic(&process.pid_path(), record.render().as_bytes()) {
            let _ = self.platform.kill_process_tree(pid, true);
            let _ = child.wait();
            return Err(err);
        }

        let generation = {
            let mut shared = self.lock_shared()?;
            shared.generation += 1;
            shared.state = GatewayState::Starting;
            shared.exit_code = None;
            shared.tail.clear();
            shared.process = Some(process);
            shared.generation
        };
        info!(pid, port = launch.port, program = %program.display(), "gateway spawned");

        if let Some(stderr) = stderr {
            spawn_stderr_pump(Arc::clone(&self.shared), generation, stderr, stderr_file);
        }
        spawn_monitor(Arc::clone(&self.shared), generation, child);
        Ok((pid, generation))
    }

    fn wait_ready(
        &self,
        launch: &GatewayLaunch,
        pid: u32,
        generation: u64,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            {
                let mut shared = self.lock_shared()?;
                if shared.generation != generation {
                    return Err(WardenError::Process(
                        "gateway was replaced during startup".to_string(),
                    ));
                }
                match shared.state {
                    GatewayState::Crashed => {
                        let code = shared
                            .exit_code
                            .map_or_else(|| "signal".to_string(), |c| c.to_string());
                        return Err(WardenError::ProcessDetailed {
                            message: format!("gateway exited during startup (status: {code})"),
                            stderr_tail: shared.tail.snapshot(),
                        });
                    }
                    GatewayState::Starting => {}
                    _ => return Ok(()),
                }
                let ready = match launch.readiness {
                    Readiness::Process => started.elapsed() >= PROCESS_READY_GRACE,
                    Readiness::Http => false,
                };
                if ready {
                    shared.state = GatewayState::Ready;
                    info!(pid, "gateway ready");
                    return Ok(());
                }
            }

            if launch.readiness == Readiness::Http && self.probe.is_ready(launch.port, &launch.token)
            {
                let mut shared = self.lock_shared()?;
                if shared.generation == generation && shared.state == GatewayState::Starting {
                    shared.state = GatewayState::Ready;
                    info!(pid, port = launch.port, "gateway ready");
                    return Ok(());
                }
                continue;
            }

            if started.elapsed() >= timeout {
                let stderr_tail = self.lock_shared()?.tail.snapshot();
                warn!(pid, timeout_ms = timeout.as_millis() as u64, "gateway startup timed out");
                self.stop()?;
                return Err(WardenError::ProcessDetailed {
                    message: format!(
                        "gateway did not become ready within {}s",
                        timeout.as_secs()
                    ),
                    stderr_tail,
                });
            }
            let (lock, condvar) = &*self.shared;
            if let Ok(guard) = lock.lock() {
                let _ = condvar.wait_timeout(guard, POLL_INTERVAL);
            }
        }
    }

    /// Terminate the gateway tree and wait, bounded, for the pid to vanish.
    /// With nothing running this is a no-op.
    pub fn stop(&self) -> Result<()> {
        let (process, generation) = {
            let mut shared = self.lock_shared()?;
            let Some(process) = shared.process.clone() else {
                debug!("stop requested with no running gateway");
                return Ok(());
            };
            shared.state = GatewayState::Stopping;
            (process, shared.generation)
        };
        let pid = process.pid;
        info!(pid, "stopping gateway");

        if !self.terminate_tree(pid) {
            warn!(
                pid,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "gateway still alive after stop timeout; giving up"
            );
        }

        {
            let mut shared = self.lock_shared()?;
            if shared.generation == generation {
                shared.process = None;
                shared.state = GatewayState::NotStarted;
            }
        }
        let _ = fs::remove_file(process.pid_path());
        info!(pid, "gateway stopped");
        Ok(())
    }

    /// Waits for the whole tree, not only the leader.
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.platform.is_process_tree_alive(pid) {
                return true;
            }
            thread::sleep(POLL_INTERVAL.min(Duration::from_millis(50)));
        }
        !self.platform.is_process_tree_alive(pid)
    }
}

impl GatewayControl for Supervisor {
    fn stop(&self) -> Result<()> {
        Supervisor::stop(self)
    }

    fn start(&self) -> Result<()> {
        self.start_configured()
    }

    fn token(&self) -> Option<String> {
        self.configured_launch().ok().flatten().map(|l| l.token)
    }

    fn set_token(&self, token: String) {
        if let Ok(mut slot) = self.launch.lock() {
            if let Some(launch) = slot.as_mut() {
                launch.token = token;
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(err) = self.stop() {
                warn!(error = %err, "failed to stop gateway on shutdown");
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            WardenError::Process(format!("failed to open log {}: {err}", path.display()))
        })
}

fn spawn_stderr_pump(shared: SharedState, generation: u64, mut stderr: ChildStderr, mut log: File) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = log.write_all(&buf[..n]);
                    if let Ok(mut state) = shared.0.lock() {
                        if state.generation == generation {
                            state.tail.push(&buf[..n]);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = log.flush();
    });
}

fn spawn_monitor(shared: SharedState, generation: u64, mut child: Child) {
    thread::spawn(move || {
        let status = child.wait();
        let (lock, condvar) = &*shared;
        let Ok(mut state) = lock.lock() else {
            return;
        };
        if state.generation != generation {
            return;
        }
        let code = status.as_ref().ok().and_then(|s| s.code());
        state.exit_code = code;
        match state.state {
            GatewayState::Stopping | GatewayState::NotStarted => {
                debug!(?code, "gateway exited after stop request");
            }
            _ => {
                let pid_path = state.process.as_ref().map(GatewayProcess::pid_path);
                state.state = GatewayState::Crashed;
                state.process = None;
                error!(
                    ?code,
                    stderr_tail = %last_lines(&state.tail.snapshot(), 5),
                    "gateway exited unexpectedly"
                );
                if let Some(pid_path) = pid_path {
                    let _ = fs::remove_file(pid_path);
                }
            }
        }
        condvar.notify_all();
    });
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}
