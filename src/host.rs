//! Request/response boundary between the UI and the supervisor subsystem.
//!
//! [`Host`] owns the settings, the [`Supervisor`] and a state lock that every
//! operation touching the state directory holds, so a migration, a restore
//! and a start can never interleave. [`Host::dispatch`] reports every failure
//! as an [`ApiResult`] rather than an `Err`.
//!
//! A restore registers a [`CancelFlag`] before it waits for the state lock, so
//! `backup.cancel` can abort it until the gateway has been stopped.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth_profiles;
use crate::backup::{
    self, BackupDestination, BackupOutcome, CancelFlag, FixedDestination, RestoreFailure,
    RestoreReport,
};
use crate::error::{Result, WardenError};
use crate::migrations::{self, MigrationReport};
use crate::platform::{self, Platform};
use crate::settings::{read_settings, write_settings, ResolvedPaths, Settings};
use crate::state::{read_config_token, StateLayout};
use crate::supervisor::{
    merge_search_path, resolve_program, GatewayInfo, GatewayLaunch, HealthProbe, HttpHealthProbe,
    SpeechModel, Supervisor,
};

const BACKUPS_DIR_NAME: &str = "backups";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unrecoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

impl ApiResult {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failure(err: &WardenError) -> Self {
        Self {
            ok: false,
            error: Some(err.to_string()),
            cancelled: matches!(err, WardenError::Cancelled),
            stderr_tail: err.stderr_tail().map(str::to_string),
            ..Self::default()
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(WardenError::from)) {
            Ok(value) => Self::success(value),
            Err(err) => Self::failure(&err),
        }
    }
}

impl From<RestoreFailure> for ApiResult {
    fn from(failure: RestoreFailure) -> Self {
        let mut result = Self::failure(&failure.error);
        result.unrecoverable = failure.unrecoverable;
        if let Some(path) = failure.safety_backup {
            result.result = Some(json!({ "safety_backup": path }));
        }
        result
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub op: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(flatten)]
    pub result: ApiResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub initialized: bool,
    pub migrations: MigrationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayInfo>,
}

pub struct Host {
    settings_path: PathBuf,
    settings: Mutex<Settings>,
    paths: ResolvedPaths,
    platform: Arc<dyn Platform>,
    supervisor: Supervisor,
    state_lock: Mutex<()>,
    restores: Mutex<Vec<CancelFlag>>,
}

impl Host {
    pub fn new(
        settings_path: PathBuf,
        settings: Settings,
        platform: Arc<dyn Platform>,
        probe: Box<dyn HealthProbe>,
    ) -> Self {
        let paths = settings.resolve_paths(&settings_path);
        let supervisor = Supervisor::new(Arc::clone(&platform), probe)
            .with_stop_timeout(settings.stop_timeout());
        Self {
            settings_path,
            settings: Mutex::new(settings),
            paths,
            platform,
            supervisor,
            state_lock: Mutex::new(()),
            restores: Mutex::new(Vec::new()),
        }
    }

    /// Load settings from `settings_path` and wire up the host platform.
    pub fn open(settings_path: PathBuf) -> Result<Self> {
        let settings = read_settings(&settings_path)?;
        let probe = HttpHealthProbe::new()?;
        Ok(Self::new(
            settings_path,
            settings,
            platform::current(),
            Box::new(probe),
        ))
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn layout(&self) -> StateLayout {
        self.paths.layout()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(self.lock_settings()?.clone())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ()>> {
        self.state_lock
            .lock()
            .map_err(|_| WardenError::Process("state lock poisoned".to_string()))
    }

    fn lock_settings(&self) -> Result<MutexGuard<'_, Settings>> {
        self.settings
            .lock()
            .map_err(|_| WardenError::Process("settings lock poisoned".to_string()))
    }

    /// Launch parameters from current settings and the token in the config.
    fn current_launch(&self) -> Result<GatewayLaunch> {
        let token = read_config_token(&self.layout().config_path())?;
        Ok(self.lock_settings()?.launch(&self.paths, token))
    }

    /// First-run initialization, migrations, optional wrapper install and,
    /// when `autostart` is set, the initial gateway start.
    pub fn startup(&self, autostart: bool) -> Result<StartupReport> {
        let _guard = self.lock_state()?;
        let layout = self.layout();
        let initialized = layout.ensure_initialized()?;
        let migrations = migrations::run(&layout.config_path(), &layout.metadata_dir)?;
        let launch = self.current_launch()?;
        self.supervisor.configure(launch.clone())?;

        let wrapper_name = self.lock_settings()?.gateway.wrapper_name.trim().to_string();
        let wrapper = if wrapper_name.is_empty() {
            None
        } else {
            match self.install_wrapper_locked(&wrapper_name, None, &launch) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %err, "failed to install command-line wrapper");
                    None
                }
            }
        };

        let gateway = if autostart {
            Some(self.supervisor.start_with(launch)?)
        } else {
            None
        };
        Ok(StartupReport {
            initialized,
            migrations,
            wrapper,
            gateway,
        })
    }

    pub fn run_migrations(&self) -> Result<MigrationReport> {
        let _guard = self.lock_state()?;
        let layout = self.layout();
        migrations::run(&layout.config_path(), &layout.metadata_dir)
    }

    pub fn start_gateway(&self) -> Result<GatewayInfo> {
        let _guard = self.lock_state()?;
        self.layout().ensure_initialized()?;
        let launch = self.current_launch()?;
        self.supervisor.start_with(launch)
    }

    pub fn stop_gateway(&self) -> Result<GatewayInfo> {
        let _guard = self.lock_state()?;
        self.supervisor.stop()?;
        Ok(self.supervisor.info())
    }

    pub fn gateway_info(&self) -> GatewayInfo {
        self.supervisor.info()
    }

    pub fn create_backup(&self, destination: &dyn BackupDestination) -> Result<BackupOutcome> {
        let _guard = self.lock_state()?;
        backup::save_backup(&self.paths.state_dir, destination)
    }

    /// Default location for backups requested without a path.
    pub fn default_backup_dir(&self) -> PathBuf {
        self.paths.metadata_dir.join(BACKUPS_DIR_NAME)
    }

    pub fn restore_backup(
        &self,
        archive_bytes: &[u8],
    ) -> std::result::Result<RestoreReport, RestoreFailure> {
        let cancel = CancelFlag::new();
        self.restores
            .lock()
            .map_err(|_| {
                RestoreFailure::clean(WardenError::Process("restore registry poisoned".to_string()))
            })?
            .push(cancel.clone());
        let result = self.restore_locked(archive_bytes, &cancel);
        if let Ok(mut restores) = self.restores.lock() {
            restores.retain(|flag| !flag.is_same(&cancel));
        }
        result
    }

    fn restore_locked(
        &self,
        archive_bytes: &[u8],
        cancel: &CancelFlag,
    ) -> std::result::Result<RestoreReport, RestoreFailure> {
        let _guard = self.lock_state().map_err(RestoreFailure::clean)?;
        // Rollback needs something to restart even if nothing ran yet.
        if let Ok(launch) = self.current_launch() {
            let _ = self.supervisor.configure(launch);
        }
        backup::restore(
            &self.layout(),
            self.platform.as_ref(),
            &self.supervisor,
            archive_bytes,
            cancel,
        )
    }

    /// Flag every in-flight restore for cancellation. Restores that already
    /// stopped the gateway finish or roll back regardless. Returns how many
    /// were flagged.
    pub fn cancel_restores(&self) -> usize {
        let Ok(restores) = self.restores.lock() else {
            return 0;
        };
        for flag in restores.iter() {
            flag.cancel();
        }
        if !restores.is_empty() {
            info!(count = restores.len(), "restore cancellation requested");
        }
        restores.len()
    }

    pub fn upsert_api_key_profile(&self, provider: &str, key: &str) -> Result<Value> {
        let _guard = self.lock_state()?;
        let agent_id = self.lock_settings()?.agent_id.clone();
        let path = self.layout().auth_profiles_path(&agent_id);
        let store = auth_profiles::upsert_api_key(&path, provider, key, self.platform.as_ref())?;
        let provider = provider.trim();
        Ok(json!({
            "profile_id": auth_profiles::api_key_profile_id(provider),
            "order": store.order.get(provider).cloned().unwrap_or_default(),
            "path": path,
        }))
    }

    /// Persist the selection; a running gateway is restarted so the new
    /// environment takes effect.
    pub fn set_selected_speech_model(&self, model_id: &str) -> Result<Value> {
        let _guard = self.lock_state()?;
        let selected = {
            let mut settings = self.lock_settings()?;
            let mut updated = settings.clone();
            updated.speech_model = SpeechModel::parse(model_id).as_str().to_string();
            write_settings(&self.settings_path, &updated)?;
            *settings = updated;
            settings.speech_model.clone()
        };
        info!(speech_model = %selected, "speech model selected");

        let restarted = if self.supervisor.is_running() {
            let launch = self.current_launch()?;
            self.supervisor.start_with(launch)?;
            true
        } else {
            if let Ok(launch) = self.current_launch() {
                self.supervisor.configure(launch)?;
            }
            false
        };
        Ok(json!({ "speech_model": selected, "restarted": restarted }))
    }

    pub fn install_wrapper(&self, name: &str, target: Option<PathBuf>) -> Result<PathBuf> {
        let _guard = self.lock_state()?;
        let launch = self.current_launch_or_default()?;
        self.install_wrapper_locked(name, target, &launch)
    }

    fn current_launch_or_default(&self) -> Result<GatewayLaunch> {
        match self.current_launch() {
            Ok(launch) => Ok(launch),
            Err(_) => Ok(self.lock_settings()?.launch(&self.paths, String::new())),
        }
    }

    fn install_wrapper_locked(
        &self,
        name: &str,
        target: Option<PathBuf>,
        launch: &GatewayLaunch,
    ) -> Result<PathBuf> {
        let target = match target {
            Some(target) => target,
            None => {
                let inherited = std::env::var_os("PATH");
                let search = merge_search_path(&launch.extra_bin_dirs, inherited.as_ref())?;
                resolve_program(&launch.program, &search)?
            }
        };
        let path = self
            .platform
            .create_shell_wrapper(&self.paths.bin_dir, name, &target)?;
        info!(wrapper = %path.display(), target = %target.display(), "installed wrapper");
        Ok(path)
    }

    /// Stop the gateway on the way out.
    pub fn shutdown(&self) {
        match self.lock_state() {
            Ok(_guard) => {
                if let Err(err) = self.supervisor.stop() {
                    warn!(error = %err, "failed to stop gateway during shutdown");
                }
            }
            Err(err) => warn!(error = %err, "shutdown without state lock"),
        }
    }

    pub fn dispatch(&self, op: &str, payload: &Value) -> ApiResult {
        match op {
            "gateway.start" => ApiResult::from_result(self.start_gateway()),
            "gateway.stop" => ApiResult::from_result(self.stop_gateway()),
            "gateway.info" => ApiResult::from_result(Ok(self.gateway_info())),
            "backup.create" => {
                let destination = match payload.get("path").and_then(Value::as_str) {
                    Some(path) if !path.trim().is_empty() => PathBuf::from(path),
                    _ => {
                        let dir = self.default_backup_dir();
                        if let Err(err) = std::fs::create_dir_all(&dir) {
                            return ApiResult::failure(&WardenError::from(err));
                        }
                        dir
                    }
                };
                match self.create_backup(&FixedDestination(destination)) {
                    Ok(BackupOutcome::Cancelled) => ApiResult {
                        ok: false,
                        cancelled: true,
                        ..ApiResult::default()
                    },
                    other => ApiResult::from_result(other),
                }
            }
            "backup.restore" => {
                let Some(data) = payload.get("data").and_then(Value::as_str) else {
                    return ApiResult::failure(&WardenError::Config(
                        "backup.restore requires a base64 `data` field".to_string(),
                    ));
                };
                let bytes = match BASE64.decode(data.trim()) {
                    Ok(bytes) => bytes,
                    Err(err) => return ApiResult::failure(&WardenError::from(err)),
                };
                match self.restore_backup(&bytes) {
                    Ok(report) => ApiResult::from_result(Ok(report)),
                    Err(failure) => failure.into(),
                }
            }
            "backup.cancel" => ApiResult::success(json!({ "flagged": self.cancel_restores() })),
            "auth.upsertApiKey" => {
                let provider = payload.get("provider").and_then(Value::as_str);
                let key = payload.get("key").and_then(Value::as_str);
                match (provider, key) {
                    (Some(provider), Some(key)) => {
                        ApiResult::from_result(self.upsert_api_key_profile(provider, key))
                    }
                    _ => ApiResult::failure(&WardenError::Config(
                        "auth.upsertApiKey requires `provider` and `key`".to_string(),
                    )),
                }
            }
            "speech.setModel" => match payload.get("modelId").and_then(Value::as_str) {
                Some(model_id) => ApiResult::from_result(self.set_selected_speech_model(model_id)),
                None => ApiResult::failure(&WardenError::Config(
                    "speech.setModel requires `modelId`".to_string(),
                )),
            },
            other => ApiResult::failure(&WardenError::Config(format!("unknown op '{other}'"))),
        }
    }

    /// Ops the serve loop runs off the reader thread so that later requests,
    /// `backup.cancel` in particular, are still read while they work.
    pub fn runs_concurrently(op: &str) -> bool {
        op == "backup.restore"
    }

    pub fn parse_request(line: &str) -> std::result::Result<Request, Response> {
        serde_json::from_str::<Request>(line).map_err(|err| Response {
            id: Value::Null,
            result: ApiResult::failure(&WardenError::from(err)),
        })
    }

    pub fn handle_request(&self, request: Request) -> Response {
        Response {
            result: self.dispatch(&request.op, &request.payload),
            id: request.id,
        }
    }

    /// Parse one request line and dispatch it.
    pub fn handle_line(&self, line: &str) -> Response {
        match Self::parse_request(line) {
            Ok(request) => self.handle_request(request),
            Err(response) => response,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::tests::NeverReady;
    use crate::supervisor::{GatewayState, Readiness};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn host_with(script: &str) -> (TempDir, Host) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.gateway.program = "sh".to_string();
        settings.gateway.args = vec!["-c".to_string(), script.to_string(), "gateway".to_string()];
        settings.gateway.readiness = Readiness::Process;
        settings.gateway.stop_timeout_ms = 4_000;
        settings.paths.state_dir = dir.path().join("state").to_string_lossy().to_string();
        let host = Host::new(
            dir.path().join("settings.yaml"),
            settings,
            platform::current(),
            Box::new(NeverReady),
        );
        (dir, host)
    }

    #[test]
    fn startup_initializes_migrates_and_starts() {
        let (_dir, host) = host_with("exec sleep 30");
        let report = host.startup(true).unwrap();
        assert!(report.initialized);
        assert_eq!(report.migrations.to_version, migrations::latest_version());
        let gateway = report.gateway.unwrap();
        assert_eq!(gateway.state, GatewayState::Ready);
        let token = read_config_token(&host.layout().config_path()).unwrap();
        assert_eq!(gateway.token.as_deref(), Some(token.as_str()));
        host.shutdown();
        assert!(!host.supervisor().is_running());
    }

    #[test]
    fn dispatch_reports_unknown_ops_and_bad_payloads() {
        let (_dir, host) = host_with("exec sleep 30");
        let result = host.dispatch("nope", &Value::Null);
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("unknown op"));

        let result = host.dispatch("backup.restore", &json!({"data": "!!!"}));
        assert!(!result.ok);
        let result = host.dispatch("auth.upsertApiKey", &json!({"provider": "openai"}));
        assert!(!result.ok);
    }

    #[test]
    fn api_key_upsert_goes_to_agent_store() {
        let (_dir, host) = host_with("exec sleep 30");
        host.startup(false).unwrap();
        let result = host.dispatch(
            "auth.upsertApiKey",
            &json!({"provider": "anthropic", "key": "sk-ant"}),
        );
        assert!(result.ok, "{:?}", result.error);
        let path = host.layout().auth_profiles_path("main");
        let raw: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(raw["order"]["anthropic"][0], "anthropic:default");
    }

    #[test]
    fn speech_model_change_restarts_running_gateway() {
        let (dir, host) = host_with("exec sleep 30");
        host.startup(true).unwrap();
        let first = host.gateway_info().pid.unwrap();

        let result = host.dispatch("speech.setModel", &json!({"modelId": "whisper-small"}));
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result.as_ref().unwrap()["restarted"], true);
        assert_ne!(host.gateway_info().pid.unwrap(), first);
        let saved = read_settings(&dir.path().join("settings.yaml")).unwrap();
        assert_eq!(saved.speech_model, "whisper-small");
        host.shutdown();
    }

    #[test]
    fn backup_and_restore_through_dispatch() {
        let (dir, host) = host_with("exec sleep 30");
        host.startup(true).unwrap();
        let out = dir.path().join("out").join("snap.tar.gz");
        let created = host.dispatch("backup.create", &json!({"path": out}));
        assert!(created.ok, "{:?}", created.error);
        assert!(out.is_file());

        let encoded = BASE64.encode(fs::read(&out).unwrap());
        let restored = host.dispatch("backup.restore", &json!({"data": encoded}));
        assert!(restored.ok, "{:?}", restored.error);
        assert!(host.supervisor().is_running());
        assert!(restored.result.unwrap()["safety_backup"].is_string());
        host.shutdown();
    }

    #[test]
    fn cancel_reaches_restore_waiting_for_state_lock() {
        let (_dir, host) = host_with("exec sleep 30");
        host.startup(true).unwrap();
        let pid = host.gateway_info().pid;
        let encoded = BASE64.encode(backup::create_backup(&host.paths().state_dir).unwrap());
        let idle = host.dispatch("backup.cancel", &Value::Null);
        assert_eq!(idle.result.unwrap()["flagged"], 0);

        let guard = host.state_lock.lock().unwrap();
        let result = std::thread::scope(|scope| {
            let restore =
                scope.spawn(|| host.dispatch("backup.restore", &json!({"data": encoded})));
            while host.restores.lock().unwrap().is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            let cancel = host.dispatch("backup.cancel", &Value::Null);
            assert_eq!(cancel.result.unwrap()["flagged"], 1);
            drop(guard);
            restore.join().unwrap()
        });

        assert!(!result.ok);
        assert!(result.cancelled);
        assert_eq!(host.gateway_info().pid, pid);
        assert!(host.restores.lock().unwrap().is_empty());
        host.shutdown();
    }

    #[test]
    fn request_lines_echo_ids() {
        let (_dir, host) = host_with("exec sleep 30");
        let response = host.handle_line(r#"{"id": 7, "op": "gateway.info"}"#);
        assert_eq!(response.id, json!(7));
        assert!(response.result.ok);

        let response = host.handle_line("not json");
        assert!(!response.result.ok);
        assert_eq!(response.id, Value::Null);
    }
}
