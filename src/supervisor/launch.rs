use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

pub const STATE_DIR_ENV: &str = "GATEWAY_STATE_DIR";
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";
pub const PORT_ENV: &str = "GATEWAY_PORT";
pub const TOKEN_ENV: &str = "GATEWAY_TOKEN";
pub const SPEECH_MODEL_ENV: &str = "GATEWAY_SPEECH_MODEL";
pub const NO_RESPAWN_ENV: &str = "GATEWAY_NO_RESPAWN";
/// Tells an embedded runtime binary to behave as a plain process instead of
/// opening its own GUI.
pub const PLAIN_PROCESS_ENV: &str = "ELECTRON_RUN_AS_NODE";

pub const REMOTE_SPEECH_MODEL: &str = "remote";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechModel {
    Remote,
    Local(String),
}

impl SpeechModel {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == REMOTE_SPEECH_MODEL {
            SpeechModel::Remote
        } else {
            SpeechModel::Local(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SpeechModel::Remote => REMOTE_SPEECH_MODEL,
            SpeechModel::Local(id) => id,
        }
    }
}

/// How the supervisor decides a freshly spawned gateway is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// `GET /health` on the gateway port answers.
    #[default]
    Http,
    /// The process is still alive after a short grace period.
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub token: String,
    pub extra_bin_dirs: Vec<PathBuf>,
    pub speech_model: SpeechModel,
    pub run_as_plain_process: bool,
    pub readiness: Readiness,
}

impl GatewayLaunch {
    pub fn url(&self) -> String {
        gateway_url(self.port)
    }
}

pub fn gateway_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    pub set: BTreeMap<String, OsString>,
    pub remove: Vec<String>,
}

/// `extra` directories first, then `inherited`, each directory kept once at
/// its first position.
pub fn merge_search_path(extra: &[PathBuf], inherited: Option<&OsString>) -> Result<OsString> {
    let mut merged: Vec<PathBuf> = Vec::new();
    let inherited_dirs: Vec<PathBuf> = inherited
        .map(|value| env::split_paths(value).collect())
        .unwrap_or_default();
    for dir in extra.iter().cloned().chain(inherited_dirs) {
        if dir.as_os_str().is_empty() || merged.contains(&dir) {
            continue;
        }
        merged.push(dir);
    }
    env::join_paths(merged)
        .map_err(|err| WardenError::Config(format!("invalid search path entry: {err}")))
}

pub fn build_launch_env(launch: &GatewayLaunch, inherited_path: Option<&OsString>) -> Result<LaunchEnv> {
    let mut plan = LaunchEnv::default();
    plan.set
        .insert(STATE_DIR_ENV.to_string(), launch.state_dir.clone().into_os_string());
    plan.set
        .insert(CONFIG_PATH_ENV.to_string(), launch.config_path.clone().into_os_string());
    plan.set
        .insert(PORT_ENV.to_string(), launch.port.to_string().into());
    plan.set
        .insert(TOKEN_ENV.to_string(), launch.token.clone().into());
    plan.set.insert(
        "PATH".to_string(),
        merge_search_path(&launch.extra_bin_dirs, inherited_path)?,
    );
    // Restart policy belongs to the supervisor alone.
    plan.set.insert(NO_RESPAWN_ENV.to_string(), "1".into());
    match &launch.speech_model {
        SpeechModel::Local(id) => {
            plan.set.insert(SPEECH_MODEL_ENV.to_string(), id.clone().into());
        }
        SpeechModel::Remote => plan.remove.push(SPEECH_MODEL_ENV.to_string()),
    }
    if launch.run_as_plain_process {
        plan.set.insert(PLAIN_PROCESS_ENV.to_string(), "1".into());
    }
    Ok(plan)
}

/// Resolve a bare program name against the merged search path; explicit paths
/// are returned unchanged.
pub fn resolve_program(program: &Path, search_path: &OsString) -> Result<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return Ok(program.to_path_buf());
    }
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(program, Some(search_path), cwd).map_err(|err| {
        WardenError::Config(format!(
            "gateway program {} not found on PATH: {err}",
            program.display()
        ))
    })
}
