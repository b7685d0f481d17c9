//! The supervisor's own YAML settings.
//!
//! Path fields left empty resolve relative to the directory holding the
//! settings file, so a single `--settings` flag relocates everything.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic;
use crate::state::StateLayout;
use crate::supervisor::{GatewayLaunch, Readiness, SpeechModel, REMOTE_SPEECH_MODEL};

pub const SETTINGS_VERSION: u32 = 1;
pub const SETTINGS_FILE_NAME: &str = "settings.yaml";
pub const SETTINGS_ENV: &str = "WARDEN_SETTINGS";
pub const CONFIG_DIR_ENV: &str = "WARDEN_CONFIG_DIR";
pub const STATE_DIR_ENV: &str = "WARDEN_STATE_DIR";
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    pub paths: PathSettings,
    pub gateway: GatewaySettings,
    pub speech_model: String,
    pub agent_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    pub state_dir: String,
    pub logs_dir: String,
    pub metadata_dir: String,
    pub bin_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySettings {
    pub program: String,
    pub args: Vec<String>,
    pub port: u16,
    pub extra_bin_dirs: Vec<String>,
    pub readiness: Readiness,
    pub run_as_plain_process: bool,
    pub stop_timeout_ms: u64,
    /// Name of the command-line launcher to install; empty disables it.
    pub wrapper_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            paths: PathSettings::default(),
            gateway: GatewaySettings::default(),
            speech_model: REMOTE_SPEECH_MODEL.to_string(),
            agent_id: "main".to_string(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            program: "gateway".to_string(),
            args: Vec::new(),
            port: DEFAULT_GATEWAY_PORT,
            extra_bin_dirs: Vec::new(),
            readiness: Readiness::Http,
            run_as_plain_process: false,
            stop_timeout_ms: 10_000,
            wrapper_name: String::new(),
        }
    }
}

/// Every location the supervisor touches, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub settings_path: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl ResolvedPaths {
    pub fn layout(&self) -> StateLayout {
        StateLayout::new(
            self.state_dir.clone(),
            self.logs_dir.clone(),
            self.metadata_dir.clone(),
        )
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_DIR_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("warden");
    base
}

pub fn resolve_settings_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(SETTINGS_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join(SETTINGS_FILE_NAME)
}

fn expand_path(input: &str) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn path_or(configured: &str, base: &Path, fallback: &str) -> PathBuf {
    let configured = configured.trim();
    if configured.is_empty() {
        return if fallback.is_empty() {
            base.to_path_buf()
        } else {
            base.join(fallback)
        };
    }
    let expanded = expand_path(configured);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

pub fn read_settings_from_str(content: &str) -> Result<Settings> {
    let settings: Settings = serde_yaml::from_str(content)?;
    if settings.version != SETTINGS_VERSION {
        return Err(WardenError::Config(format!(
            "unsupported settings version {}",
            settings.version
        )));
    }
    validate_settings(&settings)?;
    Ok(settings)
}

/// A missing file yields defaults; a malformed one is an error.
pub fn read_settings(path: &Path) -> Result<Settings> {
    match fs::read_to_string(path) {
        Ok(content) => read_settings_from_str(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;
    let content = serde_yaml::to_string(settings)?;
    write_atomic(path, content.as_bytes())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.gateway.program.trim().is_empty() {
        return Err(WardenError::Config(
            "gateway.program must be non-empty".to_string(),
        ));
    }
    if settings.gateway.port == 0 {
        return Err(WardenError::Config(
            "gateway.port must be greater than 0".to_string(),
        ));
    }
    if settings.gateway.stop_timeout_ms == 0 {
        return Err(WardenError::Config(
            "gateway.stop_timeout_ms must be greater than 0".to_string(),
        ));
    }
    let agent = settings.agent_id.trim();
    if agent.is_empty() || agent.contains(['/', '\\']) || agent == ".." {
        return Err(WardenError::Config(format!(
            "agent_id must be a plain directory name, got '{}'",
            settings.agent_id
        )));
    }
    let name = settings.gateway.wrapper_name.trim();
    if name.contains(['/', '\\']) {
        return Err(WardenError::Config(format!(
            "gateway.wrapper_name must be a plain file name, got '{name}'"
        )));
    }
    Ok(())
}

impl Settings {
    pub fn resolve_paths(&self, settings_path: &Path) -> ResolvedPaths {
        let base = settings_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(default_config_dir, PathBuf::from);
        let state_dir = match env::var(STATE_DIR_ENV) {
            Ok(value) if !value.trim().is_empty() => expand_path(value.trim()),
            _ => path_or(&self.paths.state_dir, &base, "state"),
        };
        ResolvedPaths {
            settings_path: settings_path.to_path_buf(),
            state_dir,
            logs_dir: path_or(&self.paths.logs_dir, &base, "logs"),
            metadata_dir: path_or(&self.paths.metadata_dir, &base, ""),
            bin_dir: path_or(&self.paths.bin_dir, &base, "bin"),
        }
    }

    pub fn speech_model(&self) -> SpeechModel {
        SpeechModel::parse(&self.speech_model)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.stop_timeout_ms)
    }

    pub fn launch(&self, paths: &ResolvedPaths, token: String) -> GatewayLaunch {
        let layout = paths.layout();
        GatewayLaunch {
            program: expand_path(self.gateway.program.trim()),
            args: self.gateway.args.clone(),
            port: self.gateway.port,
            state_dir: layout.state_dir.clone(),
            config_path: layout.config_path(),
            logs_dir: layout.logs_dir,
            token,
            extra_bin_dirs: self
                .gateway
                .extra_bin_dirs
                .iter()
                .map(|dir| expand_path(dir.trim()))
                .collect(),
            speech_model: self.speech_model(),
            run_as_plain_process: self.gateway.run_as_plain_process,
            readiness: self.gateway.readiness,
        }
    }
}
