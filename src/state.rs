//! On-disk layout of the gateway state directory and the supervisor's own
//! metadata.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const PID_FILE_NAME: &str = "gateway.pid";
pub const AUTH_PROFILES_FILE_NAME: &str = "auth-profiles.json";
pub const DESKTOP_STATE_FILE_NAME: &str = "desktop-state.json";
pub const STDOUT_LOG_NAME: &str = "gateway.stdout.log";
pub const STDERR_LOG_NAME: &str = "gateway.stderr.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub metadata_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: PathBuf, logs_dir: PathBuf, metadata_dir: PathBuf) -> Self {
        Self {
            state_dir,
            logs_dir,
            metadata_dir,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE_NAME)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join(PID_FILE_NAME)
    }

    pub fn auth_profiles_path(&self, agent_id: &str) -> PathBuf {
        self.state_dir
            .join("agents")
            .join(agent_id)
            .join("agent")
            .join(AUTH_PROFILES_FILE_NAME)
    }

    pub fn desktop_state_path(&self) -> PathBuf {
        self.metadata_dir.join(DESKTOP_STATE_FILE_NAME)
    }

    pub fn stdout_log_path(&self) -> PathBuf {
        self.logs_dir.join(STDOUT_LOG_NAME)
    }

    pub fn stderr_log_path(&self) -> PathBuf {
        self.logs_dir.join(STDERR_LOG_NAME)
    }

    /// Create the state directory and a minimal config on first run.
    /// Returns `true` when a config was written.
    pub fn ensure_initialized(&self) -> Result<bool> {
        fs::create_dir_all(&self.state_dir)?;
        let config_path = self.config_path();
        if config_path.exists() {
            return Ok(false);
        }
        let config = json!({
            "gateway": {
                "mode": "local",
                "auth": {
                    "mode": "token",
                    "token": generate_token(),
                }
            }
        });
        write_atomic(&config_path, serde_json::to_string_pretty(&config)?.as_bytes())?;
        info!(path = %config_path.display(), "created initial gateway config");
        Ok(true)
    }
}

pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The gateway auth token recorded in a config document.
pub fn token_from_config(config: &Value) -> Option<String> {
    config
        .pointer("/gateway/auth/token")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

pub fn read_config_token(config_path: &Path) -> Result<String> {
    let text = fs::read_to_string(config_path)?;
    let config: Value = serde_json::from_str(&text)?;
    token_from_config(&config).ok_or_else(|| {
        WardenError::Config(format!(
            "{} has no gateway.auth.token",
            config_path.display()
        ))
    })
}

/// Contents of `gateway.pid`: the pid on the first line and, when the
/// platform could tell, an identity fingerprint of that process on the
/// second. A pid alone is not enough to tell our gateway from a process that
/// later reused the number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub identity: Option<String>,
}

impl PidRecord {
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let pid = lines.next()?.parse::<u32>().ok()?;
        let identity = lines.next().map(str::to_string);
        Some(Self { pid, identity })
    }

    pub fn render(&self) -> String {
        match &self.identity {
            Some(identity) => format!("{}\n{identity}\n", self.pid),
            None => format!("{}\n", self.pid),
        }
    }
}

pub fn read_pid_record(path: &Path) -> Option<PidRecord> {
    PidRecord::parse(&fs::read_to_string(path).ok()?)
}
