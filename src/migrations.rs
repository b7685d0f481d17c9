//! Versioned, idempotent upgrades of the gateway config document.
//!
//! The applied version lives in `<metadataDir>/desktop-state.json`, apart from
//! the config itself. Every migration inspects the document before touching
//! it, so running one against an already-migrated config changes nothing.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic;
use crate::state::DESKTOP_STATE_FILE_NAME;

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub apply: fn(&mut Value) -> Result<bool>,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "default gateway.mode to local",
        apply: default_gateway_mode,
    },
    Migration {
        version: 2,
        description: "move gateway.token to gateway.auth.token",
        apply: move_gateway_token,
    },
    Migration {
        version: 3,
        description: "move agent.model to agents.defaults.model.primary",
        apply: move_agent_model,
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopState {
    #[serde(default)]
    pub config_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
    pub config_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
}

pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Persisted version, or 0 when the file is missing or unreadable.
pub fn read_applied_version(metadata_dir: &Path) -> u32 {
    let path = metadata_dir.join(DESKTOP_STATE_FILE_NAME);
    let Ok(text) = fs::read_to_string(&path) else {
        return 0;
    };
    match serde_json::from_str::<DesktopState>(&text) {
        Ok(state) => state.config_version,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable desktop state");
            0
        }
    }
}

pub fn write_applied_version(metadata_dir: &Path, version: u32) -> Result<()> {
    let path = metadata_dir.join(DESKTOP_STATE_FILE_NAME);
    let mut document = fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()));
    document["configVersion"] = Value::from(version);
    write_atomic(&path, serde_json::to_string_pretty(&document)?.as_bytes())
}

pub fn run(config_path: &Path, metadata_dir: &Path) -> Result<MigrationReport> {
    run_with(MIGRATIONS, config_path, metadata_dir)
}

pub fn run_with(
    migrations: &[Migration],
    config_path: &Path,
    metadata_dir: &Path,
) -> Result<MigrationReport> {
    let from_version = read_applied_version(metadata_dir);
    let mut report = MigrationReport {
        from_version,
        to_version: from_version,
        ..MigrationReport::default()
    };

    let mut config = match fs::read_to_string(config_path)
        .map_err(WardenError::from)
        .and_then(|text| serde_json::from_str::<Value>(&text).map_err(WardenError::from))
    {
        Ok(config) => config,
        Err(err) => {
            warn!(path = %config_path.display(), error = %err, "config unreadable; skipping migrations");
            report.skipped_reason = Some(err.to_string());
            return Ok(report);
        }
    };

    let outcome = apply_pending(migrations, &mut config, from_version);
    report.applied = outcome.applied;
    report.config_changed = outcome.changed;
    report.to_version = outcome.to_version;
    report.failed = outcome.failed;

    if report.config_changed {
        save_config(config_path, &config)?;
    }
    if report.to_version > from_version {
        write_applied_version(metadata_dir, report.to_version)?;
        info!(
            from = from_version,
            to = report.to_version,
            changed = report.config_changed,
            "config migrations applied"
        );
    }
    Ok(report)
}

/// Result of running migrations over an in-memory document.
struct Outcome {
    applied: Vec<u32>,
    changed: bool,
    to_version: u32,
    failed: Option<String>,
}

/// Each migration works on a copy that replaces `config` only on success, so
/// a failing migration leaves no partial edits behind.
fn apply_pending(migrations: &[Migration], config: &mut Value, from_version: u32) -> Outcome {
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.version > from_version)
        .collect();
    pending.sort_by_key(|m| m.version);

    let mut outcome = Outcome {
        applied: Vec::new(),
        changed: false,
        to_version: from_version,
        failed: None,
    };
    for migration in pending {
        let mut candidate = config.clone();
        match (migration.apply)(&mut candidate) {
            Ok(changed) => {
                debug!(version = migration.version, changed, "migration applied");
                if changed {
                    *config = candidate;
                }
                outcome.changed |= changed;
                outcome.applied.push(migration.version);
                outcome.to_version = migration.version;
            }
            Err(err) => {
                warn!(
                    version = migration.version,
                    description = migration.description,
                    error = %err,
                    "migration failed; stopping"
                );
                outcome.failed = Some(format!("{}: {err}", migration.version));
                break;
            }
        }
    }
    outcome
}

/// Bring a config file of unknown age fully up to date, ignoring any
/// recorded counter. Used for configs that arrive from a backup.
pub fn upgrade_config_file(config_path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(config_path)?;
    let mut config: Value = serde_json::from_str(&text)?;
    let outcome = apply_pending(MIGRATIONS, &mut config, 0);
    if let Some(failed) = outcome.failed {
        return Err(WardenError::Config(format!(
            "{} cannot be migrated: {failed}",
            config_path.display()
        )));
    }
    if outcome.changed {
        save_config(config_path, &config)?;
        info!(path = %config_path.display(), "upgraded config to the current layout");
    }
    Ok(outcome.applied)
}

fn save_config(config_path: &Path, config: &Value) -> Result<()> {
    let mut text = serde_json::to_string_pretty(config)?;
    text.push('\n');
    write_atomic(config_path, text.as_bytes())
}

fn object_entry<'a>(parent: &'a mut Value, key: &str) -> Result<&'a mut Map<String, Value>> {
    let map = parent
        .as_object_mut()
        .ok_or_else(|| WardenError::Config("expected a JSON object".to_string()))?;
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    entry
        .as_object_mut()
        .ok_or_else(|| WardenError::Config(format!("`{key}` must be an object")))
}

fn default_gateway_mode(config: &mut Value) -> Result<bool> {
    if config.pointer("/gateway/mode").is_some() {
        return Ok(false);
    }
    let gateway = object_entry(config, "gateway")?;
    gateway.insert("mode".to_string(), Value::from("local"));
    Ok(true)
}

fn move_gateway_token(config: &mut Value) -> Result<bool> {
    let Some(legacy) = config.pointer("/gateway/token").cloned() else {
        return Ok(false);
    };
    let gateway = object_entry(config, "gateway")?;
    gateway.remove("token");
    let auth = gateway
        .entry("auth".to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| WardenError::Config("`gateway.auth` must be an object".to_string()))?;
    if !auth.contains_key("token") {
        auth.insert("token".to_string(), legacy);
    }
    if !auth.contains_key("mode") {
        auth.insert("mode".to_string(), Value::from("token"));
    }
    Ok(true)
}

fn move_agent_model(config: &mut Value) -> Result<bool> {
    let Some(model) = config.pointer("/agent/model").cloned() else {
        return Ok(false);
    };
    if !model.is_string() {
        return Ok(false);
    }
    if let Some(agent) = config.get_mut("agent").and_then(Value::as_object_mut) {
        agent.remove("model");
        if agent.is_empty() {
            if let Some(root) = config.as_object_mut() {
                root.remove("agent");
            }
        }
    }
    let agents = object_entry(config, "agents")?;
    let defaults = agents
        .entry("defaults".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let model_slot = object_entry(defaults, "model")?;
    if !model_slot.contains_key("primary") {
        model_slot.insert("primary".to_string(), model);
    }
    Ok(true)
}
