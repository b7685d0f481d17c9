//! Snapshots of the state directory and transactional restore.
//!
//! Restore runs in five phases: extract into scratch space, locate the backup
//! root, stop the gateway, swap the live state directory for the backup
//! (keeping the old one as a `pre-restore` sibling) and restart with the
//! restored token. Any failure after the gateway was stopped rolls the swap
//! back and restarts the previous state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive;
use crate::error::{Result, WardenError};
use crate::fsutil::{copy_dir_all, remove_path, write_atomic, ScratchDir};
use crate::platform::Platform;
use crate::migrations;
use crate::state::{read_config_token, StateLayout, CONFIG_FILE_NAME, PID_FILE_NAME};
use crate::supervisor::{recorded_gateway, GatewayControl, RecordedGateway};

const ARCHIVE_FILE_NAME: &str = "backup.tar.gz";

/// Shared abort switch for a restore. Only checked before the gateway is
/// stopped; after that the restore runs to completion or rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles control the same restore.
    pub fn is_same(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Picks where a finished backup goes. `None` means the user declined.
pub trait BackupDestination {
    fn choose(&self, suggested_name: &str) -> Result<Option<PathBuf>>;
}

/// A destination known up front. A directory gets the suggested file name.
pub struct FixedDestination(pub PathBuf);

impl BackupDestination for FixedDestination {
    fn choose(&self, suggested_name: &str) -> Result<Option<PathBuf>> {
        if self.0.is_dir() {
            Ok(Some(self.0.join(suggested_name)))
        } else {
            Ok(Some(self.0.clone()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Written { path: PathBuf, bytes: usize },
    Cancelled,
}

pub fn suggested_backup_name() -> String {
    format!("warden-backup-{}.tar.gz", Local::now().format("%Y%m%d-%H%M%S"))
}

/// Archive every regular file under `state_dir` except the pid file, fully
/// in memory.
pub fn create_backup(state_dir: &Path) -> Result<Vec<u8>> {
    if !state_dir.is_dir() {
        return Err(WardenError::Config(format!(
            "state directory does not exist: {}",
            state_dir.display()
        )));
    }
    archive::create_tar_gz(state_dir, &[PID_FILE_NAME])
}

pub fn save_backup(state_dir: &Path, destination: &dyn BackupDestination) -> Result<BackupOutcome> {
    let bytes = create_backup(state_dir)?;
    let Some(path) = destination.choose(&suggested_backup_name())? else {
        info!("backup cancelled at destination selection");
        return Ok(BackupOutcome::Cancelled);
    };
    write_atomic(&path, &bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "backup written");
    Ok(BackupOutcome::Written {
        path,
        bytes: bytes.len(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// The previous state directory, kept beside the live one.
    pub safety_backup: Option<PathBuf>,
    pub token_changed: bool,
}

#[derive(Debug, Error)]
#[error("{error}")]
pub struct RestoreFailure {
    pub error: WardenError,
    /// Rollback itself failed; the state directory needs manual repair.
    pub unrecoverable: bool,
    pub safety_backup: Option<PathBuf>,
}

impl RestoreFailure {
    /// A failure that left the live state untouched.
    pub fn clean(error: WardenError) -> Self {
        Self {
            error,
            unrecoverable: false,
            safety_backup: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, WardenError::Cancelled)
    }
}

/// Where a swapped-out state directory went.
#[derive(Debug)]
struct Swap {
    safety_backup: Option<PathBuf>,
}

pub fn restore(
    layout: &StateLayout,
    platform: &dyn Platform,
    gateway: &dyn GatewayControl,
    archive_bytes: &[u8],
    cancel: &CancelFlag,
) -> std::result::Result<RestoreReport, RestoreFailure> {
    let scratch = ScratchDir::create("warden-restore").map_err(RestoreFailure::clean)?;
    let backup_root = prepare(platform, scratch.path(), archive_bytes).map_err(RestoreFailure::clean)?;
    if cancel.is_cancelled() {
        info!("restore cancelled before stopping the gateway");
        return Err(RestoreFailure::clean(WardenError::Cancelled));
    }

    let previous_token = gateway.token();
    let mut swap: Option<Swap> = None;
    let applied = (|| -> Result<String> {
        gateway.stop()?;
        swap = Some(swap_state_dir(&layout.state_dir, &backup_root)?);
        let token = read_config_token(&layout.config_path())?;
        gateway.set_token(token.clone());
        gateway.start()?;
        Ok(token)
    })();

    match applied {
        Ok(token) => {
            let safety_backup = swap.and_then(|s| s.safety_backup);
            info!(
                safety_backup = ?safety_backup,
                "state restored and gateway restarted"
            );
            Ok(RestoreReport {
                safety_backup,
                token_changed: previous_token.as_deref() != Some(token.as_str()),
            })
        }
        Err(err) => {
            warn!(error = %err, "restore failed; rolling back");
            let rolled_back = rollback(layout, gateway, swap.as_ref(), previous_token);
            let safety_backup = swap
                .and_then(|s| s.safety_backup)
                .filter(|path| path.exists());
            match rolled_back {
                Ok(()) => Err(RestoreFailure {
                    error: err,
                    unrecoverable: false,
                    safety_backup: None,
                }),
                Err(rollback_err) => {
                    error!(
                        error = %err,
                        rollback_error = %rollback_err,
                        safety_backup = ?safety_backup,
                        "rollback failed; manual intervention required"
                    );
                    Err(RestoreFailure {
                        error: WardenError::Process(format!(
                            "{err}; rollback failed: {rollback_err}{}",
                            safety_backup
                                .as_ref()
                                .map(|p| format!(" (previous state kept at {})", p.display()))
                                .unwrap_or_default()
                        )),
                        unrecoverable: true,
                        safety_backup,
                    })
                }
            }
        }
    }
}

/// Phases 1 and 2. Nothing outside `scratch` is touched. The located root is
/// stripped of runtime files and its config brought to the current layout.
fn prepare(platform: &dyn Platform, scratch: &Path, archive_bytes: &[u8]) -> Result<PathBuf> {
    if archive_bytes.is_empty() {
        return Err(WardenError::InvalidBackup("archive is empty".to_string()));
    }
    let archive_path = scratch.join(ARCHIVE_FILE_NAME);
    fs::write(&archive_path, archive_bytes)?;
    let extracted = scratch.join("extracted");
    platform
        .extract_archive(&archive_path, &extracted)
        .map_err(|err| match err {
            WardenError::PathTraversal { .. } | WardenError::InvalidBackup(_) => err,
            other => WardenError::InvalidBackup(other.to_string()),
        })?;
    let root = locate_backup_root(&extracted)?;
    match fs::remove_file(root.join(PID_FILE_NAME)) {
        Ok(()) => info!("dropped pid file carried by the backup"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let upgraded = migrations::upgrade_config_file(&root.join(CONFIG_FILE_NAME))
        .map_err(|err| WardenError::InvalidBackup(err.to_string()))?;
    if !upgraded.is_empty() {
        info!(migrations = ?upgraded, "backup config checked against current layout");
    }
    Ok(root)
}

/// `config.json` at the top level, or inside exactly one subdirectory.
pub fn locate_backup_root(extracted: &Path) -> Result<PathBuf> {
    if extracted.join(CONFIG_FILE_NAME).is_file() {
        return Ok(extracted.to_path_buf());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(extracted)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    match dirs.as_slice() {
        [only] if only.join(CONFIG_FILE_NAME).is_file() => Ok(only.clone()),
        _ => Err(WardenError::InvalidBackup(format!(
            "no {CONFIG_FILE_NAME} at the archive root or in a single top-level directory"
        ))),
    }
}

pub fn safety_backup_path(state_dir: &Path) -> PathBuf {
    let name = state_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let candidate = state_dir.with_file_name(format!("{name}.pre-restore-{stamp}"));
    if candidate.exists() {
        state_dir.with_file_name(format!(
            "{name}.pre-restore-{stamp}-{}",
            uuid::Uuid::new_v4().simple()
        ))
    } else {
        candidate
    }
}

/// Phase 4.
fn swap_state_dir(state_dir: &Path, backup_root: &Path) -> Result<Swap> {
    let safety_backup = if state_dir.exists() {
        let safety = safety_backup_path(state_dir);
        fs::rename(state_dir, &safety)?;
        info!(safety_backup = %safety.display(), "moved live state aside");
        Some(safety)
    } else {
        None
    };
    let swap = Swap { safety_backup };
    // The swap is recorded by the caller only on success, so undo here.
    if let Err(err) = copy_dir_all(backup_root, state_dir) {
        let _ = remove_path(state_dir);
        if let Some(safety) = &swap.safety_backup {
            if let Err(rename_err) = fs::rename(safety, state_dir) {
                error!(error = %rename_err, safety_backup = %safety.display(), "failed to put live state back");
                return Err(WardenError::Process(format!(
                    "{err}; previous state left at {}",
                    safety.display()
                )));
            }
        }
        return Err(err);
    }
    Ok(swap)
}

fn rollback(
    layout: &StateLayout,
    gateway: &dyn GatewayControl,
    swap: Option<&Swap>,
    previous_token: Option<String>,
) -> Result<()> {
    if let Some(swap) = swap {
        // A partially started restored gateway must not hold files we move.
        gateway.stop()?;
        remove_path(&layout.state_dir)?;
        if let Some(safety) = &swap.safety_backup {
            fs::rename(safety, &layout.state_dir)?;
        }
    }
    if let Some(token) = previous_token {
        gateway.set_token(token);
    }
    gateway.start()?;
    info!("rollback complete; previous state restored");
    Ok(())
}

/// Gateway control for one-shot commands that run without a supervisor.
/// Starting is a no-op; stopping refuses while a recorded gateway is alive.
pub struct OfflineGateway<'a> {
    pid_path: PathBuf,
    platform: &'a dyn Platform,
    token: std::sync::Mutex<Option<String>>,
}

impl<'a> OfflineGateway<'a> {
    pub fn new(layout: &StateLayout, platform: &'a dyn Platform) -> Self {
        Self {
            pid_path: layout.pid_path(),
            platform,
            token: std::sync::Mutex::new(read_config_token(&layout.config_path()).ok()),
        }
    }
}

impl GatewayControl for OfflineGateway<'_> {
    /// Unverified live pids are refused as well.
    fn stop(&self) -> Result<()> {
        match recorded_gateway(self.platform, &self.pid_path) {
            RecordedGateway::Running(pid) | RecordedGateway::Unverified(pid) => {
                Err(WardenError::Process(format!(
                    "gateway is running (pid {pid}); stop it before restoring"
                )))
            }
            RecordedGateway::Gone => Ok(()),
        }
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn set_token(&self, token: String) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }
    }
}
