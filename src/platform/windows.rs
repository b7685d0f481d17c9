use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tracing::debug;

use super::{reports_missing_process, Platform, ProcessDefaults, SpawnOptions};
use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic;

/// `CREATE_NO_WINDOW`: keeps helper and gateway processes from flashing a
/// console window.
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    fn taskkill(&self, pid: u32, tree: bool) -> Result<Output> {
        let mut cmd = self.process_defaults().command("taskkill");
        cmd.arg("/PID").arg(pid.to_string());
        if tree {
            cmd.arg("/T");
        }
        cmd.arg("/F")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.output()
            .map_err(|err| WardenError::Process(format!("failed to execute taskkill: {err}")))
    }

    fn check_taskkill(pid: u32, output: &Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if reports_missing_process(&stderr) {
            return Ok(());
        }
        Err(WardenError::Process(format!(
            "failed to stop pid {pid}: {}",
            stderr.trim()
        )))
    }
}

pub(crate) fn wrapper_script(launch_target: &Path) -> String {
    format!(
        "@echo off\r\nrem warden-wrapper\r\n\"{}\" %*\r\nexit /b %ERRORLEVEL%\r\n",
        launch_target.display()
    )
}

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn process_defaults(&self) -> ProcessDefaults {
        ProcessDefaults {
            creation_flags: Some(CREATE_NO_WINDOW),
        }
    }

    /// There are no signals here; termination is always unconditional.
    fn kill_process(&self, pid: u32, _force: bool) -> Result<()> {
        let output = self.taskkill(pid, false)?;
        Self::check_taskkill(pid, &output)
    }

    /// `taskkill /F` is already forceful, so `force` changes nothing.
    fn kill_process_tree(&self, pid: u32, _force: bool) -> Result<()> {
        match self
            .taskkill(pid, true)
            .and_then(|output| Self::check_taskkill(pid, &output))
        {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(pid, error = %err, "tree kill failed, killing single process");
                self.kill_process(pid, true)
            }
        }
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let output = self
            .process_defaults()
            .command("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                let needle = format!("\"{pid}\"");
                String::from_utf8_lossy(&output.stdout).contains(&needle)
            }
            _ => false,
        }
    }

    fn process_identity(&self, pid: u32) -> Option<String> {
        if pid == 0 {
            return None;
        }
        let output = self
            .process_defaults()
            .command("powershell")
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-Command",
                &format!("(Get-Process -Id {pid}).StartTime.ToUniversalTime().Ticks"),
            ])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let ticks = String::from_utf8_lossy(&output.stdout).trim().to_string();
        ticks
            .parse::<u64>()
            .ok()
            .map(|ticks| format!("ticks:{ticks}"))
    }

    /// No process groups, and no port-claiming flag: the mechanism behind it
    /// only exists on POSIX hosts.
    fn gateway_spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            process_group_leader: false,
            extra_launch_args: Vec::new(),
            startup_timeout: STARTUP_TIMEOUT,
            defaults: self.process_defaults(),
        }
    }

    /// No POSIX permission bits to restrict.
    fn restrict_permissions(&self, _path: &Path) {}

    fn create_shell_wrapper(
        &self,
        bin_dir: &Path,
        name: &str,
        launch_target: &Path,
    ) -> Result<PathBuf> {
        let path = bin_dir.join(format!("{name}.cmd"));
        write_atomic(&path, wrapper_script(launch_target).as_bytes())?;
        Ok(path)
    }
}
