//! Host OS capabilities.
//!
//! Everything that differs between POSIX-like and Windows-like hosts lives
//! behind [`Platform`]. The implementation is picked once by [`current`];
//! callers never branch on the OS themselves.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use crate::archive;
use crate::error::Result;

#[cfg(unix)]
mod posix;
mod windows;

#[cfg(unix)]
pub use posix::PosixPlatform;
pub use windows::WindowsPlatform;

/// Defaults applied to every child process this crate spawns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessDefaults {
    /// Raw process creation flags (Windows `CREATE_NO_WINDOW` and friends).
    pub creation_flags: Option<u32>,
}

impl ProcessDefaults {
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>) -> Command {
        let mut cmd = Command::new(program);
        self.apply(&mut cmd);
        cmd
    }

    #[cfg(windows)]
    pub fn apply(&self, cmd: &mut Command) {
        if let Some(flags) = self.creation_flags {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(flags);
        }
    }

    #[cfg(not(windows))]
    pub fn apply(&self, _cmd: &mut Command) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Start the gateway as leader of its own process group.
    pub process_group_leader: bool,
    pub extra_launch_args: Vec<String>,
    pub startup_timeout: Duration,
    pub defaults: ProcessDefaults,
}

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Defaults threaded through every spawn, including helper commands.
    fn process_defaults(&self) -> ProcessDefaults;

    /// Terminate one process. A pid that no longer exists is a success.
    fn kill_process(&self, pid: u32, force: bool) -> Result<()>;

    /// Terminate a process and all of its descendants. `force` escalates to
    /// an uncatchable kill for the whole tree.
    fn kill_process_tree(&self, pid: u32, force: bool) -> Result<()>;

    fn is_process_alive(&self, pid: u32) -> bool;

    /// Whether anything spawned as part of `pid`'s tree is still running.
    fn is_process_tree_alive(&self, pid: u32) -> bool {
        self.is_process_alive(pid)
    }

    /// A fingerprint that distinguishes `pid` from a later process reusing
    /// the same number, or `None` if the process is gone or unknowable.
    fn process_identity(&self, pid: u32) -> Option<String>;

    fn gateway_spawn_options(&self) -> SpawnOptions;

    /// Best-effort owner-only access; never fails.
    fn restrict_permissions(&self, path: &Path);

    /// Write an executable launcher named `name` into `bin_dir` that runs
    /// `launch_target` with all arguments forwarded and its exit code kept.
    fn create_shell_wrapper(&self, bin_dir: &Path, name: &str, launch_target: &Path)
        -> Result<PathBuf>;

    /// Unpack a `.tar.gz`, refusing any entry that would land outside
    /// `dest_dir`. The guard is identical on every platform.
    fn extract_archive(&self, archive_path: &Path, dest_dir: &Path) -> Result<()> {
        archive::extract_tar_gz(archive_path, dest_dir)
    }
}

#[cfg(unix)]
pub fn current() -> Arc<dyn Platform> {
    Arc::new(PosixPlatform)
}

#[cfg(not(unix))]
pub fn current() -> Arc<dyn Platform> {
    Arc::new(WindowsPlatform)
}

/// `"no such process"` in the various spellings helper tools use.
pub(crate) fn reports_missing_process(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such process")
        || lower.contains("not found")
        || lower.contains("cannot find")
        || lower.contains("not running")
}
