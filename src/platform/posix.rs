use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Platform, ProcessDefaults, SpawnOptions};
use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const FORCE_CLAIM_PORT_ARG: &str = "--force";

#[derive(Debug, Clone, Copy, Default)]
pub struct PosixPlatform;

fn to_pid_t(pid: u32) -> Result<libc::pid_t> {
    libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| WardenError::Process(format!("pid {pid} is out of range")))
}

/// `kill(2)` with ESRCH mapped to success.
fn send_signal(target: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// The parts of `/proc/<pid>/stat` used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    pgrp: i32,
    start_time: u64,
}

fn parse_proc_stat(text: &str) -> Option<ProcStat> {
    // The command name is parenthesised and may itself contain `)`.
    let rest = &text[text.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        pgrp: fields.get(2)?.parse().ok()?,
        start_time: fields.get(19)?.parse().ok()?,
    })
}

fn proc_stat(pid: libc::pid_t) -> Option<ProcStat> {
    parse_proc_stat(&fs::read_to_string(format!("/proc/{pid}/stat")).ok()?)
}

fn has_procfs() -> bool {
    Path::new("/proc/self/stat").exists()
}

/// `Some(true)` when a non-zombie member of `pgid` exists, `None` without
/// procfs.
fn group_has_live_member(pgid: libc::pid_t) -> Option<bool> {
    let entries = fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        if let Some(stat) = proc_stat(pid) {
            if stat.pgrp == pgid && stat.state != 'Z' {
                return Some(true);
            }
        }
    }
    Some(false)
}

/// `kill(target, 0)` succeeded or was refused for lack of permission.
fn signal_target_exists(target: libc::pid_t) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(target, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

pub(crate) fn wrapper_script(launch_target: &Path) -> String {
    format!(
        "#!/bin/sh\n# warden-wrapper\nexec {} \"$@\"\n",
        shell_single_quote(&launch_target.to_string_lossy())
    )
}

impl Platform for PosixPlatform {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn process_defaults(&self) -> ProcessDefaults {
        ProcessDefaults::default()
    }

    fn kill_process(&self, pid: u32, force: bool) -> Result<()> {
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        send_signal(to_pid_t(pid)?, signal)
            .map_err(|err| WardenError::Process(format!("failed to signal pid {pid}: {err}")))
    }

    fn kill_process_tree(&self, pid: u32, force: bool) -> Result<()> {
        let leader = to_pid_t(pid)?;
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(-leader, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        debug!(pid, force, error = %err, "process-group kill failed, signalling leader only");
        self.kill_process(pid, force)
    }

    /// Zombies count as exited.
    fn is_process_alive(&self, pid: u32) -> bool {
        let Ok(pid) = to_pid_t(pid) else {
            return false;
        };
        if !signal_target_exists(pid) {
            return false;
        }
        proc_stat(pid).map_or(true, |stat| stat.state != 'Z')
    }

    /// A group outlives its leader; any live member keeps the tree alive.
    fn is_process_tree_alive(&self, pid: u32) -> bool {
        let Ok(pgid) = to_pid_t(pid) else {
            return false;
        };
        if !signal_target_exists(-pgid) {
            return self.is_process_alive(pid);
        }
        group_has_live_member(pgid).unwrap_or(true)
    }

    fn process_identity(&self, pid: u32) -> Option<String> {
        let target = to_pid_t(pid).ok()?;
        if has_procfs() {
            return proc_stat(target)
                .filter(|stat| stat.state != 'Z')
                .map(|stat| format!("start:{}", stat.start_time));
        }
        let output = self
            .process_defaults()
            .command("ps")
            .args(["-o", "lstart=", "-p", &pid.to_string()])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let started = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!started.is_empty()).then(|| format!("lstart:{started}"))
    }

    fn gateway_spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            process_group_leader: true,
            extra_launch_args: vec![FORCE_CLAIM_PORT_ARG.to_string()],
            startup_timeout: STARTUP_TIMEOUT,
            defaults: self.process_defaults(),
        }
    }

    fn restrict_permissions(&self, path: &Path) {
        let mode = match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => 0o700,
            Ok(_) => 0o600,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot restrict permissions");
                return;
            }
        };
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %err, "cannot restrict permissions");
        }
    }

    fn create_shell_wrapper(
        &self,
        bin_dir: &Path,
        name: &str,
        launch_target: &Path,
    ) -> Result<PathBuf> {
        let path = bin_dir.join(name);
        write_atomic(&path, wrapper_script(launch_target).as_bytes())?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    fn wait_dead(platform: &PosixPlatform, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !platform.is_process_alive(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        !platform.is_process_alive(pid)
    }

    /// Freshly written scripts can briefly report ETXTBSY while another test
    /// thread is mid-fork.
    fn run_retrying_busy(cmd: &mut Command) -> std::process::Output {
        for _ in 0..20 {
            match cmd.output() {
                Ok(output) => return output,
                Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => panic!("spawn failed: {err}"),
            }
        }
        panic!("executable stayed busy");
    }

    #[test]
    fn missing_pid_is_not_an_error() {
        let platform = PosixPlatform;
        // Pids near the top of the range are practically never allocated.
        let pid = 4_000_000;
        assert!(!platform.is_process_alive(pid));
        platform.kill_process(pid, false).unwrap();
        platform.kill_process(pid, true).unwrap();
        platform.kill_process_tree(pid, false).unwrap();
        platform.kill_process_tree(pid, true).unwrap();
        assert!(!platform.is_process_tree_alive(pid));
        assert_eq!(platform.process_identity(pid), None);
    }

    #[test]
    fn process_tree_kill_converges() {
        use std::os::unix::process::CommandExt;

        let platform = PosixPlatform;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(platform.is_process_alive(pid));

        platform.kill_process_tree(pid, false).unwrap();
        let _ = child.wait();
        assert!(wait_dead(&platform, pid, Duration::from_secs(5)));
    }

    #[test]
    fn forced_tree_kill_reaches_term_ignoring_members() {
        use std::os::unix::process::CommandExt;

        let platform = PosixPlatform;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30 & wait")
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        thread::sleep(Duration::from_millis(200));

        platform.kill_process_tree(pid, false).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(platform.is_process_tree_alive(pid));

        platform.kill_process_tree(pid, true).unwrap();
        let _ = child.wait();
        let deadline = Instant::now() + Duration::from_secs(5);
        while platform.is_process_tree_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!platform.is_process_tree_alive(pid));
    }

    #[test]
    fn identity_is_stable_while_the_process_lives() {
        let platform = PosixPlatform;
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let identity = platform.process_identity(child.id());
        assert!(identity.is_some());
        assert_eq!(platform.process_identity(child.id()), identity);

        let _ = child.kill();
        let _ = child.wait();
        assert_eq!(platform.process_identity(child.id()), None);
    }

    #[test]
    fn proc_stat_parses_names_with_parentheses() {
        let line = "4242 (odd) name) S 1 4242 4242 0 -1 4194560 100 0 0 0 0 0 0 0 20 0 1 0 987654 1000 10";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.start_time, 987654);
    }

    #[test]
    fn spawn_options_claim_port_and_lead_group() {
        let options = PosixPlatform.gateway_spawn_options();
        assert!(options.process_group_leader);
        assert_eq!(options.extra_launch_args, vec!["--force".to_string()]);
        assert_eq!(options.startup_timeout, STARTUP_TIMEOUT);
    }

    #[test]
    fn restrict_permissions_sets_owner_only_modes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("secret.json");
        fs::write(&file, b"{}").unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        PosixPlatform.restrict_permissions(&file);
        PosixPlatform.restrict_permissions(&sub);
        PosixPlatform.restrict_permissions(&dir.path().join("missing"));

        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::metadata(&sub).unwrap().permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn shell_wrapper_forwards_arguments_and_exit_code() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("tool's target.sh");
        fs::write(
            &target,
            "#!/bin/sh\necho \"$#:$1:$2\"\nexit 7\n",
        )
        .unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();

        let bin_dir = dir.path().join("bin");
        let wrapper = PosixPlatform
            .create_shell_wrapper(&bin_dir, "tool", &target)
            .unwrap();
        assert_eq!(wrapper, bin_dir.join("tool"));
        assert_eq!(
            fs::metadata(&wrapper).unwrap().permissions().mode() & 0o777,
            0o755
        );

        let output = run_retrying_busy(Command::new(&wrapper).arg("a b").arg("c"));
        assert_eq!(output.status.code(), Some(7));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "2:a b:c\n");
    }
}
