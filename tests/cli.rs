use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("warden");
    let mut cmd = Command::new(path);
    cmd.env_remove("WARDEN_SETTINGS")
        .env_remove("WARDEN_STATE_DIR")
        .env("WARDEN_LOG", "warn");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn json_lines(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn settings_path(root: &Path) -> PathBuf {
    root.join("config").join("settings.yaml")
}

/// Settings for a stand-in gateway: a shell script judged ready once it has
/// stayed alive for a moment.
#[cfg(unix)]
fn write_fake_gateway_settings(root: &Path, script: &str) -> PathBuf {
    let path = settings_path(root);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        format!(
            "version: 1\ngateway:\n  program: sh\n  args: [\"-c\", {script:?}, \"gateway\"]\n  readiness: process\n  stop_timeout_ms: 4000\n"
        ),
    )
    .unwrap();
    path
}

fn migrate(settings: &Path) {
    bin()
        .arg("--settings")
        .arg(settings)
        .arg("migrate")
        .assert()
        .success();
}

#[test]
fn settings_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("WARDEN_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("settings")
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["created"], true);
    assert!(config_dir.join("settings.yaml").exists());

    let output = bin()
        .env("WARDEN_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("settings")
        .arg("init")
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["created"], false);
}

#[test]
fn settings_with_unknown_fields_are_rejected() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "version: 1\ngateway:\n  colour: blue\n").unwrap();

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .arg("paths")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert!(json["error"].as_str().unwrap().contains("colour"));
}

#[test]
fn paths_resolve_beside_settings_file() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .arg("paths")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    let config_dir = path.parent().unwrap();
    assert_eq!(
        PathBuf::from(json["result"]["state_dir"].as_str().unwrap()),
        config_dir.join("state")
    );
    assert_eq!(
        PathBuf::from(json["result"]["config_path"].as_str().unwrap()),
        config_dir.join("state").join("config.json")
    );
    assert_eq!(json["result"]["settings_exists"], false);
}

#[test]
fn migrate_creates_config_and_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    let state = path.parent().unwrap().join("state");
    fs::create_dir_all(&state).unwrap();
    fs::write(
        state.join("config.json"),
        r#"{"gateway":{"token":"legacy"},"agent":{"model":"m1"}}"#,
    )
    .unwrap();

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .arg("migrate")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["report"]["applied"], serde_json::json!([1, 2, 3]));
    let migrated = fs::read(state.join("config.json")).unwrap();
    let config: Value = serde_json::from_slice(&migrated).unwrap();
    assert_eq!(config["gateway"]["auth"]["token"], "legacy");
    assert_eq!(config["agents"]["defaults"]["model"]["primary"], "m1");

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .arg("migrate")
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["report"]["applied"], serde_json::json!([]));
    assert_eq!(fs::read(state.join("config.json")).unwrap(), migrated);
}

#[test]
fn set_api_key_puts_latest_profile_first() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    migrate(&path);

    for (provider, key) in [("openai", "sk-1"), ("anthropic", "sk-2"), ("openai", "sk-3")] {
        bin()
            .arg("--settings")
            .arg(&path)
            .args(["auth", "set-api-key", "--provider", provider, "--key", key])
            .assert()
            .success();
    }

    let store_path = path
        .parent()
        .unwrap()
        .join("state/agents/main/agent/auth-profiles.json");
    let store: Value = serde_json::from_str(&fs::read_to_string(store_path).unwrap()).unwrap();
    assert_eq!(store["order"]["openai"], serde_json::json!(["openai:default"]));
    assert_eq!(store["profiles"]["openai:default"]["key"], "sk-3");
    assert_eq!(store["profiles"]["anthropic:default"]["type"], "api_key");
}

#[test]
fn set_api_key_without_key_outside_terminal_fails() {
    let dir = tempdir().unwrap();
    bin()
        .arg("--settings")
        .arg(settings_path(dir.path()))
        .args(["auth", "set-api-key", "--provider", "openai"])
        .assert()
        .failure()
        .stderr(contains("--key is required"));
}

#[test]
fn backup_roundtrip_restores_state_offline() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    migrate(&path);
    let state = path.parent().unwrap().join("state");
    fs::create_dir_all(state.join("sessions")).unwrap();
    fs::write(state.join("sessions/one.jsonl"), "original\n").unwrap();
    let archive = dir.path().join("snap.tar.gz");

    bin()
        .arg("--settings")
        .arg(&path)
        .args(["backup", "create", "--out"])
        .arg(&archive)
        .assert()
        .success();
    assert!(archive.is_file());

    fs::write(state.join("sessions/one.jsonl"), "edited\n").unwrap();
    fs::write(state.join("stray.txt"), "new").unwrap();

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .args(["backup", "restore"])
        .arg(&archive)
        .arg("--yes")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let json = parse_json(&output.stdout);
    assert_eq!(
        fs::read_to_string(state.join("sessions/one.jsonl")).unwrap(),
        "original\n"
    );
    assert!(!state.join("stray.txt").exists());
    let safety = PathBuf::from(json["result"]["safety_backup"].as_str().unwrap());
    assert_eq!(fs::read_to_string(safety.join("stray.txt")).unwrap(), "new");
}

#[test]
fn restore_requires_confirmation() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    migrate(&path);
    let archive = dir.path().join("snap.tar.gz");
    bin()
        .arg("--settings")
        .arg(&path)
        .args(["backup", "create", "--out"])
        .arg(&archive)
        .assert()
        .success();

    bin()
        .arg("--settings")
        .arg(&path)
        .args(["backup", "restore"])
        .arg(&archive)
        .assert()
        .failure()
        .stderr(contains("requires --yes"));
}

#[test]
fn invalid_backup_leaves_state_untouched() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    migrate(&path);
    let config_path = path.parent().unwrap().join("state/config.json");
    let before = fs::read(&config_path).unwrap();
    let bogus = dir.path().join("bogus.tar.gz");
    fs::write(&bogus, b"this is not an archive").unwrap();

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .args(["backup", "restore"])
        .arg(&bogus)
        .arg("--yes")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = parse_json(&output.stdout);
    assert!(json["error"].as_str().unwrap().contains("invalid backup"));
    assert_eq!(fs::read(&config_path).unwrap(), before);
}

#[test]
fn speech_model_selection_is_persisted() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    migrate(&path);
    bin()
        .arg("--settings")
        .arg(&path)
        .args(["speech-model", "set", "whisper-small"])
        .assert()
        .success()
        .stdout(contains("whisper-small"));
    assert!(fs::read_to_string(&path)
        .unwrap()
        .contains("speech_model: whisper-small"));
}

#[test]
fn gateway_status_reports_not_running() {
    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    migrate(&path);
    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .args(["gateway", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["running"], false);
    assert_eq!(json["result"]["url"], "http://127.0.0.1:18789/");
    assert!(json["result"]["token"].is_string());
}

#[cfg(unix)]
#[test]
fn wrapper_install_writes_executable_launcher() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let path = settings_path(dir.path());
    let target = dir.path().join("real-gateway");
    fs::write(&target, "#!/bin/sh\nexit 0\n").unwrap();

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("--json")
        .args(["wrapper", "install", "--name", "gw", "--target"])
        .arg(&target)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let json = parse_json(&output.stdout);
    let wrapper = PathBuf::from(json["result"]["path"].as_str().unwrap());
    assert_eq!(wrapper, path.parent().unwrap().join("bin").join("gw"));
    let mode = fs::metadata(&wrapper).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
}

#[cfg(unix)]
#[test]
fn serve_answers_requests_and_stops_gateway_on_eof() {
    let dir = tempdir().unwrap();
    let path = write_fake_gateway_settings(dir.path(), "exec sleep 30");

    let output = bin()
        .arg("--settings")
        .arg(&path)
        .arg("serve")
        .write_stdin(concat!(
            "{\"id\": 1, \"op\": \"gateway.info\"}\n",
            "{\"id\": 2, \"op\": \"auth.upsertApiKey\", \"payload\": {\"provider\": \"openai\", \"key\": \"sk\"}}\n",
            "{\"id\": 3, \"op\": \"bogus\"}\n",
            "{\"id\": 4, \"op\": \"backup.cancel\"}\n",
        ))
        .timeout(std::time::Duration::from_secs(60))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0]["event"], "startup");
    assert_eq!(lines[0]["result"]["ok"], true, "{}", lines[0]);
    let pid = lines[0]["result"]["result"]["gateway"]["pid"].as_u64().unwrap();

    assert_eq!(lines[1]["id"], 1);
    assert_eq!(lines[1]["ok"], true);
    assert_eq!(lines[1]["result"]["state"], "ready");
    assert_eq!(lines[2]["id"], 2);
    assert_eq!(lines[2]["ok"], true);
    assert_eq!(lines[3]["id"], 3);
    assert_eq!(lines[3]["ok"], false);
    assert_eq!(lines[4]["id"], 4);
    assert_eq!(lines[4]["result"]["flagged"], 0);

    let state = path.parent().unwrap().join("state");
    assert!(!state.join("gateway.pid").exists());
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
    assert!(!alive);
}
