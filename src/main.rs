use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;

use clap::{Parser, Subcommand};
use dialoguer::console::Term;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use warden::backup::{
    self, BackupDestination, BackupOutcome, CancelFlag, FixedDestination, OfflineGateway,
};
use warden::error::{Result, WardenError};
use warden::host::{ApiResult, Host};
use warden::platform;
use warden::settings::{read_settings, resolve_settings_path, write_settings, Settings};
use warden::state::read_config_token;
use warden::supervisor::{gateway_url, recorded_gateway, RecordedGateway};

const DEFAULT_WRAPPER_NAME: &str = "warden-gateway";

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Local gateway supervisor")]
struct Cli {
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor, answering JSON requests on stdin.
    Serve {
        #[arg(long, default_value_t = false)]
        no_autostart: bool,
    },
    Migrate,
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    SpeechModel {
        #[command(subcommand)]
        command: SpeechModelCommand,
    },
    Wrapper {
        #[command(subcommand)]
        command: WrapperCommand,
    },
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    Paths,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    Create {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Restore {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    SetApiKey {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SpeechModelCommand {
    Set { model_id: String },
}

#[derive(Subcommand, Debug)]
enum WrapperCommand {
    Install {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        target: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum GatewayCommand {
    Status,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Init,
    Show,
}

#[derive(Debug, Clone)]
struct Context {
    settings_path: PathBuf,
    json: bool,
}

#[derive(Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr_tail: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    warden::logging::init();
    let ctx = Context {
        settings_path: resolve_settings_path(cli.settings.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Serve { no_autostart } => handle_serve(&ctx, !no_autostart),
        Commands::Migrate => handle_migrate(&ctx),
        Commands::Backup { command } => handle_backup(&ctx, command),
        Commands::Auth { command } => handle_auth(&ctx, command),
        Commands::SpeechModel { command } => handle_speech_model(&ctx, command),
        Commands::Wrapper { command } => handle_wrapper(&ctx, command),
        Commands::Gateway { command } => handle_gateway(&ctx, command),
        Commands::Settings { command } => handle_settings(&ctx, command),
        Commands::Paths => handle_paths(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                stderr_tail: err.stderr_tail().map(str::to_string),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn is_interactive() -> bool {
    Term::stdout().is_term() && Term::stderr().is_term()
}

fn handle_serve(ctx: &Context, autostart: bool) -> Result<()> {
    let host = Host::open(ctx.settings_path.clone())?;
    let startup = match host.startup(autostart) {
        Ok(report) => ApiResult::success(serde_json::to_value(report)?),
        Err(err) => {
            warn!(error = %err, "startup failed; serving requests anyway");
            ApiResult::failure(&err)
        }
    };
    emit_line(&json!({ "event": "startup", "result": startup }))?;

    thread::scope(|scope| -> Result<()> {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "failed to read request");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Host::parse_request(&line) {
                Ok(request) if Host::runs_concurrently(&request.op) => {
                    let host = &host;
                    scope.spawn(move || {
                        if let Err(err) = emit_line(&host.handle_request(request)) {
                            warn!(error = %err, "failed to write response");
                        }
                    });
                }
                Ok(request) => emit_line(&host.handle_request(request))?,
                Err(response) => emit_line(&response)?,
            }
        }
        Ok(())
    })?;

    info!("stdin closed; shutting down");
    host.shutdown();
    Ok(())
}

fn emit_line<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string(payload)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{text}")?;
    stdout.flush()?;
    Ok(())
}

fn handle_migrate(ctx: &Context) -> Result<()> {
    let host = Host::open(ctx.settings_path.clone())?;
    let layout = host.layout();
    let initialized = layout.ensure_initialized()?;
    let report = host.run_migrations()?;
    output(
        ctx,
        json!({
            "config_path": layout.config_path(),
            "initialized": initialized,
            "report": report,
        }),
    )
}

/// Asks for a path on the terminal; an empty answer cancels.
struct PromptDestination {
    default_dir: PathBuf,
}

impl BackupDestination for PromptDestination {
    fn choose(&self, suggested_name: &str) -> Result<Option<PathBuf>> {
        let theme = ColorfulTheme::default();
        let answer = Input::<String>::with_theme(&theme)
            .with_prompt("Save backup to (clear to cancel)")
            .with_initial_text(self.default_dir.join(suggested_name).to_string_lossy())
            .allow_empty(true)
            .interact_text()?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(answer)))
    }
}

fn handle_backup(ctx: &Context, command: BackupCommand) -> Result<()> {
    let host = Host::open(ctx.settings_path.clone())?;
    match command {
        BackupCommand::Create { out } => {
            let outcome = match out {
                Some(path) => host.create_backup(&FixedDestination(path))?,
                None if is_interactive() => {
                    let default_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                    host.create_backup(&PromptDestination { default_dir })?
                }
                None => {
                    let dir = host.default_backup_dir();
                    fs::create_dir_all(&dir)?;
                    host.create_backup(&FixedDestination(dir))?
                }
            };
            match outcome {
                BackupOutcome::Written { path, bytes } => output(
                    ctx,
                    json!({ "action": "backup_create", "path": path, "bytes": bytes }),
                ),
                BackupOutcome::Cancelled => Err(WardenError::Cancelled),
            }
        }
        BackupCommand::Restore { file, yes } => {
            let layout = host.layout();
            if !yes {
                let confirmed = is_interactive()
                    && Confirm::with_theme(&ColorfulTheme::default())
                        .with_prompt(format!(
                            "Replace {} with the contents of {}?",
                            layout.state_dir.display(),
                            file.display()
                        ))
                        .default(false)
                        .interact()?;
                if !confirmed {
                    return Err(WardenError::Config(
                        "backup restore requires --yes (or confirm interactively)".to_string(),
                    ));
                }
            }
            let bytes = fs::read(&file)?;
            let platform = platform::current();
            let gateway = OfflineGateway::new(&layout, platform.as_ref());
            let report = backup::restore(
                &layout,
                platform.as_ref(),
                &gateway,
                &bytes,
                &CancelFlag::new(),
            )
            .map_err(|failure| {
                if failure.unrecoverable {
                    warn!(safety_backup = ?failure.safety_backup, "restore left state needing manual repair");
                }
                failure.error
            })?;
            output(
                ctx,
                json!({
                    "action": "backup_restore",
                    "state_dir": layout.state_dir,
                    "safety_backup": report.safety_backup,
                    "token_changed": report.token_changed,
                }),
            )
        }
    }
}

fn handle_auth(ctx: &Context, command: AuthCommand) -> Result<()> {
    match command {
        AuthCommand::SetApiKey { provider, key } => {
            let key = match key {
                Some(key) => key,
                None if is_interactive() => Password::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("API key for {provider}"))
                    .interact()?,
                None => {
                    return Err(WardenError::Config(
                        "--key is required when not running in a terminal".to_string(),
                    ))
                }
            };
            let host = Host::open(ctx.settings_path.clone())?;
            let result = host.upsert_api_key_profile(&provider, &key)?;
            output(ctx, result)
        }
    }
}

fn handle_speech_model(ctx: &Context, command: SpeechModelCommand) -> Result<()> {
    match command {
        SpeechModelCommand::Set { model_id } => {
            let host = Host::open(ctx.settings_path.clone())?;
            let result = host.set_selected_speech_model(&model_id)?;
            output(ctx, result)
        }
    }
}

fn handle_wrapper(ctx: &Context, command: WrapperCommand) -> Result<()> {
    match command {
        WrapperCommand::Install { name, target } => {
            let host = Host::open(ctx.settings_path.clone())?;
            let configured = host.settings()?.gateway.wrapper_name;
            let name = name
                .or_else(|| (!configured.trim().is_empty()).then(|| configured.trim().to_string()))
                .unwrap_or_else(|| DEFAULT_WRAPPER_NAME.to_string());
            let path = host.install_wrapper(&name, target)?;
            output(ctx, json!({ "action": "wrapper_install", "path": path }))
        }
    }
}

fn handle_gateway(ctx: &Context, command: GatewayCommand) -> Result<()> {
    match command {
        GatewayCommand::Status => {
            let settings = read_settings(&ctx.settings_path)?;
            let layout = settings.resolve_paths(&ctx.settings_path).layout();
            let platform = platform::current();
            let (pid, verified) = match recorded_gateway(platform.as_ref(), &layout.pid_path()) {
                RecordedGateway::Running(pid) => (Some(pid), true),
                RecordedGateway::Unverified(pid) => (Some(pid), false),
                RecordedGateway::Gone => (None, false),
            };
            output(
                ctx,
                json!({
                    "running": pid.is_some(),
                    "verified": verified,
                    "pid": pid,
                    "url": gateway_url(settings.gateway.port),
                    "token": read_config_token(&layout.config_path()).ok(),
                    "state_dir": layout.state_dir,
                    "stderr_log": layout.stderr_log_path(),
                }),
            )
        }
    }
}

fn handle_settings(ctx: &Context, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Init => {
            if ctx.settings_path.exists() {
                return output(ctx, json!({"path": ctx.settings_path, "created": false}));
            }
            write_settings(&ctx.settings_path, &Settings::default())?;
            output(ctx, json!({"path": ctx.settings_path, "created": true}))
        }
        SettingsCommand::Show => {
            let settings = read_settings(&ctx.settings_path)?;
            if ctx.json {
                output(ctx, serde_json::to_value(&settings)?)
            } else {
                print!("{}", serde_yaml::to_string(&settings)?);
                Ok(())
            }
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<()> {
    let settings = read_settings(&ctx.settings_path)?;
    let paths = settings.resolve_paths(&ctx.settings_path);
    let layout = paths.layout();
    output(
        ctx,
        json!({
            "settings_path": paths.settings_path,
            "settings_exists": paths.settings_path.exists(),
            "state_dir": paths.state_dir,
            "config_path": layout.config_path(),
            "pid_path": layout.pid_path(),
            "logs_dir": paths.logs_dir,
            "metadata_dir": paths.metadata_dir,
            "desktop_state_path": layout.desktop_state_path(),
            "auth_profiles_path": layout.auth_profiles_path(&settings.agent_id),
            "bin_dir": paths.bin_dir,
        }),
    )
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<()> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            stderr_tail: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
