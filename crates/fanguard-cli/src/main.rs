#![deny(unsafe_code)]

//! fanguard CLI: service entry point and local control client.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanguard_config::{AppConfig, ControlPolicy};
use fanguard_core::daemon::EXIT_CONFIG_CORRUPT;
use fanguard_core::{Daemon, IpcClient, IpcToken, RuntimeSnapshot, build_info, logging};
use futures::StreamExt;
use tracing::info;

/// fanguard: temperature-driven fan control.
#[derive(Parser)]
#[command(name = "fanguard", version = build_info::LONG_VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/fanguard/fanguard.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control daemon in the foreground (service mode).
    Run {
        /// Use the simulated driver and skip the root check.
        #[arg(long)]
        simulate: bool,
    },

    /// Show the daemon's current state.
    Status {
        /// Print the raw snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Follow state updates.
    Watch {
        /// Stop after this many updates.
        #[arg(long)]
        count: Option<usize>,

        /// Print each snapshot as a JSON line.
        #[arg(long)]
        json: bool,
    },

    /// Replace the active policy with one read from a TOML file.
    SetPolicy {
        /// Policy file.
        file: PathBuf,
    },

    /// Print the active policy as TOML.
    Policy {
        /// Print the built-in safe default instead of asking the daemon.
        #[arg(long)]
        default: bool,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Manage the IPC token.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Write a new random token to `auth.token_path`.
    Generate {
        /// Replace an existing token file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_CORRUPT);
        }
    };
    logging::init(&config.logging, cli.verbose);

    let result = match cli.command {
        Commands::Run { simulate } => return cmd_run(config, simulate).await,
        Commands::Status { json } => cmd_status(&config, json).await,
        Commands::Watch { count, json } => cmd_watch(&config, count, json).await,
        Commands::SetPolicy { file } => cmd_set_policy(&config, &file).await,
        Commands::Policy { default } => cmd_policy(&config, default).await,
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
        Commands::Token {
            action: TokenAction::Generate { force },
        } => cmd_token_generate(&config, force).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(mut config: AppConfig, simulate: bool) -> ExitCode {
    if simulate {
        config.hardware.backend = "simulated".to_string();
        config.hardware.require_privilege = false;
    }
    info!(backend = %config.hardware.backend, "Starting fanguard daemon");

    let daemon = Daemon::new(config);
    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let snapshot = client(config).await?.get_state().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_status(&snapshot));
    }
    Ok(())
}

async fn cmd_watch(config: &AppConfig, count: Option<usize>, json: bool) -> Result<()> {
    let mut updates = client(config).await?.subscribe().await?;
    let mut seen = 0usize;
    while let Some(snapshot) = updates.next().await {
        let snapshot = snapshot?;
        if json {
            println!("{}", serde_json::to_string(&snapshot)?);
        } else {
            println!("{}", render_line(&snapshot));
        }
        seen += 1;
        if count.is_some_and(|n| seen >= n) {
            break;
        }
    }
    Ok(())
}

async fn cmd_set_policy(config: &AppConfig, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read policy file '{}'", file.display()))?;
    let policy = ControlPolicy::parse_toml(&text)
        .with_context(|| format!("invalid policy in '{}'", file.display()))?;
    client(config).await?.set_policy(policy).await?;
    println!("Policy applied.");
    Ok(())
}

async fn cmd_policy(config: &AppConfig, default: bool) -> Result<()> {
    let policy = if default {
        config.default_policy()
    } else {
        client(config).await?.get_state().await?.policy
    };
    print!("{}", toml::to_string_pretty(&policy)?);
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("TOML error")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn cmd_token_generate(config: &AppConfig, force: bool) -> Result<()> {
    let path = Path::new(&config.auth.token_path);
    IpcToken::generate().write(path, force).await?;
    println!("Wrote IPC token to '{}' (mode 0600).", path.display());
    Ok(())
}

async fn client(config: &AppConfig) -> Result<IpcClient> {
    let token_path = Path::new(&config.auth.token_path);
    let token = IpcToken::load(token_path)
        .await
        .context("cannot read the IPC token; is this user allowed to control fanguard?")?;
    Ok(IpcClient::new(&config.daemon.socket_path, token)
        .with_max_frame_bytes(config.daemon.max_frame_bytes))
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("cannot load config '{}'", path.display()))
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

fn render_status(snapshot: &RuntimeSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "state:      {}", snapshot.state);
    let _ = writeln!(out, "generation: {}", snapshot.generation);
    let _ = writeln!(out, "uptime:     {}s", snapshot.uptime_secs);
    let _ = writeln!(out, "daemon:     {}", snapshot.version);
    let _ = writeln!(out, "driver:     {}", snapshot.health.driver);
    if snapshot.health.consecutive_failures > 0 || snapshot.health.total_failures > 0 {
        let _ = writeln!(
            out,
            "failures:   {} consecutive, {} total",
            snapshot.health.consecutive_failures, snapshot.health.total_failures
        );
    }
    if let Some(err) = &snapshot.health.last_error {
        let _ = writeln!(out, "last error: {err}");
    }
    for ch in &snapshot.channels {
        let _ = writeln!(
            out,
            "{:<4} temp {:>8}  band {:>2}  target {:>4}  applied {:>4}",
            ch.channel.to_string(),
            opt(ch.temperature),
            opt(ch.band),
            pct(ch.target_duty),
            pct(ch.applied_duty),
        );
    }
    out
}

fn render_line(snapshot: &RuntimeSnapshot) -> String {
    let mut line = format!("#{} {}", snapshot.generation, snapshot.state);
    for ch in &snapshot.channels {
        let _ = write!(
            line,
            "  {}={}@{}",
            ch.channel,
            opt(ch.temperature),
            pct(ch.applied_duty)
        );
    }
    line
}

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn pct(value: Option<u8>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v}%"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use fanguard_config::FanChannel;
    use fanguard_config::policy::DeciCelsius;
    use fanguard_core::control::{AdapterHealth, ChannelStatus, LoopState};
    use pretty_assertions::assert_eq;

    fn snapshot() -> RuntimeSnapshot {
        let mut cpu = ChannelStatus::new(FanChannel::Cpu);
        cpu.temperature = Some(DeciCelsius(523));
        cpu.band = Some(1);
        cpu.target_duty = Some(60);
        cpu.applied_duty = Some(60);
        RuntimeSnapshot {
            generation: 7,
            state: LoopState::Running,
            channels: vec![cpu, ChannelStatus::new(FanChannel::Gpu)],
            policy: ControlPolicy::fixed(100),
            health: AdapterHealth {
                driver: "simulated".into(),
                ..Default::default()
            },
            version: "0.1.0".into(),
            uptime_secs: 12,
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["fanguard", "-vv", "watch", "--count", "3"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Watch {
                count: Some(3),
                json: false
            }
        ));

        let cli = Cli::try_parse_from(["fanguard", "token", "generate", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Token {
                action: TokenAction::Generate { force: true }
            }
        ));
    }

    #[test]
    fn test_render_status() {
        let text = render_status(&snapshot());
        assert!(text.contains("state:      running"));
        assert!(text.contains("52.3°C"));
        assert!(text.contains("60%"));
        assert!(!text.contains("last error"));
    }

    #[test]
    fn test_render_line() {
        assert_eq!(render_line(&snapshot()), "#7 running  cpu=52.3°C@60%  gpu=-@-");
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.daemon.socket_path, AppConfig::default().daemon.socket_path);
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, "[safety]\nfloor_percent = 0\n").await.unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
