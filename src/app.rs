use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{
    Args, Parser, Subcommand,
    builder::{Styles, styling},
};

use crate::config::{FileConfig, SupervisorConfig};
use crate::launcher::LaunchRequest;
use crate::local_logger::{GAMEWATCH_U8_COLOR_CODE, init_local_logger};
use crate::prelude::*;
use crate::runner::NullRunner;
use crate::supervisor::Supervisor;

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(
            styling::Ansi256Color(GAMEWATCH_U8_COLOR_CODE).on_default() | styling::Effects::BOLD,
        )
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(version, about = "Launch a game command and watch its process tree", styles = create_styles())]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a command and supervise the session until it really ends
    Run(Box<RunArgs>),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Working directory for the game, ~ is expanded
    #[arg(long, env = "GAMEWATCH_CWD")]
    pub cwd: Option<String>,

    /// Extra KEY=VALUE environment entries for the game only
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Terminal application to run the game in
    #[arg(long, env = "GAMEWATCH_TERMINAL")]
    pub terminal: Option<String>,

    /// Milliseconds between two heartbeat ticks
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_ms: Option<u64>,

    /// Seconds of warm-up before an empty tree may end the session
    #[arg(long, value_name = "SECS")]
    pub warmup_secs: Option<u64>,

    /// Consecutive heartbeats without a watched child before the session ends
    #[arg(long, value_name = "TICKS", value_parser = clap::value_parser!(u32).range(1..))]
    pub idle_ticks: Option<u32>,

    /// Additional process names to ignore, may be repeated
    #[arg(long = "exclude", value_name = "NAME")]
    pub exclude: Vec<String>,

    /// Do not echo the game's output to the console
    #[arg(long)]
    pub no_echo: bool,

    /// Print the session outcome as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// The game command to launch
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_local_logger()?;

    match cli.command {
        Commands::Run(args) => run_session(*args).await,
    }
}

async fn run_session(args: RunArgs) -> Result<i32> {
    let file_config = FileConfig::load()?;
    let config = resolve_config(&args, &file_config);
    let request = LaunchRequest {
        command: args.command.clone(),
        env: parse_env_pairs(&args.env)?,
        working_directory: args.cwd.clone(),
        terminal: args
            .terminal
            .clone()
            .or_else(|| file_config.launch.terminal.clone()),
    };

    let supervisor = Supervisor::launch(request, Arc::new(NullRunner), config)
        .context("failed to launch the game")?;
    let mut waiter = supervisor.clone();
    let mut interrupted_waiter = supervisor.clone();

    let outcome = tokio::select! {
        outcome = waiter.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping the session");
            supervisor.stop(true);
            interrupted_waiter.wait().await
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match outcome.exit_code {
            Some(code) => {
                info!("session ended: {}, game exited with code {code}", outcome.reason)
            }
            None => info!("session ended: {}", outcome.reason),
        }
    }

    Ok(outcome.exit_code.unwrap_or(0))
}

fn parse_env_pairs(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid --env entry {entry:?}, expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("invalid --env entry {entry:?}, expected KEY=VALUE");
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Command line flags override file values, which override built-in defaults.
/// The flags reject zero at parse time; a zero from the file counts as unset.
fn resolve_config(args: &RunArgs, file: &FileConfig) -> SupervisorConfig {
    let defaults = SupervisorConfig::default();
    let mut extra_exclusions = file.launch.excluded.clone();
    extra_exclusions.extend(args.exclude.iter().cloned());

    SupervisorConfig {
        heartbeat: args
            .heartbeat_ms
            .or(file.session.heartbeat_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.heartbeat),
        warmup: args
            .warmup_secs
            .or(file.session.warmup_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.warmup),
        max_idle_ticks: args
            .idle_ticks
            .or(file.session.max_idle_ticks)
            .filter(|ticks| *ticks > 0)
            .unwrap_or(defaults.max_idle_ticks),
        capture_limit_bytes: file
            .session
            .capture_limit_bytes
            .unwrap_or(defaults.capture_limit_bytes),
        echo_output: !args.no_echo && file.session.echo_output.unwrap_or(defaults.echo_output),
        extra_exclusions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_HEARTBEAT, DEFAULT_MAX_IDLE_TICKS, DEFAULT_WARMUP};

    #[test]
    fn env_pairs_split_on_the_first_equals() {
        let env = parse_env_pairs(&["WINEPREFIX=/games/pfx".into(), "OPTS=a=b".into()]).unwrap();
        assert_eq!(env["WINEPREFIX"], "/games/pfx");
        assert_eq!(env["OPTS"], "a=b");
    }

    #[test]
    fn malformed_env_pairs_are_rejected() {
        assert!(parse_env_pairs(&["NO_VALUE".into()]).is_err());
        assert!(parse_env_pairs(&["=value".into()]).is_err());
    }

    #[test]
    fn cli_flags_override_file_values_which_override_defaults() {
        let mut file = FileConfig::default();
        file.session.heartbeat_ms = Some(100);
        file.session.max_idle_ticks = Some(30);
        file.launch.excluded = vec!["gamemoded".into()];

        let args = RunArgs {
            heartbeat_ms: Some(50),
            exclude: vec!["mangohud".into()],
            command: vec!["game".into()],
            ..Default::default()
        };

        let config = resolve_config(&args, &file);
        assert_eq!(config.heartbeat, Duration::from_millis(50));
        assert_eq!(config.max_idle_ticks, 30);
        assert_eq!(config.warmup, DEFAULT_WARMUP);
        assert_eq!(
            config.extra_exclusions,
            vec!["gamemoded".to_string(), "mangohud".to_string()]
        );
    }

    #[test]
    fn no_echo_wins_over_the_file() {
        let mut file = FileConfig::default();
        file.session.echo_output = Some(true);

        let args = RunArgs {
            no_echo: true,
            command: vec!["game".into()],
            ..Default::default()
        };

        assert!(!resolve_config(&args, &file).echo_output);
    }

    #[test]
    fn zero_timing_flags_are_rejected_at_parse() {
        let zero_heartbeat =
            Cli::try_parse_from(["gamewatch", "run", "--heartbeat-ms", "0", "--", "game"]);
        let zero_idle = Cli::try_parse_from(["gamewatch", "run", "--idle-ticks", "0", "--", "game"]);

        assert!(zero_heartbeat.is_err());
        assert!(zero_idle.is_err());
    }

    #[test]
    fn zero_timing_file_values_fall_back_to_defaults() {
        let mut file = FileConfig::default();
        file.session.heartbeat_ms = Some(0);
        file.session.max_idle_ticks = Some(0);

        let args = RunArgs {
            command: vec!["game".into()],
            ..Default::default()
        };

        let config = resolve_config(&args, &file);
        assert_eq!(config.heartbeat, DEFAULT_HEARTBEAT);
        assert_eq!(config.max_idle_ticks, DEFAULT_MAX_IDLE_TICKS);
    }

    #[test]
    fn run_commands_parse() {
        let cli = Cli::try_parse_from([
            "gamewatch", "run", "--cwd", "/games", "--", "./game", "--level", "2",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command;
        assert_eq!(args.cwd.as_deref(), Some("/games"));
        assert_eq!(args.command, vec!["./game", "--level", "2"]);
    }

    #[test]
    fn cwd_and_terminal_fall_back_to_the_environment() {
        temp_env::with_vars(
            [
                ("GAMEWATCH_CWD", Some("/from-env")),
                ("GAMEWATCH_TERMINAL", Some("kitty")),
            ],
            || {
                let cli = Cli::try_parse_from(["gamewatch", "run", "--", "./game"]).unwrap();

                let Commands::Run(args) = cli.command;
                assert_eq!(args.cwd.as_deref(), Some("/from-env"));
                assert_eq!(args.terminal.as_deref(), Some("kitty"));
            },
        );
    }
}
