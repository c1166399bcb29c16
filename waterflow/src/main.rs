//! Irrigation valve controller.
//!
//! `waterflow loop` is meant to be started every minute by cron. The other
//! commands write the override markers it consumes or report on its state.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, Local, NaiveTime};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use waterflow::controller::{LoopContext, NeverSkip, run_loop};
use waterflow::core::types::{ForceKind, LoopOutcome};
use waterflow::exit_codes;
use waterflow::io::config::{ProgramEdit, load_config, update_program};
use waterflow::io::init::{InitOptions, WaterflowPaths, init_waterflow};
use waterflow::io::metrics::{JsonlMetrics, MetricsSink, NullMetrics};
use waterflow::io::oplog::{FileOperatorLog, OperatorLog};
use waterflow::io::pacer::ThreadPacer;
use waterflow::io::state::StateStore;
use waterflow::io::store::FsMarkerStore;
use waterflow::io::valve::driver_from_config;
use waterflow::logging;
use waterflow::operator::{next_program_message, request_force, request_stop, status};

#[derive(Parser)]
#[command(name = "waterflow", version, about = "Irrigation valve scheduler and controller")]
struct Cli {
    /// Config file (default: ~/.config/waterflow/config.toml).
    #[arg(long, global = true, env = "WATERFLOW_CONFIG")]
    config: Option<PathBuf>,
    /// Directory holding markers and logs (default: ~/var/waterflow).
    #[arg(long, global = true, env = "WATERFLOW_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state directory and write the default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one loop invocation.
    Loop {
        /// Evaluate the schedule as if it were this RFC 3339 instant.
        #[arg(long)]
        now: Option<DateTime<FixedOffset>>,
    },
    /// Ask the next loop to run a program or a single valve.
    Force {
        #[arg(value_enum)]
        kind: ForceTarget,
        /// Zero-based program or valve index.
        index: usize,
    },
    /// Stop the running sequence and skip the next invocation.
    Stop,
    /// Report loop health and pending requests. Exits 3 when stalled.
    Status,
    /// Print the operator log.
    Log,
    /// Print the next scheduled program.
    Next,
    /// Edit a program's start time, enabled flag, or valve durations.
    Program {
        name: String,
        /// Start time, `HH:MM` or `HH:MM:SS`.
        #[arg(long, value_parser = parse_start_time)]
        time: Option<NaiveTime>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        /// Minutes per valve, comma separated.
        #[arg(long, value_delimiter = ',')]
        valves: Option<Vec<u32>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ForceTarget {
    Program,
    Valve,
}

impl From<ForceTarget> for ForceKind {
    fn from(target: ForceTarget) -> Self {
        match target {
            ForceTarget::Program => ForceKind::Program,
            ForceTarget::Valve => ForceKind::Valve,
        }
    }
}

fn parse_start_time(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|err| format!("invalid start time '{raw}': {err}"))
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = resolve_paths(&cli)?;
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Loop { now } => cmd_loop(&paths, now),
        Command::Force { kind, index } => cmd_force(&paths, kind.into(), index),
        Command::Stop => cmd_stop(&paths),
        Command::Status => cmd_status(&paths),
        Command::Log => cmd_log(&paths),
        Command::Next => cmd_next(&paths),
        Command::Program {
            name,
            time,
            enable,
            disable,
            valves,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let edit = ProgramEdit {
                start_time: time,
                enabled,
                valves_times: valves,
            };
            cmd_program(&paths, &name, &edit)
        }
    }
}

fn resolve_paths(cli: &Cli) -> Result<WaterflowPaths> {
    if let (Some(config), Some(state_dir)) = (&cli.config, &cli.state_dir) {
        return Ok(WaterflowPaths::new(config.clone(), state_dir.clone()));
    }
    let defaults = WaterflowPaths::default_locations()?;
    Ok(WaterflowPaths::new(
        cli.config.clone().unwrap_or(defaults.config_path),
        cli.state_dir.clone().unwrap_or(defaults.state_dir),
    ))
}

fn cmd_init(paths: &WaterflowPaths, force: bool) -> Result<i32> {
    init_waterflow(paths, &InitOptions { force })?;
    println!("{}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_loop(paths: &WaterflowPaths, now: Option<DateTime<FixedOffset>>) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = FsMarkerStore::new(paths.state_dir.clone());
    let log = FileOperatorLog::new(paths.oplog_path.clone());
    let metrics: Box<dyn MetricsSink> = if config.metrics {
        Box::new(JsonlMetrics::new(paths.metrics_path.clone()))
    } else {
        Box::new(NullMetrics)
    };
    let driver = driver_from_config(&config);
    let ctx = LoopContext {
        config: &config,
        store: &store,
        driver: driver.as_ref(),
        log: &log,
        metrics: metrics.as_ref(),
        pacer: &ThreadPacer,
        skip: &NeverSkip,
    };
    let outcome = match now {
        Some(now) => run_loop(&ctx, &now)?,
        None => run_loop(&ctx, &Local::now())?,
    };
    info!(?outcome, "loop finished");
    println!("{}", describe(&outcome));
    Ok(exit_codes::OK)
}

fn describe(outcome: &LoopOutcome) -> String {
    match outcome {
        LoopOutcome::LockBusy => "locked by a running invocation".to_string(),
        LoopOutcome::Stopped => "stopped".to_string(),
        LoopOutcome::ForcedExecuted { request, report } => format!(
            "forced {:?} {} (valves run: {:?}{})",
            request.kind,
            request.value,
            report.energized,
            if report.stopped { ", stopped" } else { "" }
        ),
        LoopOutcome::ScheduledExecuted {
            program, report, ..
        } => format!(
            "executed {program} (valves run: {:?}{})",
            report.energized,
            if report.stopped { ", stopped" } else { "" }
        ),
        LoopOutcome::ScheduledSkipped {
            program, reason, ..
        } => format!("skipped {program} ({reason:?})"),
        LoopOutcome::Waiting { program, due } => format!(
            "waiting for {program} at {}",
            due.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        LoopOutcome::NoActiveProgram => "no active program".to_string(),
    }
}

fn cmd_force(paths: &WaterflowPaths, kind: ForceKind, index: usize) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = FsMarkerStore::new(paths.state_dir.clone());
    request_force(&config, &StateStore::new(&store), kind, index)?;
    Ok(exit_codes::OK)
}

fn cmd_stop(paths: &WaterflowPaths) -> Result<i32> {
    let store = FsMarkerStore::new(paths.state_dir.clone());
    request_stop(&StateStore::new(&store))?;
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &WaterflowPaths) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = FsMarkerStore::new(paths.state_dir.clone());
    let report = status(&config, &StateStore::new(&store), &Local::now())?;

    match report.last_loop {
        Some(at) => println!(
            "last loop: {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("last loop: never"),
    }
    println!(
        "looping: {}",
        if report.looping_correctly { "ok" } else { "STALLED" }
    );
    if let Some(request) = report.forced {
        println!("forced: {:?} {}", request.kind, request.value);
    }
    if report.stop_requested {
        println!("stop requested");
    }
    match &report.next {
        Some(next) => println!(
            "next: {} at {}",
            next.name,
            next.due.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("next: none"),
    }

    Ok(if report.looping_correctly {
        exit_codes::OK
    } else {
        exit_codes::STALLED
    })
}

fn cmd_log(paths: &WaterflowPaths) -> Result<i32> {
    let log = FileOperatorLog::new(paths.oplog_path.clone());
    print!("{}", log.contents()?);
    Ok(exit_codes::OK)
}

fn cmd_next(paths: &WaterflowPaths) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = FsMarkerStore::new(paths.state_dir.clone());
    println!(
        "{}",
        next_program_message(&config, &StateStore::new(&store), &Local::now())?
    );
    Ok(exit_codes::OK)
}

fn cmd_program(paths: &WaterflowPaths, name: &str, edit: &ProgramEdit) -> Result<i32> {
    if *edit == ProgramEdit::default() {
        bail!("nothing to change for program '{name}'");
    }
    let mut config = load_config(&paths.config_path)?;
    update_program(&paths.config_path, &mut config, name, edit)?;
    let program = config
        .program_index(name)
        .map(|index| &config.programs[index])
        .context("edited program disappeared")?;
    println!(
        "{} {} {} {:?}",
        program.name,
        program.start_time.format("%H:%M:%S"),
        if program.enabled { "enabled" } else { "disabled" },
        program.valves_times
    );
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_loop_with_now() {
        let cli = Cli::parse_from(["waterflow", "loop", "--now", "2023-04-27T05:06:00+02:00"]);
        let Command::Loop { now } = cli.command else {
            panic!("expected loop command");
        };
        let now = now.expect("now");
        assert_eq!(now.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn parse_force_valve() {
        let cli = Cli::parse_from(["waterflow", "force", "valve", "1"]);
        assert!(matches!(
            cli.command,
            Command::Force {
                kind: ForceTarget::Valve,
                index: 1
            }
        ));
    }

    #[test]
    fn parse_program_edit() {
        let cli = Cli::parse_from([
            "waterflow",
            "program",
            "first",
            "--time",
            "06:30",
            "--disable",
            "--valves",
            "10,5",
        ]);
        let Command::Program {
            name,
            time,
            enable,
            disable,
            valves,
        } = cli.command
        else {
            panic!("expected program command");
        };
        assert_eq!(name, "first");
        assert_eq!(time, NaiveTime::from_hms_opt(6, 30, 0));
        assert!(!enable);
        assert!(disable);
        assert_eq!(valves, Some(vec![10, 5]));
    }

    #[test]
    fn enable_conflicts_with_disable() {
        let result = Cli::try_parse_from(["waterflow", "program", "first", "--enable", "--disable"]);
        assert!(result.is_err());
    }

    #[test]
    fn global_paths_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "waterflow",
            "status",
            "--config",
            "/tmp/w/config.toml",
            "--state-dir",
            "/tmp/w/var",
        ]);
        let paths = resolve_paths(&cli).expect("paths");
        assert_eq!(paths.oplog_path, PathBuf::from("/tmp/w/var/loop.log"));
    }
}
