use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use tracing::info;

use crate::config::{RunConfig, Settings, WaitMode, default_config_path};
use crate::device::{AdbChannel, DeviceChannel, resolve_adb_binary};
use crate::events::EventLog;
use crate::inventory::Inventory;
use crate::runner::{RunController, RunReport, discover_builds};
use crate::store::{BlockingStoreHttp, DeviceIdentity, MetricsStore};
use crate::telemetry::{current_trace_file, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "scenebench", author, version, about = "Scene-based mobile performance benchmark runner", long_about = None)]
pub struct Cli {
    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Custom config path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install, launch and measure builds on an attached device.
    Run(RunArgs),
    /// Show the most recent attempt transitions.
    History {
        /// Number of events to show.
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Application package, e.g. com.acme.game.
    pub package: String,

    /// Builds to test, in order.
    #[arg(value_name = "APK")]
    pub apks: Vec<PathBuf>,

    /// Test every *.apk in DIR instead of the listed builds.
    #[arg(long, value_name = "DIR")]
    pub folder: Option<PathBuf>,

    /// Device serial; defaults to the only attached device.
    #[arg(long, value_name = "ID")]
    pub device: Option<String>,

    /// Number of cycles over all builds.
    #[arg(long = "run", value_name = "N", default_value_t = 1, value_parser = value_parser!(u32).range(1..))]
    pub cycles: u32,

    /// Seconds each attempt waits for a result.
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub sleep: u64,

    /// Extra attempts after a timeout.
    #[arg(long, value_name = "R", default_value_t = 2)]
    pub retry: u32,

    /// Measure time to the first result instead of waiting out the scene run.
    #[arg(long, action = ArgAction::SetTrue)]
    pub startup: bool,

    /// Metrics index to reconcile results into.
    #[arg(long, value_name = "NAME")]
    pub index: Option<String>,

    /// Capture a screenshot after each successful attempt.
    #[arg(long, action = ArgAction::SetTrue)]
    pub screenshot: bool,

    /// Launch activity class (defaults to the configured Unity player activity).
    #[arg(long, value_name = "CLASS")]
    pub activity: Option<String>,
}

impl RunArgs {
    /// Merge command-line overrides onto persisted settings.
    pub fn to_run_config(&self, settings: &Settings) -> RunConfig {
        let mut config = RunConfig::from_settings(self.package.clone(), settings);
        config.device = self.device.clone();
        config.cycles = self.cycles;
        config.wait = Duration::from_secs(self.sleep);
        config.retry_budget = self.retry;
        config.mode = if self.startup {
            WaitMode::Startup
        } else {
            WaitMode::SteadyState
        };
        config.index = self.index.clone().filter(|index| !index.trim().is_empty());
        config.capture_screenshots = self.screenshot;
        if let Some(activity) = &self.activity {
            config.activity_class = activity.clone();
        }
        config
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let settings = Settings::load_or_default(&config_path)?;
    init_tracing(cli.verbose, &settings.traces)?;
    info!(path = %config_path.display(), "using scenebench config");

    match &cli.command {
        Command::Run(args) => run_benchmark(args, &settings),
        Command::History { count } => print_history(&settings, *count),
    }
}

fn run_benchmark(args: &RunArgs, settings: &Settings) -> Result<()> {
    let config = args.to_run_config(settings);
    let builds = discover_builds(&args.apks, args.folder.as_deref())?;

    let adb = resolve_adb_binary(settings.adb_path.as_deref())?;
    let device = AdbChannel::new(adb, config.device.clone());
    info!(adb = %device.binary().display(), "using adb");
    let serial = device.serial().context("Unable to read device serial")?;
    if serial.is_empty() {
        bail!("No device serial reported; pass --device");
    }

    let identity = match Inventory::from_settings(&settings.inventory, settings.store.timeout())? {
        Some(inventory) => inventory.identify(&serial),
        None => DeviceIdentity::unnamed(serial.as_str()),
    };
    info!(serial = %identity.serial, name = %identity.name, mode = %config.mode, "device ready");

    let output_dir = settings.resolve_results_root()?.join(&serial);
    let events = EventLog::new(settings.resolve_event_log()?);
    let store = match &config.index {
        Some(index) => Some(MetricsStore::new(
            &settings.store.url,
            index,
            BlockingStoreHttp::new(settings.store.timeout())?,
        )),
        None => None,
    };

    let controller = RunController::new(
        &device,
        &config,
        &events,
        store.as_ref(),
        &identity,
        &output_dir,
    );
    let report = controller.run(&builds)?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("--------------------------------");
    println!("Battery on start {}", describe_battery(report.battery_start));
    println!("Battery on finish {}", describe_battery(report.battery_end));
    for (index, set) in report.sets.iter().enumerate() {
        println!("Result set {index}");
        println!("APK Name:{}", set.build.name);
        for value in set.values() {
            println!("{value}");
        }
    }
    println!(
        "{} attempt(s), {} skipped, {} with ambiguous records",
        report.attempts(),
        report.skipped(),
        report.ambiguous()
    );
    println!("Results written to {}", report.result_file.display());
    if let Some(trace) = current_trace_file() {
        println!("Trace written to {}", trace.display());
    }
}

fn describe_battery(level: Option<u8>) -> String {
    level
        .map(|level| format!("{level}%"))
        .unwrap_or_else(|| "unknown".into())
}

fn print_history(settings: &Settings, limit: usize) -> Result<()> {
    let log = EventLog::new(settings.resolve_event_log()?);
    let events = log.read_events(limit)?;

    if events.is_empty() {
        println!(
            "No attempt events recorded yet. Log file: {}",
            log.log_path().display()
        );
        return Ok(());
    }

    println!(
        "Recent {} event(s) (showing up to {} requested) from {}",
        events.len(),
        limit,
        log.log_path().display()
    );
    for event in events.iter().rev() {
        let run = event.run_id.simple().to_string();
        println!(
            "  {timestamp} run={run} {build} cycle={cycle} retry={retry} [{state}]",
            timestamp = event.timestamp.to_rfc3339(),
            run = &run[..8],
            build = event.build,
            cycle = event.cycle,
            retry = event.retry,
            state = event.state,
        );
        if let Some(detail) = &event.detail {
            println!("      {detail}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let cli = Cli::parse_from(args);
        match cli.command {
            Command::Run(run) => run,
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn run_defaults_match_documented_values() {
        let args = run_args(&["scenebench", "run", "com.acme.game", "a.apk", "b.apk"]);
        assert_eq!(args.package, "com.acme.game");
        assert_eq!(args.apks, vec![PathBuf::from("a.apk"), PathBuf::from("b.apk")]);
        assert_eq!(args.cycles, 1);
        assert_eq!(args.sleep, 300);
        assert_eq!(args.retry, 2);
        assert!(!args.startup);
        assert!(args.index.is_none());
    }

    #[test]
    fn run_flags_flow_into_run_config() {
        let args = run_args(&[
            "scenebench",
            "run",
            "com.acme.game",
            "--folder",
            "/builds",
            "--device",
            "R58M123",
            "--run",
            "3",
            "--sleep",
            "90",
            "--retry",
            "0",
            "--startup",
            "--index",
            "PerfTests",
            "--screenshot",
        ]);
        let config = args.to_run_config(&Settings::default());
        assert_eq!(args.folder, Some(PathBuf::from("/builds")));
        assert_eq!(config.device.as_deref(), Some("R58M123"));
        assert_eq!(config.cycles, 3);
        assert_eq!(config.wait, Duration::from_secs(90));
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.mode, WaitMode::Startup);
        assert_eq!(config.index.as_deref(), Some("PerfTests"));
        assert!(config.capture_screenshots);
        assert_eq!(
            config.component(),
            "com.acme.game/com.unity3d.player.UnityPlayerActivity"
        );
    }

    #[test]
    fn activity_override_and_global_flags() {
        let cli = Cli::parse_from([
            "scenebench",
            "run",
            "com.acme.game",
            "a.apk",
            "--activity",
            "com.acme.MainActivity",
            "--verbose",
            "--config",
            "/tmp/scenebench.json",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/scenebench.json")));
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let config = args.to_run_config(&Settings::default());
        assert_eq!(config.component(), "com.acme.game/com.acme.MainActivity");
    }

    #[test]
    fn zero_cycles_are_rejected() {
        let parsed = Cli::try_parse_from(["scenebench", "run", "com.acme.game", "--run", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn history_count_defaults_and_overrides() {
        let cli = Cli::parse_from(["scenebench", "history"]);
        assert!(matches!(cli.command, Command::History { count: 20 }));
        let cli = Cli::parse_from(["scenebench", "history", "--count", "5"]);
        assert!(matches!(cli.command, Command::History { count: 5 }));
    }
}
