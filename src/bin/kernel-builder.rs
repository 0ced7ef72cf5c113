use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use kernel_builder::{
    preflight, telemetry, Config, HostShell, PipelineReport, RunState, StageRunner, StageStatus,
};
use tracing::{error, Level};

#[derive(Debug, Parser)]
#[command(
    name = "kernel-builder",
    version,
    about = "Build a patched ChromeOS kernel, its modules and headers.",
    long_about = "Build a patched ChromeOS kernel, its modules and headers.\n\n\
        Patch files (patches/*.patch) and kernel configs are not built in. They are \
        read relative to the directory of --config, or the current directory when the \
        built-in configuration is used, and a run refuses to start while any is missing."
)]
struct Cli {
    /// Version key of the variant to build (see --list).
    #[arg(required_unless_present = "list")]
    version: Option<String>,

    /// Configuration file (default: the built-in configuration).
    #[arg(short, long, env = "KERNEL_BUILDER_CONFIG")]
    config: Option<PathBuf>,

    /// Scratch directory for the source tree and staging.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Directory receiving the three artifacts.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Parallel make jobs (0 = one per CPU).
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Print the known version keys and exit.
    #[arg(long)]
    list: bool,

    /// Skip host tool checks.
    #[arg(long)]
    skip_preflight: bool,

    /// Discard any existing source tree and clone again.
    #[arg(long)]
    fresh: bool,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    if cli.list {
        for key in config.variants.keys() {
            println!("{}", key);
        }
        return ExitCode::SUCCESS;
    }

    let Some(key) = cli.version.as_deref() else {
        error!("no version key given");
        return ExitCode::from(2);
    };

    let variant = match config.variants.resolve(key) {
        Ok(variant) => variant,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = config.check_inputs(&variant) {
        error!("{:#}", e);
        return ExitCode::from(2);
    }

    if !cli.skip_preflight {
        if let Err(e) = preflight::check_host_tools() {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    }

    let shell = HostShell;
    let runner = StageRunner::new(&shell, &config.build, &config.patches).fresh(cli.fresh);
    match runner.run(&variant) {
        Ok(report) => {
            print_summary(&report);
            if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let cwd = std::env::current_dir().context("resolving current directory")?;
            Config::embedded(&cwd)?
        }
    };

    if let Some(dir) = &cli.work_dir {
        config.build.work_dir = absolute(dir)?;
    }
    if let Some(dir) = &cli.output_dir {
        config.build.output_dir = absolute(dir)?;
    }
    if let Some(jobs) = cli.jobs {
        config.build.jobs = jobs;
    }
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("resolving current directory")?;
    Ok(cwd.join(path))
}

fn print_summary(report: &PipelineReport) {
    println!();
    println!("{:<20} {:<10} {:>10}", "stage", "status", "time");
    for result in &report.stages {
        let status = match result.status {
            StageStatus::Succeeded => "ok",
            StageStatus::Failed => "FAILED",
            StageStatus::Running => "running",
            StageStatus::Pending => "pending",
        };
        println!(
            "{:<20} {:<10} {:>9.1}s",
            result.stage.name(),
            status,
            result.duration_ms as f64 / 1000.0
        );
    }
    println!(
        "{:<20} {:<10} {:>9.1}s",
        "total",
        "",
        report.total_duration_ms() as f64 / 1000.0
    );
    println!();

    match &report.state {
        RunState::Succeeded => {
            println!("[{}] build succeeded", report.variant.key);
            for path in &report.artifacts {
                println!("  {}", path.display());
            }
        }
        RunState::Aborted { stage, reason } => {
            eprintln!("[{}] aborted at {}: {}", report.variant.key, stage, reason);
        }
        RunState::NotStarted | RunState::Running(_) => {}
    }
}
