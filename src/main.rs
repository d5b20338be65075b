// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;

use scx_heater::config::interval_from_secs;
use scx_heater::config::DEFAULT_ERROR_BACKOFF;
use scx_heater::sensor::SysSensor;
use scx_heater::topology::nr_cpus_online;
use scx_heater::worker::run_worker_process;
use scx_heater::Controller;
use scx_heater::ControllerConfig;
use scx_heater::ExitReason;
use scx_heater::ProcessSupervisor;
use scx_heater::SizeTiers;
use scx_heater::Thresholds;
use scx_heater::WorkerCommand;

/// scx_heater: closed-loop CPU heater
///
/// Loads the CPUs with worker processes running a dense matrix kernel and
/// steers the package temperature into a band below the target. Once per
/// interval the temperature is classified against three thresholds:
///
/// - more than 10°C below target: add one worker, largest workload
/// - below target: keep workers, middle workload
/// - below max: keep workers, second smallest workload
/// - otherwise: remove one worker (down to one per CPU), smallest workload
///
/// The worker count stays between one and two per logical CPU after ramp
/// up. Reaching the critical temperature shuts everything down.
#[derive(Debug, Parser)]
struct Opts {
    /// Enable verbose output, including worker lifecycle. Specify multiple
    /// times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Target temperature in °C. The controller adds load below
    /// target - 10 and backs off at or above target.
    #[clap(short = 't', long, default_value = "75.0", env = "SCX_HEATER_TARGET")]
    target_temp: f64,

    /// Maximum temperature in °C. At or above it workers are removed.
    #[clap(short = 'm', long, default_value = "85.0", env = "SCX_HEATER_MAX")]
    max_temp: f64,

    /// Critical temperature in °C. Reaching it terminates the run.
    #[clap(short = 'c', long, default_value = "95.0", env = "SCX_HEATER_CRITICAL")]
    critical_temp: f64,

    /// Per-worker workload sizes, ascending. Each size is the dimension of
    /// the square matrices multiplied in one unit of work.
    #[clap(
        short = 's',
        long,
        value_delimiter = ',',
        default_value = "200,500,1000,1500"
    )]
    size_tiers: Vec<usize>,

    /// Control loop interval in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    interval: f64,

    /// Override the logical CPU count used for the worker floor and cap.
    #[clap(long)]
    nr_cpus: Option<usize>,

    /// Abort after this many consecutive failed control loop iterations.
    #[clap(long, default_value = "10")]
    max_errors: u32,

    /// Expose metrics on a Prometheus endpoint at http://localhost:9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    #[command(subcommand)]
    command: Option<SubCmd>,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Worker process, spawned by the controller (internal use)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Parser)]
struct WorkerArgs {
    #[clap(long)]
    id: usize,

    /// Initial workload size
    #[clap(long)]
    size: usize,
}

fn init_log(verbose: u8, quiet_default: bool) -> Result<()> {
    let llv = match (verbose, quiet_default) {
        (0, true) => simplelog::LevelFilter::Warn,
        (0, false) => simplelog::LevelFilter::Info,
        (1, _) => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn build_config(opts: &Opts) -> Result<ControllerConfig> {
    let config = ControllerConfig {
        thresholds: Thresholds::new(opts.target_temp, opts.max_temp, opts.critical_temp)?,
        tiers: SizeTiers::new(opts.size_tiers.clone())?,
        interval: interval_from_secs(opts.interval)?,
        error_backoff: DEFAULT_ERROR_BACKOFF,
        max_consecutive_errors: opts.max_errors,
    };
    Ok(config)
}

fn run_controller(opts: &Opts) -> Result<()> {
    let config = build_config(opts).context("Invalid configuration")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let nr_cpus = match opts.nr_cpus {
        Some(nr) => nr,
        None => nr_cpus_online(),
    };
    info!("scx_heater v{}: {} logical CPUs", env!("CARGO_PKG_VERSION"), nr_cpus);

    let sensor = SysSensor::new().context("Failed to initialize sensors")?;
    let command = WorkerCommand::current_exe(opts.verbose)
        .context("Failed to locate own executable for workers")?;
    let supervisor =
        ProcessSupervisor::new(nr_cpus, command).context("Failed to create process supervisor")?;

    let mut controller = Controller::new(sensor, supervisor, config)?;
    match controller.run(&shutdown)? {
        ExitReason::Signal => info!("Stopped by user request"),
        ExitReason::Critical => warn!("Stopped at critical temperature"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    match &opts.command {
        Some(SubCmd::Worker(args)) => {
            init_log(opts.verbose, true)?;
            run_worker_process(args.id, args.size)
        }
        None => {
            init_log(opts.verbose, false)?;
            run_controller(&opts)
        }
    }
}
