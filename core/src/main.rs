//! MCL: Monte Carlo Localization of a mobile robot from logged odometry and laser scans.
//!
//! The program has three commands:
//!
//! - `raycast`: precompute the expected range cache of an occupancy grid and save it to disk.
//! - `run`: localize the robot over a log, write the point estimate trace as CSV and optionally report
//!   the path error against a ground-truth log.
//! - `config`: write the active configuration (the defaults unless `--config` is given) to a file.
//!
//! Parameters are read from a configuration file (TOML/JSON/YAML) passed with `--config`; the few
//! flags on the `run` command override the corresponding configuration fields.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};

use mcl::sim::{path_rmse, run_localization, write_trace, SimulationConfig};
use mcl::{messages, ExpectedRangeCache, OccupancyGrid};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Monte Carlo Localization over a known occupancy grid.")]
struct Cli {
    /// Configuration file (TOML/JSON/YAML). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace); `RUST_LOG` refines it per module
    #[arg(long, default_value = "info", global = true)]
    log_level: log::LevelFilter,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Precompute and save the expected range cache of a map
    Raycast(RaycastArgs),
    /// Localize the robot over a log and write the estimated trace
    Run(RunArgs),
    /// Write the active configuration to a file
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RaycastArgs {
    /// Occupancy grid text file
    #[arg(short, long)]
    map: PathBuf,
    /// Destination of the cache
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Occupancy grid text file
    #[arg(short, long)]
    map: PathBuf,
    /// Robot log to localize over
    #[arg(short, long)]
    log: PathBuf,
    /// Expected range cache; built and saved here if the file does not exist
    #[arg(long)]
    cache: PathBuf,
    /// Destination of the trace CSV
    #[arg(short, long)]
    output: PathBuf,
    /// Ground-truth log to compute the path RMSE against
    #[arg(long)]
    ground_truth: Option<PathBuf>,
    /// Override the configured random seed
    #[arg(long)]
    seed: Option<u64>,
    /// Override the configured number of particles
    #[arg(long)]
    particles: Option<usize>,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Destination file; the format follows its extension
    #[arg(short, long)]
    output: PathBuf,
}

/// Append-mode file target for the logger, creating missing parent directories.
fn log_file_target(path: &Path) -> Result<env_logger::Target> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    Ok(env_logger::Target::Pipe(Box::new(file)))
}

fn init_logger(level: log::LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{:<5}] {}: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        builder.target(log_file_target(path)?);
    }
    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    let config = match path {
        Some(path) => SimulationConfig::from_file(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn load_grid(path: &Path, config: &SimulationConfig) -> Result<Arc<OccupancyGrid>> {
    let grid = OccupancyGrid::from_file(path, config.cell_size)
        .with_context(|| format!("cannot load map {}", path.display()))?;
    info!("Loaded {} from {}", grid, path.display());
    Ok(Arc::new(grid))
}

fn raycast(args: &RaycastArgs, config: &SimulationConfig) -> Result<()> {
    let grid = load_grid(&args.map, config)?;
    let cache = ExpectedRangeCache::build(&grid, &config.raycast)?;
    cache
        .save(&args.output)
        .with_context(|| format!("cannot save cache to {}", args.output.display()))?;
    info!("Expected range cache written to {}", args.output.display());
    Ok(())
}

fn run(args: &RunArgs, mut config: SimulationConfig) -> Result<()> {
    if let Some(seed) = args.seed {
        config.filter.seed = seed;
    }
    if let Some(particles) = args.particles {
        config.filter.num_particles = particles;
    }
    let grid = load_grid(&args.map, &config)?;
    let cache = ExpectedRangeCache::load_or_build(&args.cache, &grid, &config.raycast)
        .with_context(|| format!("expected range cache {}", args.cache.display()))?;
    let max_range = config.sensor_model.max_range();
    let observations = messages::load_log(&args.log, max_range)
        .with_context(|| format!("cannot load robot log {}", args.log.display()))?;

    let trace = run_localization(grid, Arc::new(cache), &observations, &config)?;
    write_trace(&trace, &args.output)
        .with_context(|| format!("cannot write trace to {}", args.output.display()))?;
    info!("Trace of {} points written to {}", trace.len(), args.output.display());

    if let Some(path) = &args.ground_truth {
        let ground_truth = messages::load_log(path, max_range)
            .with_context(|| format!("cannot load ground truth {}", path.display()))?;
        match path_rmse(&trace, &ground_truth) {
            Some(rmse) => info!("Path RMSE against {}: {:.3}", path.display(), rmse),
            None => info!("No trace point could be paired with {}", path.display()),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.log_file.as_deref())?;

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };
    let result = match &cli.command {
        Command::Raycast(args) => raycast(args, &config),
        Command::Run(args) => run(args, config),
        Command::Config(args) => config
            .to_file(&args.output)
            .with_context(|| format!("cannot write configuration to {}", args.output.display()))
            .map(|_| info!("Configuration written to {}", args.output.display())),
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
