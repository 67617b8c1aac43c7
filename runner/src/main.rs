use clap::{ArgAction, Parser};
use std::{
    error::Error,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use viewshed_runner::{
    config::{ConfigErrors, RunConfig, Strategy},
    engine::{load_engine, EngineError, TerrainEngine},
    run::{RunError, ViewshedRun},
};

/// Creates a total viewshed raster map from a DEM and observer points using r.viewshed
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// YAML run configuration, command line values take precedence
    #[arg(long)]
    config: Option<PathBuf>,
    /// Input observer vector points
    #[arg(long)]
    vect: Option<String>,
    /// File with `x,y,jobId` lines instead of a vector map, `-` reads stdin
    #[arg(long, conflicts_with = "vect")]
    points: Option<PathBuf>,
    /// Input DEM raster
    #[arg(long)]
    rast: Option<String>,
    /// Output raster map
    #[arg(short, long)]
    output: Option<String>,
    /// Consider the curvature of the earth (current ellipsoid)
    #[arg(short = 'c', long)]
    curvature: bool,
    /// Consider the effect of atmospheric refraction
    #[arg(short = 'r', long)]
    refraction: bool,
    /// Height of observer
    #[arg(long)]
    observer_elevation: Option<f64>,
    /// Height of targets
    #[arg(long)]
    target_elevation: Option<f64>,
    /// Maximum visibility radius. The higher the slower
    #[arg(long, allow_negative_numbers = true)]
    max_distance: Option<f64>,
    /// Amount of memory to use (in MB)
    #[arg(long)]
    memory: Option<u32>,
    /// Refraction coefficient (with -r)
    #[arg(long)]
    refraction_coeff: Option<f64>,
    /// Number of concurrent r.viewshed processes, defaults to the number of cpus
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,
    /// Terminate a single r.viewshed after this many seconds
    #[arg(long)]
    job_timeout: Option<u64>,
    /// Overwrite an existing output map
    #[arg(long)]
    overwrite: bool,
    /// Only print the batches that would be submitted
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to load configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to read points from {path}")]
    Points {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to export observer points from {vector}")]
    Export {
        vector: String,
        #[source]
        source: EngineError,
    },
    #[error("Total viewshed failed")]
    Run(#[from] RunError),
}

impl Args {
    /// command line values override the config file
    fn apply(&self, config: &mut RunConfig) {
        if let Some(vect) = &self.vect {
            config.input.vector = Some(vect.clone());
            config.input.points = None;
        }
        if let Some(points) = &self.points {
            config.input.points = Some(points.clone());
            config.input.vector = None;
        }
        if let Some(rast) = &self.rast {
            config.input.dem = Some(rast.clone());
        }
        if let Some(output) = &self.output {
            config.output = Some(output.clone());
        }

        let viewshed = &mut config.viewshed;
        viewshed.curvature |= self.curvature;
        viewshed.refraction |= self.refraction;
        if let Some(value) = self.observer_elevation {
            viewshed.observer_elevation = value;
        }
        if let Some(value) = self.target_elevation {
            viewshed.target_elevation = value;
        }
        if let Some(value) = self.max_distance {
            viewshed.max_distance = value;
        }
        if let Some(value) = self.memory {
            viewshed.memory = value;
        }
        if let Some(value) = self.refraction_coeff {
            viewshed.refraction_coeff = value;
        }

        if self.workers.is_some() {
            config.executor.workers = self.workers;
        }
        if let Some(strategy) = self.strategy {
            config.executor.strategy = strategy;
        }
        if self.job_timeout.is_some() {
            config.executor.job_timeout_secs = self.job_timeout;
        }
        config.engine.overwrite |= self.overwrite;
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn read_points(path: &Path) -> Result<String, CliError> {
    let listing = if path == Path::new("-") {
        let mut listing = String::new();
        io::stdin().read_to_string(&mut listing).map(|_| listing)
    } else {
        fs::read_to_string(path)
    };

    listing.map_err(|source| CliError::Points {
        path: path.to_string_lossy().into_owned(),
        source,
    })
}

fn run(args: Args) -> Result<(), CliError> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config);

    if config.preflight_checks(!args.dry_run) {
        return Err(ConfigErrors::Invalid.into());
    }

    let engine = load_engine(&config.engine)?;
    let run = ViewshedRun::from_config(&engine, &config)?;

    let listing = match (&config.input.points, &config.input.vector) {
        (Some(path), _) => read_points(path)?,
        (None, Some(vector)) => {
            engine
                .export_points(vector)
                .map_err(|source| CliError::Export {
                    vector: vector.clone(),
                    source,
                })?
        }
        (None, None) => return Err(ConfigErrors::Invalid.into()),
    };

    if args.dry_run {
        for (number, batch) in run.plan(&listing)?.iter().enumerate() {
            info!("Batch {}: jobs {batch:?}", number + 1);
        }
        return Ok(());
    }

    let output = config.output.as_deref().ok_or(ConfigErrors::Invalid)?;
    let results = run.execute(&listing, output)?;
    info!("Wrote {} visibility counts to {output}", results.len());

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            let mut source = error.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}
