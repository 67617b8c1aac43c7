use crate::poller::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Engine not supported: {0}")]
    UnsupportedEngine(String),
    #[error("Failed to read config file")]
    ReadConfig(#[from] std::io::Error),
    #[error("Failed to parse config file")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Configuration is invalid, see the log for details")]
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub input: InputConfig,
    // name of the raster map that receives the visibility counts
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub viewshed: ViewshedParams,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    // Name of the selected engine, see engine::load_engine for the selection proccess
    #[serde(default = "default_engine_name")]
    pub name: String,
    // command prefix for running modules outside of a session, e.g. ["grass", "<mapset>", "--exec"]
    #[serde(default)]
    pub exec: Vec<String>,
    // overwrite an existing output map
    #[serde(default)]
    pub overwrite: bool,
    // time a terminated job gets to exit before it is killed
    #[serde(default = "default_termination_grace")]
    pub termination_grace_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    // elevation raster the viewsheds are computed over
    pub dem: Option<String>,
    // vector map with the observer points
    pub vector: Option<String>,
    // file with `x,y,jobId` lines, `-` reads stdin
    pub points: Option<PathBuf>,
}

/// Parameters shared by every visibility computation of a run
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ViewshedParams {
    #[serde(default = "default_elevation")]
    pub observer_elevation: f64,
    #[serde(default = "default_elevation")]
    pub target_elevation: f64,
    // -1 means unlimited
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
    // in MB
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default = "default_refraction_coeff")]
    pub refraction_coeff: f64,
    #[serde(default)]
    pub curvature: bool,
    #[serde(default)]
    pub refraction: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// submit batches of `workers` jobs and wait for the whole batch
    #[default]
    Lockstep,
    /// keep `workers` jobs in flight on a thread pool
    Pool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // maximum number of concurrent jobs, defaults to the number of cpus
    pub workers: Option<usize>,
    #[serde(default)]
    pub strategy: Strategy,
    // per job limit in seconds, jobs exceeding it are terminated
    pub job_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            exec: Vec::new(),
            overwrite: false,
            termination_grace_secs: default_termination_grace(),
        }
    }
}

impl Default for ViewshedParams {
    fn default() -> Self {
        Self {
            observer_elevation: default_elevation(),
            target_elevation: default_elevation(),
            max_distance: default_max_distance(),
            memory: default_memory(),
            refraction_coeff: default_refraction_coeff(),
            curvature: false,
            refraction: false,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval(),
            timeout_secs: None,
        }
    }
}

impl ViewshedParams {
    /// flag string for r.viewshed, boolean output is always requested
    pub fn flags(&self) -> String {
        let mut flags = String::from("-b");

        if self.refraction {
            flags.push('r');
        }
        if self.curvature {
            flags.push('c');
        }

        flags
    }
}

impl ExecutorConfig {
    /// resolve the worker ceiling once, never below 1
    pub fn resolve_workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

impl From<&PollConfig> for RetryPolicy {
    fn from(config: &PollConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            interval: Duration::from_millis(config.interval_ms),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }

    /// Logs every problem and returns whether any was found. A dry run writes nothing,
    /// so `require_output` is false for it.
    pub fn preflight_checks(&mut self, require_output: bool) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.input.dem.is_none() {
            error!("input.dem is required, there is no surface to compute viewsheds on");
            contains_error = true;
        }

        match (&self.input.vector, &self.input.points) {
            (None, None) => {
                error!("Neither input.vector nor input.points is set, there are no observers");
                contains_error = true;
            }
            (Some(vector), Some(points)) => {
                warn!(
                    "Both input.vector ({vector}) and input.points ({}) are set. Using input.points",
                    points.to_string_lossy()
                );
                self.input.vector = None;
            }
            _ => {}
        }

        if require_output && self.output.is_none() {
            error!("output is required");
            contains_error = true;
        }

        let viewshed = &self.viewshed;
        if !(0.0..=1.0).contains(&viewshed.refraction_coeff) {
            error!(
                "viewshed.refraction_coeff ({}) must be within 0.0 and 1.0",
                viewshed.refraction_coeff
            );
            contains_error = true;
        }

        if !(viewshed.max_distance > 0.0 || viewshed.max_distance == -1.0) {
            error!(
                "viewshed.max_distance ({}) must be positive or -1 for unlimited",
                viewshed.max_distance
            );
            contains_error = true;
        }

        if viewshed.memory == 0 {
            error!("viewshed.memory cannot be 0");
            contains_error = true;
        }

        if self.executor.workers == Some(0) {
            warn!("executor.workers is 0, falling back to a single worker");
        }

        if self.executor.job_timeout_secs == Some(0) {
            error!("executor.job_timeout_secs cannot be 0. Every job would be terminated immediately");
            contains_error = true;
        }

        if self.poll.max_attempts == 0 {
            error!("poll.max_attempts cannot be 0, artifacts would never be found");
            contains_error = true;
        }

        contains_error
    }
}

fn default_engine_name() -> String {
    "grass".to_string()
}

fn default_termination_grace() -> u64 {
    5
}

fn default_elevation() -> f64 {
    1.75
}

fn default_max_distance() -> f64 {
    1000.0
}

fn default_memory() -> u32 {
    500
}

fn default_refraction_coeff() -> f64 {
    0.14286
}

fn default_max_attempts() -> u32 {
    200
}

fn default_interval() -> u64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "
engine:
  name: grass
  exec: [grass, /data/nc_spm/PERMANENT, --exec]
input:
  dem: elevation
  vector: observers
output: total_viewshed
viewshed:
  observer_elevation: 2.0
  max_distance: 500
  curvature: true
executor:
  workers: 4
  strategy: pool
  job_timeout_secs: 600
poll:
  max_attempts: 20
  interval_ms: 100
";

    fn valid() -> RunConfig {
        serde_yaml::from_str(FULL).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let config = valid();

        assert_eq!(config.engine.exec.len(), 3);
        assert_eq!(config.input.dem.as_deref(), Some("elevation"));
        assert_eq!(config.viewshed.observer_elevation, 2.0);
        assert_eq!(config.viewshed.target_elevation, 1.75);
        assert_eq!(config.viewshed.max_distance, 500.0);
        assert_eq!(config.viewshed.memory, 500);
        assert_eq!(config.executor.strategy, Strategy::Pool);
        assert_eq!(config.executor.resolve_workers(), 4);
        assert_eq!(config.executor.job_timeout(), Some(Duration::from_secs(600)));

        let policy = RetryPolicy::from(&config.poll);
        assert_eq!(policy.max_attempts, 20);
        assert_eq!(policy.interval, Duration::from_millis(100));
        assert_eq!(policy.timeout, None);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: RunConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.engine.name, "grass");
        assert_eq!(config.viewshed, ViewshedParams::default());
        assert_eq!(config.viewshed.refraction_coeff, 0.14286);
        assert_eq!(config.executor.strategy, Strategy::Lockstep);
        assert_eq!(config.poll.max_attempts, 200);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RunConfig>("executor:\n  threads: 4\n").is_err());
    }

    #[test]
    fn worker_count_is_clamped() {
        let config = ExecutorConfig {
            workers: Some(0),
            ..ExecutorConfig::default()
        };
        assert_eq!(config.resolve_workers(), 1);

        let config = ExecutorConfig::default();
        assert_eq!(config.resolve_workers(), num_cpus::get().max(1));
    }

    #[test]
    fn flags_follow_switches() {
        let mut params = ViewshedParams::default();
        assert_eq!(params.flags(), "-b");

        params.curvature = true;
        params.refraction = true;
        assert_eq!(params.flags(), "-brc");
    }

    #[test]
    fn preflight_accepts_valid_config() {
        assert!(!valid().preflight_checks(true));
    }

    #[test]
    fn preflight_reports_invalid_values() {
        let mut config = valid();
        config.viewshed.refraction_coeff = 1.5;
        assert!(config.preflight_checks(true));

        let mut config = valid();
        config.viewshed.max_distance = 0.0;
        assert!(config.preflight_checks(true));

        let mut config = valid();
        config.viewshed.max_distance = -1.0;
        assert!(!config.preflight_checks(true));

        let mut config = valid();
        config.poll.max_attempts = 0;
        assert!(config.preflight_checks(true));

        let mut config = valid();
        config.input.vector = None;
        assert!(config.preflight_checks(true));
    }

    #[test]
    fn preflight_prefers_points_file() {
        let mut config = valid();
        config.input.points = Some(PathBuf::from("observers.csv"));

        assert!(!config.preflight_checks(true));
        assert_eq!(config.input.vector, None);
    }

    #[test]
    fn output_only_required_when_writing() {
        let mut config = valid();
        config.output = None;

        assert!(!config.preflight_checks(false));
        assert!(config.preflight_checks(true));
    }
}
