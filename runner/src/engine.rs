mod grass;
#[cfg(test)]
pub(crate) mod scripted;

pub use grass::{GrassEngine, GrassProcess};

use crate::{
    config::{ConfigErrors, EngineConfig, ViewshedParams},
    points::{JobId, ObserverPoint},
    poller::VisibilityResult,
};
use std::{collections::BTreeMap, fmt, process::ExitStatus, time::Duration};
use thiserror::Error;

/// prefix of every per-job artifact, the job id is appended to it
pub const ARTIFACT_PREFIX: &str = "tempViewshed";
/// intermediate point layer that carries the counts into the rasterizer
pub const POINT_LAYER: &str = "tempViewshedPoints";
/// category that r.viewshed uses for visible cells in boolean mode
pub const VISIBLE_CATEGORY: &str = "1";

pub fn artifact_name(job_id: JobId) -> String {
    format!("{ARTIFACT_PREFIX}{job_id}")
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for a child process")]
    ChildError(#[from] std::io::Error),
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Failed to signal child process")]
    Signal(#[from] nix::errno::Errno),
    #[error("Summary report is malformed")]
    Report(#[from] ReportError),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("line {line:?} is not a `category count` pair")]
    MalformedLine { line: String },
    #[error("category {category:?} is reported twice")]
    DuplicateCategory { category: String },
}

/// How an engine process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Failed { code: Option<i32> },
    /// killed after exceeding the per-job timeout
    TimedOut,
    /// killed because the run was aborted
    Cancelled,
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else {
            Self::Failed {
                code: status.code(),
            }
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed { code: Some(code) } => write!(f, "exit code {code}"),
            Self::Failed { code: None } => write!(f, "termination by signal"),
            Self::TimedOut => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancellation"),
        }
    }
}

/// Per category cell counts of a single artifact, as produced by `TerrainEngine::summarize`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryReport {
    counts: BTreeMap<String, u64>,
}

impl SummaryReport {
    /// Parse `category count` lines (the `r.stats -c` layout), blank lines are skipped
    pub fn parse(stats: &str) -> Result<Self, ReportError> {
        let mut report = Self::default();

        for line in stats.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let mut fields = line.split_whitespace();

            match (fields.next(), fields.next(), fields.next()) {
                (Some(category), Some(count), None) => {
                    let count = count.parse().map_err(|_| ReportError::MalformedLine {
                        line: line.to_string(),
                    })?;

                    if report.counts.insert(category.to_string(), count).is_some() {
                        return Err(ReportError::DuplicateCategory {
                            category: category.to_string(),
                        });
                    }
                }
                _ => {
                    return Err(ReportError::MalformedLine {
                        line: line.to_string(),
                    })
                }
            }
        }

        Ok(report)
    }

    pub fn with_count(mut self, category: impl Into<String>, count: u64) -> Self {
        self.counts.insert(category.into(), count);
        self
    }

    pub fn count(&self, category: &str) -> Option<u64> {
        self.counts.get(category).copied()
    }

    /// number of visible cells, `None` if the report has no visible row at all
    pub fn visible(&self) -> Option<u64> {
        self.count(VISIBLE_CATEGORY)
    }
}

/// Artifacts that are removed at the end of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    Rasters { pattern: String },
    Vector { name: String },
}

impl Cleanup {
    /// everything a run may leave behind in the engine's namespace
    pub fn run_artifacts() -> [Cleanup; 2] {
        [
            Cleanup::Rasters {
                pattern: format!("{ARTIFACT_PREFIX}*"),
            },
            Cleanup::Vector {
                name: POINT_LAYER.to_string(),
            },
        ]
    }
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rasters { pattern } => write!(f, "rasters matching {pattern}"),
            Self::Vector { name } => write!(f, "vector {name}"),
        }
    }
}

/// A single in-flight visibility computation
pub trait JobProcess: Send {
    /// Block until the process has terminated or `timeout` elapsed.
    /// `Ok(None)` means the process is still running.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Termination>, EngineError>;

    /// Stop the process, blocks until it is gone
    fn terminate(&mut self) -> Result<(), EngineError>;
}

/// The external collaborator that runs visibility computations and owns their artifacts
pub trait TerrainEngine: Sync {
    type Process: JobProcess;

    /// launch the computation for `point` over `surface`, must not block until completion
    fn submit(
        &self,
        point: &ObserverPoint,
        surface: &str,
        params: &ViewshedParams,
    ) -> Result<Self::Process, EngineError>;

    fn artifact_exists(&self, job_id: JobId) -> Result<bool, EngineError>;

    fn summarize(&self, job_id: JobId) -> Result<SummaryReport, EngineError>;

    fn rasterize(&self, results: &[VisibilityResult], output: &str) -> Result<(), EngineError>;

    /// remove artifacts, removing nothing is not an error
    fn cleanup(&self, target: &Cleanup) -> Result<(), EngineError>;

    /// list the points of a vector layer as `x,y,cat` lines
    fn export_points(&self, vector: &str) -> Result<String, EngineError>;
}

/// Select the engine from its configured name
pub fn load_engine(config: &EngineConfig) -> Result<GrassEngine, ConfigErrors> {
    match config.name.to_lowercase().as_str() {
        "grass" => Ok(GrassEngine::load(config)),
        _ => Err(ConfigErrors::UnsupportedEngine(config.name.clone())),
    }
}
