use crate::{
    engine::{EngineError, TerrainEngine, Termination, VISIBLE_CATEGORY},
    launcher::{JobHandle, JobStatus},
    points::JobId,
};
use itertools::Itertools;
use std::{
    fmt, thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {job_id} ended with {termination}")]
    ComputationFailed {
        job_id: JobId,
        termination: Termination,
    },
    #[error("Artifact of job {job_id} did not appear after {attempts} checks in {elapsed:?}")]
    ArtifactTimeout {
        job_id: JobId,
        attempts: u32,
        elapsed: Duration,
    },
    #[error("Summary of job {job_id} is unusable: {reason}")]
    ResultParse { job_id: JobId, reason: String },
    #[error("Engine query for job {job_id} failed")]
    Engine {
        job_id: JobId,
        #[source]
        source: EngineError,
    },
}

impl JobError {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::ComputationFailed { job_id, .. }
            | Self::ArtifactTimeout { job_id, .. }
            | Self::ResultParse { job_id, .. }
            | Self::Engine { job_id, .. } => *job_id,
        }
    }
}

/// Failures of every job that could not be resolved
#[derive(Debug)]
pub struct JobFailures(pub Vec<JobError>);

impl JobFailures {
    pub fn job_ids(&self) -> Vec<JobId> {
        self.0.iter().map(JobError::job_id).collect_vec()
    }
}

impl fmt::Display for JobFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join("; "))
    }
}

impl std::error::Error for JobFailures {}

/// Visible cell count of one observer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityResult {
    pub job_id: JobId,
    pub x: f64,
    pub y: f64,
    pub visible_cells: u64,
}

/// Bound on how long an artifact is waited for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32, elapsed: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            interval: Duration::from_millis(50),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Evaluate `check` until it reports true or the policy is exhausted.
    /// The check runs at least once.
    pub fn poll<E>(&self, mut check: impl FnMut() -> Result<bool, E>) -> Result<PollOutcome, E> {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            if check()? {
                return Ok(PollOutcome::Ready { attempts });
            }

            let elapsed = start.elapsed();
            let out_of_time = self
                .timeout
                .map_or(false, |timeout| elapsed + self.interval > timeout);

            if attempts >= self.max_attempts.max(1) || out_of_time {
                return Ok(PollOutcome::Exhausted { attempts, elapsed });
            }

            thread::sleep(self.interval);
        }
    }
}

/// Turns terminated jobs into visibility results, one job at a time in job id order
pub struct CompletionPoller<'e, E: TerrainEngine> {
    engine: &'e E,
    policy: RetryPolicy,
}

impl<'e, E: TerrainEngine> CompletionPoller<'e, E> {
    pub fn new(engine: &'e E, policy: RetryPolicy) -> Self {
        Self { engine, policy }
    }

    /// Resolve every handle, all failed jobs are reported together
    #[instrument(skip_all, fields(jobs = handles.len()))]
    pub fn collect(
        &self,
        handles: Vec<JobHandle<E::Process>>,
    ) -> Result<Vec<VisibilityResult>, JobFailures> {
        let total = handles.len();
        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (index, handle) in handles
            .into_iter()
            .sorted_by_key(|handle| handle.job_id())
            .enumerate()
        {
            match self.resolve(handle) {
                Ok(result) => results.push(result),
                Err(error) => {
                    warn!("{error}");
                    failures.push(error);
                }
            }

            info!("Done with {}/{total}", index + 1);
        }

        if failures.is_empty() {
            Ok(results)
        } else {
            Err(JobFailures(failures))
        }
    }

    /// Wait for the artifact of a single job and read its visible cell count
    pub fn resolve(&self, mut handle: JobHandle<E::Process>) -> Result<VisibilityResult, JobError> {
        let job_id = handle.job_id();
        let engine_error = |source| JobError::Engine { job_id, source };

        let termination = match handle.status() {
            JobStatus::Completed(termination) => termination,
            JobStatus::Running => handle.wait(None).map_err(engine_error)?,
        };

        if termination.success() {
            match self
                .policy
                .poll(|| self.engine.artifact_exists(job_id))
                .map_err(engine_error)?
            {
                PollOutcome::Ready { attempts } => {
                    debug!("Artifact of job {job_id} found after {attempts} checks")
                }
                PollOutcome::Exhausted { attempts, elapsed } => {
                    return Err(JobError::ArtifactTimeout {
                        job_id,
                        attempts,
                        elapsed,
                    })
                }
            }
        } else {
            // whatever carries the job's name was not written by a successful run
            return Err(JobError::ComputationFailed {
                job_id,
                termination,
            });
        }

        let report = self.engine.summarize(job_id).map_err(|error| match error {
            EngineError::Report(reason) => JobError::ResultParse {
                job_id,
                reason: reason.to_string(),
            },
            source => JobError::Engine { job_id, source },
        })?;

        let visible_cells = report.visible().ok_or_else(|| JobError::ResultParse {
            job_id,
            reason: format!("no {VISIBLE_CATEGORY:?} category in the report"),
        })?;

        let point = *handle.point();

        Ok(VisibilityResult {
            job_id,
            x: point.x,
            y: point.y,
            visible_cells,
        })
    }
}
