use crate::{
    aggregator::{AggregateError, ResultAggregator},
    config::{ConfigErrors, RunConfig, Strategy, ViewshedParams},
    engine::TerrainEngine,
    launcher::{BoundedLauncher, LaunchError},
    points::{parse_points, JobId, ObserverPoint, PointError},
    poller::{CompletionPoller, JobFailures, RetryPolicy, VisibilityResult},
};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Points(#[from] PointError),
    #[error("The point listing contains no observers")]
    NoPoints,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Jobs {:?} failed", .0.job_ids())]
    JobsFailed(#[source] JobFailures),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// A total viewshed computation over one surface
pub struct ViewshedRun<'e, E: TerrainEngine> {
    engine: &'e E,
    surface: String,
    params: ViewshedParams,
    workers: usize,
    strategy: Strategy,
    job_timeout: Option<Duration>,
    policy: RetryPolicy,
}

impl<'e, E: TerrainEngine> ViewshedRun<'e, E> {
    pub fn new(
        engine: &'e E,
        surface: impl Into<String>,
        params: ViewshedParams,
        workers: usize,
    ) -> Self {
        Self {
            engine,
            surface: surface.into(),
            params,
            workers: workers.max(1),
            strategy: Strategy::default(),
            job_timeout: None,
            policy: RetryPolicy::default(),
        }
    }

    /// build a run from a config that passed `preflight_checks`
    pub fn from_config(engine: &'e E, config: &RunConfig) -> Result<Self, ConfigErrors> {
        let surface = config.input.dem.clone().ok_or(ConfigErrors::Invalid)?;

        Ok(Self::new(
            engine,
            surface,
            config.viewshed.clone(),
            config.executor.resolve_workers(),
        )
        .with_strategy(config.executor.strategy)
        .with_job_timeout(config.executor.job_timeout())
        .with_retry_policy(RetryPolicy::from(&config.poll)))
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn launcher(&self) -> BoundedLauncher<'_, E> {
        BoundedLauncher::new(self.engine, &self.surface, &self.params, self.workers)
            .with_strategy(self.strategy)
            .with_job_timeout(self.job_timeout)
    }

    /// Parse the listing and return the lockstep batches without submitting anything
    pub fn plan(&self, listing: &str) -> Result<Vec<Vec<JobId>>, RunError> {
        let points = Self::observers(listing)?;

        Ok(self.launcher().batches(&points))
    }

    /// Compute every viewshed of `listing` and rasterize the counts into `output`.
    /// Artifacts are removed before the first submission and again whether or not the run succeeds.
    #[instrument(skip_all, fields(surface = %self.surface, output = output))]
    pub fn execute(&self, listing: &str, output: &str) -> Result<Vec<VisibilityResult>, RunError> {
        let points = Self::observers(listing)?;
        info!(
            "Computing {} viewsheds with {} workers",
            points.len(),
            self.workers
        );

        let aggregator = ResultAggregator::new(self.engine);
        // leftovers of an earlier run must not be mistaken for this run's artifacts
        aggregator.cleanup();

        let outcome = self.process(&points, output, &aggregator);

        if let Err(ref error) = outcome {
            error!("Run failed, no output was written: {error}");
        }
        aggregator.cleanup();

        outcome
    }

    fn observers(listing: &str) -> Result<Vec<ObserverPoint>, RunError> {
        let points = parse_points(listing)?;

        if points.is_empty() {
            return Err(RunError::NoPoints);
        }

        Ok(points)
    }

    fn process(
        &self,
        points: &[ObserverPoint],
        output: &str,
        aggregator: &ResultAggregator<'_, E>,
    ) -> Result<Vec<VisibilityResult>, RunError> {
        let handles = self.launcher().launch(points)?;
        let results = CompletionPoller::new(self.engine, self.policy)
            .collect(handles)
            .map_err(RunError::JobsFailed)?;

        aggregator.finish(points, &results, output)?;

        Ok(results)
    }
}
