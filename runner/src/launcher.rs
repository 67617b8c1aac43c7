use crate::{
    config::{Strategy, ViewshedParams},
    engine::{EngineError, JobProcess, TerrainEngine, Termination},
    points::{JobId, ObserverPoint},
};
use itertools::Itertools;
use parking_lot::Mutex;
use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// how long a pool worker blocks before checking whether the run was aborted
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to submit job {job_id}")]
    Submission {
        job_id: JobId,
        #[source]
        source: EngineError,
    },
    #[error("Failed to wait for job {job_id}")]
    Wait {
        job_id: JobId,
        #[source]
        source: EngineError,
    },
    #[error("Failed to build the worker pool")]
    Pool(#[from] ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed(Termination),
}

/// A submitted job, owned by the launcher until it has terminated
#[derive(Debug)]
pub struct JobHandle<P> {
    point: ObserverPoint,
    process: P,
    status: JobStatus,
}

impl<P: JobProcess> JobHandle<P> {
    pub fn new(point: ObserverPoint, process: P) -> Self {
        Self {
            point,
            process,
            status: JobStatus::Running,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.point.job_id
    }

    pub fn point(&self) -> &ObserverPoint {
        &self.point
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Block until the process terminated. A process outliving `timeout` is terminated.
    /// Once completed the cached termination is returned.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Termination, EngineError> {
        if let JobStatus::Completed(termination) = self.status {
            return Ok(termination);
        }

        match self.process.wait(timeout)? {
            Some(termination) => {
                self.status = JobStatus::Completed(termination);
                Ok(termination)
            }
            None => self.expire(),
        }
    }

    /// Block for at most `slice`, `Ok(None)` if the process is still running afterwards
    pub fn wait_for(&mut self, slice: Duration) -> Result<Option<Termination>, EngineError> {
        if let JobStatus::Completed(termination) = self.status {
            return Ok(Some(termination));
        }

        let termination = self.process.wait(Some(slice))?;
        if let Some(termination) = termination {
            self.status = JobStatus::Completed(termination);
        }

        Ok(termination)
    }

    /// terminate a job that ran out of time
    pub fn expire(&mut self) -> Result<Termination, EngineError> {
        warn!(job = self.job_id(), "Job exceeded its timeout, terminating");
        self.process.terminate()?;
        self.status = JobStatus::Completed(Termination::TimedOut);

        Ok(Termination::TimedOut)
    }

    /// terminate a running job, failures are only logged
    pub fn cancel(&mut self) {
        if self.status != JobStatus::Running {
            return;
        }

        match self.process.terminate() {
            Ok(()) => debug!(job = self.job_id(), "Cancelled job"),
            Err(error) => warn!(job = self.job_id(), error = ?error, "Failed to cancel job"),
        }

        self.status = JobStatus::Completed(Termination::Cancelled);
    }
}

/// Submits jobs to the engine while never keeping more than `workers` of them in flight
pub struct BoundedLauncher<'e, E: TerrainEngine> {
    engine: &'e E,
    surface: &'e str,
    params: &'e ViewshedParams,
    workers: usize,
    strategy: Strategy,
    job_timeout: Option<Duration>,
}

impl<'e, E: TerrainEngine> BoundedLauncher<'e, E> {
    pub fn new(
        engine: &'e E,
        surface: &'e str,
        params: &'e ViewshedParams,
        workers: usize,
    ) -> Self {
        Self {
            engine,
            surface,
            params,
            workers: workers.max(1),
            strategy: Strategy::default(),
            job_timeout: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// job ids grouped the way lockstep submission runs them
    pub fn batches(&self, points: &[ObserverPoint]) -> Vec<Vec<JobId>> {
        points
            .chunks(self.workers)
            .map(|batch| batch.iter().map(|point| point.job_id).collect_vec())
            .collect_vec()
    }

    /// Run every job to termination, handles are returned ordered by job id
    #[instrument(skip_all, fields(jobs = points.len(), workers = self.workers, strategy = ?self.strategy))]
    pub fn launch(&self, points: &[ObserverPoint]) -> Result<Vec<JobHandle<E::Process>>, LaunchError> {
        let launched = match self.strategy {
            Strategy::Lockstep => self.launch_lockstep(points)?,
            Strategy::Pool => self.launch_pool(points)?,
        };

        info!("All {} jobs terminated", launched.len());

        Ok(launched)
    }

    fn launch_lockstep(
        &self,
        points: &[ObserverPoint],
    ) -> Result<Vec<JobHandle<E::Process>>, LaunchError> {
        let mut launched = Vec::with_capacity(points.len());

        for (number, batch) in points.chunks(self.workers).enumerate() {
            debug!(
                "Submitting batch {} with jobs {:?}",
                number + 1,
                batch.iter().map(|point| point.job_id).collect_vec()
            );

            let mut in_flight = Vec::with_capacity(batch.len());

            for point in batch {
                match self.submit(point) {
                    Ok(handle) => in_flight.push(handle),
                    Err(error) => {
                        abort(&mut in_flight);
                        return Err(error);
                    }
                }
            }

            // the next batch may only start once every member of this one is gone
            for index in 0..in_flight.len() {
                if let Err(error) = self.wait(&mut in_flight[index]) {
                    abort(&mut in_flight);
                    return Err(error);
                }
            }

            launched.extend(in_flight);
        }

        Ok(launched)
    }

    fn launch_pool(
        &self,
        points: &[ObserverPoint],
    ) -> Result<Vec<JobHandle<E::Process>>, LaunchError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|index| format!("viewshed-worker-{index}"))
            .build()?;

        let launched = Mutex::new(Vec::with_capacity(points.len()));
        let failure = Mutex::new(None);
        let aborted = AtomicBool::new(false);

        // every worker holds at most one job, so the pool size is the ceiling
        pool.install(|| {
            points.par_iter().for_each(|point| {
                if aborted.load(Ordering::SeqCst) {
                    return;
                }

                let outcome = self.submit(point).and_then(|mut handle| {
                    let waited = self.wait_abortable(&mut handle, &aborted);
                    if waited.is_err() {
                        handle.cancel();
                    }
                    launched.lock().push(handle);
                    waited
                });

                if let Err(error) = outcome {
                    aborted.store(true, Ordering::SeqCst);
                    failure.lock().get_or_insert(error);
                }
            })
        });

        if let Some(error) = failure.into_inner() {
            return Err(error);
        }

        let mut launched = launched.into_inner();
        launched.sort_by_key(|handle| handle.job_id());

        Ok(launched)
    }

    fn submit(&self, point: &ObserverPoint) -> Result<JobHandle<E::Process>, LaunchError> {
        debug!(
            "Submitting job {} at ({}, {})",
            point.job_id, point.x, point.y
        );

        self.engine
            .submit(point, self.surface, self.params)
            .map(|process| JobHandle::new(*point, process))
            .map_err(|source| LaunchError::Submission {
                job_id: point.job_id,
                source,
            })
    }

    fn wait(&self, handle: &mut JobHandle<E::Process>) -> Result<(), LaunchError> {
        let termination = handle
            .wait(self.job_timeout)
            .map_err(|source| LaunchError::Wait {
                job_id: handle.job_id(),
                source,
            })?;

        log_termination(handle.job_id(), termination);

        Ok(())
    }

    /// Wait in slices so a job is cancelled once another worker aborted the run
    fn wait_abortable(
        &self,
        handle: &mut JobHandle<E::Process>,
        aborted: &AtomicBool,
    ) -> Result<(), LaunchError> {
        let job_id = handle.job_id();
        let wait_error = |source| LaunchError::Wait { job_id, source };
        let started = Instant::now();

        let termination = loop {
            if aborted.load(Ordering::SeqCst) {
                handle.cancel();
                return Ok(());
            }

            let slice = match self.job_timeout {
                Some(limit) => limit
                    .saturating_sub(started.elapsed())
                    .min(ABORT_CHECK_INTERVAL),
                None => ABORT_CHECK_INTERVAL,
            };

            if slice.is_zero() {
                break handle.expire().map_err(wait_error)?;
            }

            if let Some(termination) = handle.wait_for(slice).map_err(wait_error)? {
                break termination;
            }
        };

        log_termination(job_id, termination);

        Ok(())
    }
}

fn log_termination(job_id: JobId, termination: Termination) {
    if termination.success() {
        debug!("Job {job_id} terminated");
    } else {
        warn!("Job {job_id} terminated with {termination}");
    }
}

/// stop every job of an unfinished batch
fn abort<P: JobProcess>(in_flight: &mut [JobHandle<P>]) {
    for handle in in_flight.iter_mut() {
        handle.cancel();
    }
}
