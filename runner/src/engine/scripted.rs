//! In-memory engine for exercising the scheduler without GRASS.

use super::{
    Cleanup, EngineError, JobProcess, SummaryReport, TerrainEngine, Termination, ARTIFACT_PREFIX,
};
use crate::{
    config::ViewshedParams,
    points::{JobId, ObserverPoint},
    poller::VisibilityResult,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Submitted(JobId),
    Terminated(JobId),
    Cancelled(JobId),
    /// every per-job raster was removed
    RemovedArtifacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// visible after the given number of unsuccessful existence checks
    AppearsAfter(u32),
    Never,
}

#[derive(Debug, Clone)]
pub struct JobScript {
    pub duration: Duration,
    pub termination: Termination,
    pub artifact: Artifact,
    /// `None` reports `job_id * 10` visible cells
    pub report: Option<SummaryReport>,
}

impl Default for JobScript {
    fn default() -> Self {
        Self {
            duration: Duration::ZERO,
            termination: Termination::Success,
            artifact: Artifact::AppearsAfter(0),
            report: None,
        }
    }
}

impl JobScript {
    pub fn lasting(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct State {
    running: usize,
    max_running: usize,
    events: Vec<Event>,
    checks: BTreeMap<JobId, u32>,
    submitted: BTreeSet<JobId>,
    removed: bool,
    rasterized: Option<(String, Vec<VisibilityResult>)>,
    cleanups: Vec<Cleanup>,
}

impl State {
    fn finish(&mut self, event: Event) {
        self.running -= 1;
        self.events.push(event);
    }
}

#[derive(Debug, Default)]
pub struct ScriptedEngine {
    default_script: JobScript,
    scripts: BTreeMap<JobId, JobScript>,
    failing_submission: Option<JobId>,
    failing_rasterize: bool,
    failing_cleanup: bool,
    listing: String,
    state: Arc<Mutex<State>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_script(mut self, script: JobScript) -> Self {
        self.default_script = script;
        self
    }

    pub fn with_script(mut self, job_id: JobId, script: JobScript) -> Self {
        self.scripts.insert(job_id, script);
        self
    }

    pub fn with_listing(mut self, listing: &str) -> Self {
        self.listing = listing.to_string();
        self
    }

    pub fn failing_submission(mut self, job_id: JobId) -> Self {
        self.failing_submission = Some(job_id);
        self
    }

    pub fn failing_rasterize(mut self) -> Self {
        self.failing_rasterize = true;
        self
    }

    pub fn failing_cleanup(mut self) -> Self {
        self.failing_cleanup = true;
        self
    }

    fn script(&self, job_id: JobId) -> &JobScript {
        self.scripts.get(&job_id).unwrap_or(&self.default_script)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn max_running(&self) -> usize {
        self.state.lock().max_running
    }

    pub fn checks(&self, job_id: JobId) -> u32 {
        self.state.lock().checks.get(&job_id).copied().unwrap_or(0)
    }

    pub fn rasterized(&self) -> Option<(String, Vec<VisibilityResult>)> {
        self.state.lock().rasterized.clone()
    }

    pub fn cleanups(&self) -> Vec<Cleanup> {
        self.state.lock().cleanups.clone()
    }
}

#[derive(Debug)]
pub struct ScriptedProcess {
    job_id: JobId,
    deadline: Instant,
    termination: Termination,
    done: bool,
    state: Arc<Mutex<State>>,
}

impl JobProcess for ScriptedProcess {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Termination>, EngineError> {
        if self.done {
            return Ok(Some(self.termination));
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());

        match timeout {
            Some(timeout) if timeout < remaining => {
                thread::sleep(timeout);
                Ok(None)
            }
            _ => {
                thread::sleep(remaining);
                self.done = true;
                self.state.lock().finish(Event::Terminated(self.job_id));
                Ok(Some(self.termination))
            }
        }
    }

    fn terminate(&mut self) -> Result<(), EngineError> {
        if !self.done {
            self.done = true;
            self.state.lock().finish(Event::Cancelled(self.job_id));
        }

        Ok(())
    }
}

impl TerrainEngine for ScriptedEngine {
    type Process = ScriptedProcess;

    fn submit(
        &self,
        point: &ObserverPoint,
        _surface: &str,
        _params: &ViewshedParams,
    ) -> Result<Self::Process, EngineError> {
        if self.failing_submission == Some(point.job_id) {
            return Err(EngineError::Unavailable(format!(
                "refusing job {}",
                point.job_id
            )));
        }

        let script = self.script(point.job_id);
        let mut state = self.state.lock();
        state.running += 1;
        state.max_running = state.max_running.max(state.running);
        state.submitted.insert(point.job_id);
        state.removed = false;
        state.events.push(Event::Submitted(point.job_id));

        Ok(ScriptedProcess {
            job_id: point.job_id,
            deadline: Instant::now() + script.duration,
            termination: script.termination,
            done: false,
            state: self.state.clone(),
        })
    }

    fn artifact_exists(&self, job_id: JobId) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        let checks = state.checks.entry(job_id).or_insert(0);
        *checks += 1;
        let checks = *checks;

        if state.removed || !state.submitted.contains(&job_id) {
            return Ok(false);
        }

        Ok(match self.script(job_id).artifact {
            Artifact::AppearsAfter(misses) => checks > misses,
            Artifact::Never => false,
        })
    }

    fn summarize(&self, job_id: JobId) -> Result<SummaryReport, EngineError> {
        Ok(self.script(job_id).report.clone().unwrap_or_else(|| {
            SummaryReport::default()
                .with_count("0", 1000)
                .with_count("1", job_id as u64 * 10)
        }))
    }

    fn rasterize(&self, results: &[VisibilityResult], output: &str) -> Result<(), EngineError> {
        if self.failing_rasterize {
            return Err(EngineError::Unavailable("rasterizer offline".to_string()));
        }

        self.state.lock().rasterized = Some((output.to_string(), results.to_vec()));

        Ok(())
    }

    fn cleanup(&self, target: &Cleanup) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.cleanups.push(target.clone());

        if self.failing_cleanup {
            return Err(EngineError::Unavailable(format!("cannot remove {target}")));
        }

        if let Cleanup::Rasters { pattern } = target {
            if pattern.starts_with(ARTIFACT_PREFIX) {
                state.removed = true;
                state.events.push(Event::RemovedArtifacts);
            }
        }

        Ok(())
    }

    fn export_points(&self, _vector: &str) -> Result<String, EngineError> {
        Ok(self.listing.clone())
    }
}
