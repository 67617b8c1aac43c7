use crate::{
    engine::{Cleanup, EngineError, TerrainEngine},
    points::{JobId, ObserverPoint},
    poller::VisibilityResult,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Expected {expected} results but collected {found}")]
    Incomplete { expected: usize, found: usize },
    #[error("Result for job {found} is out of order, expected job {expected}")]
    OutOfOrder { expected: JobId, found: JobId },
    #[error("Failed to rasterize the results into {output}")]
    Rasterize {
        output: String,
        #[source]
        source: EngineError,
    },
}

/// Burns the per-observer counts into the output raster and removes the run's artifacts
pub struct ResultAggregator<'e, E: TerrainEngine> {
    engine: &'e E,
}

impl<'e, E: TerrainEngine> ResultAggregator<'e, E> {
    pub fn new(engine: &'e E) -> Self {
        Self { engine }
    }

    /// every point has exactly one result and results follow the job order of `points`
    pub fn verify(
        points: &[ObserverPoint],
        results: &[VisibilityResult],
    ) -> Result<(), AggregateError> {
        if points.len() != results.len() {
            return Err(AggregateError::Incomplete {
                expected: points.len(),
                found: results.len(),
            });
        }

        match points
            .iter()
            .zip(results)
            .find(|(point, result)| point.job_id != result.job_id)
        {
            Some((point, result)) => Err(AggregateError::OutOfOrder {
                expected: point.job_id,
                found: result.job_id,
            }),
            None => Ok(()),
        }
    }

    pub fn finish(
        &self,
        points: &[ObserverPoint],
        results: &[VisibilityResult],
        output: &str,
    ) -> Result<(), AggregateError> {
        Self::verify(points, results)?;

        debug!("Rasterizing {} results into {output}", results.len());
        self.engine
            .rasterize(results, output)
            .map_err(|source| AggregateError::Rasterize {
                output: output.to_string(),
                source,
            })?;

        info!("Wrote {output}");

        Ok(())
    }

    /// Remove per-job artifacts and the point layer, failures are only logged
    pub fn cleanup(&self) {
        for target in Cleanup::run_artifacts() {
            match self.engine.cleanup(&target) {
                Ok(()) => debug!("Removed {target}"),
                Err(error) => warn!(error = ?error, "Failed to remove {target}"),
            }
        }
    }
}
