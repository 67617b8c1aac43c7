use itertools::Itertools;
use std::collections::BTreeSet;
use thiserror::Error;

/// 1-based job identity, unique within a run
pub type JobId = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PointError {
    #[error("Malformed point listing at line {line}: {reason}")]
    MalformedInput { line: usize, reason: String },
}

/// An observer location and the identity of the job computing its viewshed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverPoint {
    pub x: f64,
    pub y: f64,
    pub job_id: JobId,
}

/// Parse `x,y,jobId` lines into observer points ordered by job id.
/// Blank lines are skipped, duplicated job ids are rejected.
pub fn parse_points(listing: &str) -> Result<Vec<ObserverPoint>, PointError> {
    let mut seen = BTreeSet::new();
    let mut points = Vec::new();

    for (index, line) in listing.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let malformed = |reason| PointError::MalformedInput {
            line: index + 1,
            reason,
        };
        let point = parse_line(line).map_err(malformed)?;

        if !seen.insert(point.job_id) {
            return Err(malformed(format!(
                "jobId {} is used more than once",
                point.job_id
            )));
        }

        points.push(point);
    }

    points.sort_by_key(|point| point.job_id);

    Ok(points)
}

fn parse_line(line: &str) -> Result<ObserverPoint, String> {
    let fields = line.split(',').map(str::trim).collect_vec();

    let [x, y, job_id] = fields.as_slice() else {
        return Err(format!(
            "expected 3 fields (x,y,jobId) but found {} in {line:?}",
            fields.len()
        ));
    };

    Ok(ObserverPoint {
        x: parse_coordinate("x", x)?,
        y: parse_coordinate("y", y)?,
        job_id: job_id
            .parse::<JobId>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| format!("jobId {job_id:?} is not a positive integer"))?,
    })
}

fn parse_coordinate(axis: &str, value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| format!("{axis} coordinate {value:?} is not a number"))
}
