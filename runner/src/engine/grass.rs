use super::{
    artifact_name, Cleanup, EngineError, JobProcess, SummaryReport, TerrainEngine, Termination,
    POINT_LAYER,
};
use crate::{
    config::{EngineConfig, ViewshedParams},
    points::{JobId, ObserverPoint},
    poller::VisibilityResult,
};
use itertools::Itertools;
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    io::Write,
    process::{Child, Command, Output, Stdio},
    time::Duration,
};
use tracing::{debug, trace, warn};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

/// Runs GRASS GIS modules as child processes, either inside a session or through `exec`
#[derive(Debug, Clone)]
pub struct GrassEngine {
    exec: Vec<String>,
    overwrite: bool,
    grace: Duration,
}

/// A running r.viewshed
#[derive(Debug)]
pub struct GrassProcess {
    job_id: JobId,
    child: Child,
    grace: Duration,
}

impl GrassEngine {
    pub fn load(config: &EngineConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            overwrite: config.overwrite,
            grace: Duration::from_secs(config.termination_grace_secs),
        }
    }

    fn command(&self, module: &str) -> Command {
        match self.exec.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args).arg(module);
                command
            }
            None => Command::new(module),
        }
    }

    /// run a module to completion and return its stdout, a non-zero exit is an error
    fn run(&self, module: &str, args: &[String]) -> Result<String, EngineError> {
        let output = self.output(module, args)?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: module.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn output(&self, module: &str, args: &[String]) -> Result<Output, EngineError> {
        trace!("Running {module} {}", args.iter().join(" "));

        self.command(module)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| EngineError::Spawn {
                command: module.to_string(),
                source,
            })
    }

    fn viewshed_args(
        point: &ObserverPoint,
        surface: &str,
        params: &ViewshedParams,
    ) -> Vec<String> {
        vec![
            params.flags(),
            format!("input={surface}"),
            format!("output={}", artifact_name(point.job_id)),
            format!("coordinates={},{}", point.x, point.y),
            format!("observer_elevation={}", params.observer_elevation),
            format!("target_elevation={}", params.target_elevation),
            format!("max_distance={}", params.max_distance),
            format!("memory={}", params.memory),
            format!("refraction_coeff={}", params.refraction_coeff),
            "--overwrite".to_string(),
            "--quiet".to_string(),
        ]
    }
}

/// `g.findfile` prints `name='<map>'` on a hit and an empty name otherwise
fn found_name(findfile_output: &str) -> bool {
    findfile_output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("name="))
        .any(|name| !name.trim_matches(|c| c == '\'' || c == '"').is_empty())
}

fn points_table(results: &[VisibilityResult]) -> String {
    results
        .iter()
        .map(|result| format!("{},{},{}\n", result.x, result.y, result.visible_cells))
        .collect()
}

impl TerrainEngine for GrassEngine {
    type Process = GrassProcess;

    fn submit(
        &self,
        point: &ObserverPoint,
        surface: &str,
        params: &ViewshedParams,
    ) -> Result<Self::Process, EngineError> {
        let args = Self::viewshed_args(point, surface, params);
        trace!("Running r.viewshed {}", args.iter().join(" "));

        let child = self
            .command("r.viewshed")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: "r.viewshed".to_string(),
                source,
            })?;

        debug!(job = point.job_id, pid = child.id(), "Started r.viewshed");

        Ok(GrassProcess {
            job_id: point.job_id,
            child,
            grace: self.grace,
        })
    }

    fn artifact_exists(&self, job_id: JobId) -> Result<bool, EngineError> {
        // a miss exits with 1, so the status is not checked
        let output = self.output(
            "g.findfile",
            &[
                "element=cell".to_string(),
                format!("file={}", artifact_name(job_id)),
            ],
        )?;

        Ok(found_name(&String::from_utf8_lossy(&output.stdout)))
    }

    fn summarize(&self, job_id: JobId) -> Result<SummaryReport, EngineError> {
        let stats = self.run(
            "r.stats",
            &[
                "-c".to_string(),
                format!("input={}", artifact_name(job_id)),
                "--quiet".to_string(),
            ],
        )?;

        Ok(SummaryReport::parse(&stats)?)
    }

    fn rasterize(&self, results: &[VisibilityResult], output: &str) -> Result<(), EngineError> {
        let mut import = self
            .command("v.in.ascii")
            .args([
                "input=-".to_string(),
                format!("output={POINT_LAYER}"),
                "separator=comma".to_string(),
                "columns=x double precision,y double precision,num integer".to_string(),
                "x=1".to_string(),
                "y=2".to_string(),
                "--overwrite".to_string(),
                "--quiet".to_string(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: "v.in.ascii".to_string(),
                source,
            })?;

        let mut stdin = import.stdin.take().unwrap_or_log();
        stdin.write_all(points_table(results).as_bytes())?;
        // closing stdin marks the end of the point table
        drop(stdin);

        let imported = import.wait_with_output()?;
        if !imported.status.success() {
            return Err(EngineError::CommandFailed {
                command: "v.in.ascii".to_string(),
                status: imported.status,
                stderr: String::from_utf8_lossy(&imported.stderr).trim().to_string(),
            });
        }

        let mut args = vec![
            format!("input={POINT_LAYER}"),
            format!("output={output}"),
            "use=attr".to_string(),
            "attribute_column=num".to_string(),
            "--quiet".to_string(),
        ];
        if self.overwrite {
            args.push("--overwrite".to_string());
        }

        self.run("v.to.rast", &args).map(|_| ())
    }

    fn cleanup(&self, target: &Cleanup) -> Result<(), EngineError> {
        let args = match target {
            Cleanup::Rasters { pattern } => {
                vec!["type=raster".to_string(), format!("pattern={pattern}")]
            }
            Cleanup::Vector { name } => vec!["type=vector".to_string(), format!("name={name}")],
        };

        self.run(
            "g.remove",
            &[vec!["-f".to_string(), "--quiet".to_string()], args].concat(),
        )
        .map(|_| ())
    }

    fn export_points(&self, vector: &str) -> Result<String, EngineError> {
        self.run(
            "v.out.ascii",
            &[
                "-r".to_string(),
                format!("input={vector}"),
                "type=point".to_string(),
                "format=point".to_string(),
                "separator=,".to_string(),
                "--quiet".to_string(),
            ],
        )
    }
}

impl JobProcess for GrassProcess {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Termination>, EngineError> {
        Ok(match timeout {
            Some(timeout) => self.child.wait_timeout(timeout)?.map(Termination::from),
            None => Some(self.child.wait()?.into()),
        })
    }

    /// SIGTERM first so GRASS can remove its temporary files, SIGKILL after the grace period
    fn terminate(&mut self) -> Result<(), EngineError> {
        match kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            Ok(()) => {}
            // already reaped
            Err(Errno::ESRCH) => return Ok(()),
            Err(errno) => return Err(errno.into()),
        }

        if self.child.wait_timeout(self.grace)?.is_none() {
            warn!(
                job = self.job_id,
                "r.viewshed ignored SIGTERM for {:?}, killing it", self.grace
            );
            self.child.kill()?;
            self.child.wait()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_viewshed_invocation() {
        let params = ViewshedParams {
            curvature: true,
            ..ViewshedParams::default()
        };
        let point = ObserverPoint {
            x: 637500.5,
            y: 221750.0,
            job_id: 12,
        };

        assert_eq!(
            GrassEngine::viewshed_args(&point, "elevation", &params),
            [
                "-bc",
                "input=elevation",
                "output=tempViewshed12",
                "coordinates=637500.5,221750",
                "observer_elevation=1.75",
                "target_elevation=1.75",
                "max_distance=1000",
                "memory=500",
                "refraction_coeff=0.14286",
                "--overwrite",
                "--quiet",
            ]
        );
    }

    #[test]
    fn exec_prefix_wraps_modules() {
        let engine = GrassEngine::load(&EngineConfig {
            exec: vec![
                "grass".to_string(),
                "/data/mapset".to_string(),
                "--exec".to_string(),
            ],
            ..EngineConfig::default()
        });
        let command = engine.command("r.stats");

        assert_eq!(command.get_program(), "grass");
        assert_eq!(
            command.get_args().collect_vec(),
            ["/data/mapset", "--exec", "r.stats"]
        );
    }

    #[test]
    fn findfile_output_is_interpreted() {
        assert!(found_name(
            "name='tempViewshed1'\nmapset='user'\nfile='/data/user/cell/tempViewshed1'\n"
        ));
        assert!(!found_name("name=\nmapset=\nfile=\n"));
        assert!(!found_name("name=''\n"));
        assert!(!found_name(""));
    }

    #[test]
    fn point_table_carries_counts() {
        let results = [
            VisibilityResult {
                job_id: 1,
                x: 1.5,
                y: 2.0,
                visible_cells: 0,
            },
            VisibilityResult {
                job_id: 2,
                x: 3.0,
                y: 4.25,
                visible_cells: 812,
            },
        ];

        assert_eq!(points_table(&results), "1.5,2,0\n3,4.25,812\n");
    }
}
