//! Read-only snapshot of an experiment for reports and status views.
//!
//! The snapshot combines the model with data decoded from job logs. Logs that do not exist yet
//! are treated as empty.
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::Map;
use crate::batch::stage_batches;
use crate::common::config::Config;
use crate::common::error::PipeqError;
use crate::common::utils::str::truncate_head_tail;
use crate::common::utils::time::now_unix;
use crate::marker::{self, JsonMap};
use crate::model::{EnvMap, ExecutionStatus, Experiment, Job, Stage, aggregate_status};
use crate::rundir::{RunDir, read_or_empty};

#[derive(Serialize, Debug, Clone)]
pub struct JobSnapshot {
    pub name: String,
    pub status: ExecutionStatus,
    /// Truncated to the configured maximum size.
    pub stdout: String,
    pub stdout_path: PathBuf,
    pub stderr: String,
    pub stderr_path: PathBuf,
    pub script: String,
    pub script_path: PathBuf,
    pub env: Map<String, String>,
    pub environ: JsonMap,
    pub stats: JsonMap,
    pub results: Vec<JsonMap>,
}

#[derive(Serialize, Debug, Clone)]
pub struct StageSnapshot {
    pub name: String,
    pub status: ExecutionStatus,
    pub env: Map<String, String>,
    /// Logs of all units of the stage, each preceded by a `#BATCH` header.
    pub stdout: String,
    pub stderr: String,
    pub script: String,
    pub stats: JsonMap,
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ExperimentSnapshot {
    pub name: String,
    pub name_code: String,
    pub status: ExecutionStatus,
    pub declaration: PathBuf,
    pub stdout: String,
    pub stdout_path: PathBuf,
    pub stderr: String,
    pub stderr_path: PathBuf,
    pub environ: JsonMap,
    pub env: Map<String, String>,
    pub stats: JsonMap,
    pub stages: Vec<StageSnapshot>,
}

impl ExperimentSnapshot {
    pub fn stage(&self, name: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

/// Aggregate status for display.
///
/// Between two units of a throttled stage, its jobs are only `waiting` or `success`. Such a stage
/// is shown as `submitted`.
pub fn display_status<I>(statuses: I) -> crate::Result<ExecutionStatus>
where
    I: IntoIterator<Item = ExecutionStatus> + Clone,
{
    match aggregate_status(statuses.clone()) {
        Ok(status) => Ok(status),
        Err(error @ PipeqError::InconsistentState(_)) => {
            if statuses
                .into_iter()
                .all(|status| matches!(status, ExecutionStatus::Waiting | ExecutionStatus::Success))
            {
                Ok(ExecutionStatus::Submitted)
            } else {
                Err(error)
            }
        }
        Err(error) => Err(error),
    }
}

/// Rebuilds job statuses from logs, for readers that run outside of the orchestrator.
pub fn restore_statuses(experiment: &mut Experiment, run_dir: &RunDir) -> crate::Result<()> {
    for stage in experiment.stages.iter_mut() {
        for (job_idx, job) in stage.jobs.iter_mut().enumerate() {
            let stderr = read_or_empty(&run_dir.job_stderr(&stage.name, job_idx))?;
            if let Some(status) = marker::decode(&stderr).status {
                job.restore_status(status);
            }
        }
    }
    Ok(())
}

pub struct Projector<'a> {
    run_dir: &'a RunDir,
    config: &'a Config,
}

impl<'a> Projector<'a> {
    pub fn new(run_dir: &'a RunDir, config: &'a Config) -> Self {
        Self { run_dir, config }
    }

    pub fn snapshot(&self, experiment: &Experiment) -> crate::Result<ExperimentSnapshot> {
        let stages = experiment
            .stages
            .iter()
            .map(|stage| self.stage_snapshot(stage))
            .collect::<crate::Result<Vec<_>>>()?;
        let status = display_status(stages.iter().map(|stage| stage.status).collect::<Vec<_>>())?;

        let stdout_path = self.run_dir.experiment_stdout();
        let stderr_path = self.run_dir.experiment_stderr();
        let stderr = read_or_empty(&stderr_path)?;
        let record = marker::decode(&stderr);

        let mut stats = JsonMap::new();
        stats.insert(
            "experiment_root".to_string(),
            path_value(self.run_dir.directory()),
        );
        stats.insert("declaration".to_string(), path_value(&experiment.declaration));
        stats.insert(
            "name_code".to_string(),
            Value::String(experiment.name_code.clone()),
        );
        stats.insert(
            "argv_joined".to_string(),
            Value::String(
                std::env::args()
                    .map(|arg| {
                        if arg.contains(' ') {
                            format!("\"{arg}\"")
                        } else {
                            arg
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
        );
        for (key, value) in self.config.items()? {
            stats.insert(key, Value::String(value));
        }
        stats.extend(record.stats.clone());

        Ok(ExperimentSnapshot {
            name: experiment.name.clone(),
            name_code: experiment.name_code.clone(),
            status,
            declaration: experiment.declaration.clone(),
            stdout: read_or_empty(&stdout_path)?,
            stdout_path,
            stderr,
            stderr_path,
            environ: record.environ_or_empty(),
            env: self.config.env.clone(),
            stats,
            stages,
        })
    }

    fn stage_snapshot(&self, stage: &Stage) -> crate::Result<StageSnapshot> {
        let jobs = stage
            .jobs
            .iter()
            .enumerate()
            .map(|(job_idx, job)| self.job_snapshot(stage, job, job_idx))
            .collect::<crate::Result<Vec<_>>>()?;
        let status = display_status(stage.jobs.iter().map(|job| job.status()).collect::<Vec<_>>())?;

        let mut stdout = vec![];
        let mut stderr = vec![];
        let mut script = vec![];
        for unit in stage_batches(stage) {
            stdout.push(unit_section(
                unit.index,
                &self.run_dir.unit_stdout(&stage.name, unit.index),
            )?);
            stderr.push(unit_section(
                unit.index,
                &self.run_dir.unit_stderr(&stage.name, unit.index),
            )?);
            script.push(unit_section(
                unit.index,
                &self.run_dir.unit_script(&stage.name, unit.index),
            )?);
        }

        let mut stats = JsonMap::new();
        stats.insert("mem_lo_gb".to_string(), Value::from(stage.mem_lo_gb));
        stats.insert("mem_hi_gb".to_string(), Value::from(stage.mem_hi_gb));
        let wall_clock: Vec<f64> = jobs
            .iter()
            .filter(|job| job.status != ExecutionStatus::Running)
            .filter_map(|job| job.stats.get("time_wall_clock_seconds").and_then(Value::as_f64))
            .collect();
        if !wall_clock.is_empty() {
            stats.insert(
                "time_wall_clock_avg_seconds".to_string(),
                Value::from(wall_clock.iter().sum::<f64>() / wall_clock.len() as f64),
            );
        }

        Ok(StageSnapshot {
            name: stage.name.clone(),
            status,
            env: env_strings(&stage.env),
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            script: script.join("\n"),
            stats,
            jobs,
        })
    }

    fn job_snapshot(&self, stage: &Stage, job: &Job, job_idx: usize) -> crate::Result<JobSnapshot> {
        let stdout_path = self.run_dir.job_stdout(&stage.name, job_idx);
        let stderr_path = self.run_dir.job_stderr(&stage.name, job_idx);
        let script_path = self.run_dir.job_script(&stage.name, job_idx);

        let stdout = read_or_empty(&stdout_path)?;
        let stderr = read_or_empty(&stderr_path)?;
        let record = marker::decode(&stderr);

        let mut stats = record.stats.clone();
        if job.status() == ExecutionStatus::Running {
            if let Some(started) = record.stat_f64("time_started_unix") {
                let elapsed = (now_unix() - started).max(0.0) as u64;
                stats.insert("time_wall_clock_seconds".to_string(), Value::from(elapsed));
            }
        }

        let results = record
            .results
            .iter()
            .cloned()
            .map(load_result)
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(JobSnapshot {
            name: job.name.clone(),
            status: job.status(),
            stdout: truncate_head_tail(&stdout, self.config.max_stdout_size).into_owned(),
            stdout_path,
            stderr,
            stderr_path,
            script: read_or_empty(&script_path)?,
            script_path,
            env: env_strings(&job.env),
            environ: record.environ_or_empty(),
            stats,
            results,
        })
    }
}

fn unit_section(unit_idx: usize, path: &Path) -> crate::Result<String> {
    Ok(format!(
        "#BATCH #{unit_idx} ({})\n{}\n",
        path.display(),
        read_or_empty(path)?
    ))
}

/// Text results that only point to a file get the file content as their value.
fn load_result(mut result: JsonMap) -> crate::Result<JsonMap> {
    let is_text = result.get("type").and_then(Value::as_str) == Some("text");
    if is_text && result.get("value").is_none_or(Value::is_null) {
        if let Some(path) = result.get("path").and_then(Value::as_str) {
            let value = read_or_empty(Path::new(path))?;
            result.insert("value".to_string(), Value::String(value));
        }
    }
    Ok(result)
}

fn env_strings(env: &EnvMap) -> Map<String, String> {
    env.iter()
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect()
}

fn path_value(path: &Path) -> Value {
    Value::String(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use crate::common::config::Config;
    use crate::common::utils::time::mock_time::MockTime;
    use crate::marker::{MarkerAction, append_marker, encode};
    use crate::model::{ExecutionStatus, Experiment};
    use crate::projector::{Projector, display_status, restore_statuses};
    use crate::rundir::RunDir;
    use crate::tests::utils::{StageBuilder, experiment};

    struct Fixture {
        _tmp: tempfile::TempDir,
        run_dir: RunDir,
        experiment: Experiment,
        config: Config,
    }

    impl Fixture {
        fn new(stages: Vec<StageBuilder>) -> Self {
            let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
            let experiment = experiment(stages);
            let run_dir = RunDir::new(tmp.path(), &experiment.name_code);
            for stage in &experiment.stages {
                run_dir.create_stage_dirs(stage).unwrap();
            }
            Self {
                config: Config {
                    root: tmp.path().to_path_buf(),
                    max_stdout_size: 4,
                    ..Default::default()
                },
                _tmp: tmp,
                run_dir,
                experiment,
            }
        }

        fn append(&self, stage: &str, job_idx: usize, line: String) {
            let path = self.run_dir.job_stderr(stage, job_idx);
            let mut content = std::fs::read_to_string(&path).unwrap_or_default();
            content.push_str(&line);
            content.push('\n');
            std::fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_display_status() {
        use ExecutionStatus::*;
        assert_eq!(display_status(vec![Success, Waiting, Waiting]).unwrap(), Submitted);
        assert_eq!(display_status(vec![Success, Running]).unwrap(), Running);
        assert_eq!(display_status(Vec::new()).unwrap(), Success);
        assert!(display_status(vec![Canceled, Success]).is_err());
    }

    #[test]
    fn test_snapshot_without_logs() {
        let fixture = Fixture::new(vec![StageBuilder::default().name("a").jobs(2)]);
        let projector = Projector::new(&fixture.run_dir, &fixture.config);
        let snapshot = projector.snapshot(&fixture.experiment).unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Waiting);
        let stage = snapshot.stage("a").unwrap();
        assert_eq!(stage.jobs.len(), 2);
        assert_eq!(stage.jobs[0].stdout, "");
        assert!(stage.jobs[0].results.is_empty());
        assert!(stage.stdout.starts_with("#BATCH #0 ("));
        assert_eq!(stage.stats["mem_hi_gb"], json!(64.0));
        assert!(!stage.stats.contains_key("time_wall_clock_avg_seconds"));
        assert_eq!(snapshot.stats["config.manager"], json!("sge"));
    }

    #[test]
    fn test_restore_and_project_jobs() {
        let mut fixture = Fixture::new(vec![StageBuilder::default().name("a").jobs(3)]);
        let result_file = fixture.run_dir.directory().join("result.txt");
        std::fs::write(&result_file, "42").unwrap();

        fixture.append("a", 0, encode(MarkerAction::Status, &"success").unwrap());
        fixture.append(
            "a",
            0,
            encode(MarkerAction::Stats, &json!({"time_wall_clock_seconds": 10.0})).unwrap(),
        );
        fixture.append(
            "a",
            0,
            encode(MarkerAction::Results, &json!(result_file.display().to_string())).unwrap(),
        );
        fixture.append("a", 1, encode(MarkerAction::Status, &"error").unwrap());
        fixture.append(
            "a",
            1,
            encode(MarkerAction::Stats, &json!({"time_wall_clock_seconds": 20.0})).unwrap(),
        );
        fixture.append("a", 2, encode(MarkerAction::Status, &"running").unwrap());
        fixture.append(
            "a",
            2,
            encode(MarkerAction::Stats, &json!({"time_started_unix": 1000.0})).unwrap(),
        );
        std::fs::write(fixture.run_dir.job_stdout("a", 0), "abcdefghij").unwrap();

        let run_dir = fixture.run_dir.clone();
        restore_statuses(&mut fixture.experiment, &run_dir).unwrap();
        let _mock = MockTime::mock(1030.0);
        let projector = Projector::new(&fixture.run_dir, &fixture.config);
        let snapshot = projector.snapshot(&fixture.experiment).unwrap();
        let stage = &snapshot.stages[0];
        assert_eq!(stage.status, ExecutionStatus::Error);
        assert_eq!(snapshot.status, ExecutionStatus::Error);

        let jobs = &stage.jobs;
        assert_eq!(jobs[0].status, ExecutionStatus::Success);
        assert_eq!(jobs[0].stdout, "ab\n\n[6 characters skipped]\n\nij");
        assert_eq!(jobs[0].results[0]["name"], json!("result.txt"));
        assert_eq!(jobs[0].results[0]["value"], json!("42"));
        assert_eq!(jobs[2].stats["time_wall_clock_seconds"], json!(30));
        assert_eq!(stage.stats["time_wall_clock_avg_seconds"], json!(15.0));
    }

    #[test]
    fn test_experiment_markers() {
        let fixture = Fixture::new(vec![StageBuilder::default().name("a").jobs(1)]);
        let stderr = fixture.run_dir.experiment_stderr();
        append_marker(&stderr, MarkerAction::Stats, &json!({"time_started": "now"})).unwrap();
        append_marker(&stderr, MarkerAction::Environ, &json!({"USER": "pipeq"})).unwrap();

        let projector = Projector::new(&fixture.run_dir, &fixture.config);
        let snapshot = projector.snapshot(&fixture.experiment).unwrap();
        assert_eq!(snapshot.stats["time_started"], json!("now"));
        assert_eq!(snapshot.environ["USER"], json!("pipeq"));
        assert_eq!(
            snapshot.stats["experiment_root"],
            json!(fixture.run_dir.directory().display().to_string())
        );
        assert_eq!(snapshot.declaration, PathBuf::from("/work/pipeline.toml"));
    }
}
