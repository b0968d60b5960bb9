//! Declared pipeline graph together with the mutable run-time status of its jobs.
//!
//! An [`Experiment`] is populated once (see [`declaration`]) and afterwards only the
//! [`ExecutionStatus`] of individual jobs changes.
pub mod declaration;
mod status;

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::error::PipeqError;

pub use status::{ExecutionStatus, aggregate_status};

/// A path referenced by a job. It has to exist before the job is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedPath {
    pub path: PathBuf,
    /// Create the directory while generating the experiment.
    #[serde(default)]
    pub mkdirs: bool,
}

impl UsedPath {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            mkdirs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Text(String),
    Path(UsedPath),
}

impl Display for EnvValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::Text(value) => f.write_str(value),
            EnvValue::Path(path) => write!(f, "{}", path.path.display()),
        }
    }
}

pub type EnvMap = Map<String, EnvValue>;

/// What a job actually executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Executable {
    /// Arbitrary command line, arguments are quoted for the shell.
    Command { args: Vec<String> },
    /// `<interpreter> <switches> "<script>" <args>`, the script is a used path.
    Script {
        interpreter: String,
        switches: String,
        script: PathBuf,
        args: String,
    },
}

impl Executable {
    pub fn bash<P: Into<PathBuf>>(script: P, args: &str) -> Self {
        Executable::Script {
            interpreter: "bash".to_string(),
            switches: String::new(),
            script: script.into(),
            args: args.to_string(),
        }
    }

    fn used_paths(&self) -> Vec<UsedPath> {
        match self {
            Executable::Command { .. } => vec![],
            Executable::Script { script, .. } => vec![UsedPath::new(script.clone())],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub executable: Executable,
    /// Stage environment merged with job-specific overrides.
    pub env: EnvMap,
    pub cwd: PathBuf,
    pub extra_paths: Vec<UsedPath>,
    status: ExecutionStatus,
}

impl Job {
    pub fn new(
        name: String,
        executable: Executable,
        env: EnvMap,
        cwd: PathBuf,
        extra_paths: Vec<UsedPath>,
    ) -> Self {
        Self {
            name,
            executable,
            env,
            cwd,
            extra_paths,
            status: ExecutionStatus::Waiting,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Moves the job to `status` if the state machine allows it.
    /// Returns `true` when the status has changed.
    pub fn update_status(&mut self, status: ExecutionStatus) -> bool {
        if self.status == status {
            return false;
        }
        if !self.status.can_transition_to(status) {
            log::debug!(
                "Ignoring transition of job {} from {} to {}",
                self.name,
                self.status,
                status
            );
            return false;
        }
        self.status = status;
        true
    }

    /// Sets the status without checking the state machine.
    /// Used when the state is rebuilt from logs by an out-of-band reader.
    pub fn restore_status(&mut self, status: ExecutionStatus) {
        self.status = status;
    }

    pub fn has_failed(&self) -> bool {
        self.status.is_failure()
    }

    /// Paths that have to exist before the job payload is started, in a stable order.
    pub fn used_paths(&self) -> Vec<UsedPath> {
        let mut paths: Vec<UsedPath> = self
            .env
            .values()
            .filter_map(|value| match value {
                EnvValue::Path(path) => Some(path.clone()),
                EnvValue::Text(_) => None,
            })
            .collect();
        paths.push(UsedPath::new(self.cwd.clone()));
        paths.extend(self.extra_paths.iter().cloned());
        paths.extend(self.executable.used_paths());
        paths
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub queue: Option<String>,
    pub parallel_jobs: u32,
    pub batch_size: u32,
    pub mem_lo_gb: f64,
    pub mem_hi_gb: f64,
    pub source: Vec<String>,
    pub path: Vec<String>,
    pub ld_library_path: Vec<String>,
    pub env: EnvMap,
    pub jobs: Vec<Job>,
}

impl Stage {
    /// Aggregate status, computed from the statuses of all jobs of the stage.
    pub fn aggregate_status(&self) -> crate::Result<ExecutionStatus> {
        aggregate_status(self.jobs.iter().map(|job| job.status()))
    }

    pub fn first_failed_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| job.has_failed())
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    pub name: String,
    /// Unique run identifier, used as a prefix of every scheduler unit name.
    pub name_code: String,
    /// Path of the declaration this experiment was built from.
    pub declaration: PathBuf,
    pub stages: Vec<Stage>,
}

impl Experiment {
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.jobs.len()).sum()
    }

    /// Cancels every job of the stages following `stage_idx`.
    ///
    /// Only stages that were never submitted can be canceled, so each affected job has to be
    /// `waiting` (or already `canceled`). Returns `(stage_idx, job_idx)` of every job that was
    /// changed.
    pub fn cancel_stages_after(&mut self, stage_idx: usize) -> crate::Result<Vec<(usize, usize)>> {
        let mut canceled = vec![];
        for (idx, stage) in self.stages.iter_mut().enumerate().skip(stage_idx + 1) {
            canceled.extend(cancel_stage(stage)?.into_iter().map(|job_idx| (idx, job_idx)));
        }
        Ok(canceled)
    }
}

/// Cancels all jobs of a stage that has not been submitted yet.
pub fn cancel_stage(stage: &mut Stage) -> crate::Result<Vec<usize>> {
    if let Some(job) = stage
        .jobs
        .iter()
        .find(|job| !matches!(job.status(), ExecutionStatus::Waiting | ExecutionStatus::Canceled))
    {
        return Err(PipeqError::InconsistentState(format!(
            "job {}/{} cannot be canceled from status {}",
            stage.name,
            job.name,
            job.status()
        )));
    }
    Ok(stage
        .jobs
        .iter_mut()
        .enumerate()
        .filter_map(|(idx, job)| job.update_status(ExecutionStatus::Canceled).then_some(idx))
        .collect())
}
