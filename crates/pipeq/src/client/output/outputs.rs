use std::path::PathBuf;

use serde::Serialize;

use crate::projector::{ExperimentSnapshot, JobSnapshot};

#[derive(clap::ValueEnum, Clone)]
pub enum Outputs {
    CLI,
    JSON,
}

/// Content of a single log file.
#[derive(Serialize, Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub content: String,
}

pub trait Output {
    // Experiment
    fn print_experiment_status(&self, snapshot: &ExperimentSnapshot);
    fn print_report_location(&self, url: &str);

    // Jobs
    fn print_job_info(&self, stage: &str, job: &JobSnapshot);

    // Logs
    fn print_logs(&self, logs: Vec<LogFile>);

    fn print_error(&self, error: anyhow::Error);
}
