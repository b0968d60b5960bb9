use serde_json::json;

use crate::client::output::outputs::{LogFile, Output};
use crate::projector::{ExperimentSnapshot, JobSnapshot};

#[derive(Default)]
pub struct JsonOutput;

impl JsonOutput {
    fn print(&self, data: serde_json::Value) {
        println!("{data:#}");
    }
}

impl Output for JsonOutput {
    fn print_experiment_status(&self, snapshot: &ExperimentSnapshot) {
        let stages: Vec<_> = snapshot
            .stages
            .iter()
            .map(|stage| {
                json!({
                    "name": stage.name,
                    "status": stage.status,
                    "stats": stage.stats,
                    "jobs": stage.jobs.iter().map(|job| json!({
                        "name": job.name,
                        "status": job.status,
                        "stats": job.stats,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        self.print(json!({
            "name": snapshot.name,
            "name_code": snapshot.name_code,
            "status": snapshot.status,
            "stats": snapshot.stats,
            "stages": stages,
        }));
    }

    fn print_report_location(&self, url: &str) {
        self.print(json!({ "report": url }));
    }

    fn print_job_info(&self, stage: &str, job: &JobSnapshot) {
        self.print(json!({
            "stage": stage,
            "job": job,
        }));
    }

    fn print_logs(&self, logs: Vec<LogFile>) {
        self.print(json!(logs));
    }

    fn print_error(&self, error: anyhow::Error) {
        self.print(json!({ "error": format!("{error:?}") }));
    }
}
