use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use colored::Colorize;
use serde_json::Value;

use crate::client::output::outputs::{LogFile, Output};
use crate::marker::JsonMap;
use crate::model::ExecutionStatus;
use crate::projector::{ExperimentSnapshot, JobSnapshot};

pub struct CliOutput {
    color_policy: ColorChoice,
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_vertical_table(&self, rows: Vec<Vec<CellStruct>>) {
        let table = rows.table().separator(
            Separator::builder()
                .column(Some(Default::default()))
                .build(),
        );
        self.print_table(table);
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }
}

impl Output for CliOutput {
    fn print_experiment_status(&self, snapshot: &ExperimentSnapshot) {
        let rows = vec![
            vec!["Name".cell().bold(true), snapshot.name.as_str().cell()],
            vec![
                "Name code".cell().bold(true),
                snapshot.name_code.as_str().cell(),
            ],
            vec!["Status".cell().bold(true), status_to_cell(snapshot.status)],
            vec![
                "Declaration".cell().bold(true),
                snapshot.declaration.display().cell(),
            ],
            vec![
                "Started".cell().bold(true),
                stat_text(&snapshot.stats, "time_started").cell(),
            ],
            vec![
                "Finished".cell().bold(true),
                stat_text(&snapshot.stats, "time_finished").cell(),
            ],
        ];
        self.print_vertical_table(rows);

        let rows: Vec<_> = snapshot
            .stages
            .iter()
            .map(|stage| {
                let count = |statuses: &[ExecutionStatus]| {
                    stage
                        .jobs
                        .iter()
                        .filter(|job| statuses.contains(&job.status))
                        .count()
                        .cell()
                        .justify(Justify::Right)
                };
                vec![
                    stage.name.as_str().cell(),
                    status_to_cell(stage.status),
                    stage.jobs.len().cell().justify(Justify::Right),
                    count(&[ExecutionStatus::Waiting, ExecutionStatus::Submitted]),
                    count(&[ExecutionStatus::Running]),
                    count(&[ExecutionStatus::Success]),
                    count(&[ExecutionStatus::Error, ExecutionStatus::Killed]),
                    count(&[ExecutionStatus::Canceled]),
                ]
            })
            .collect();
        let header = vec![
            "Stage".cell().bold(true),
            "State".cell().bold(true),
            "Jobs".cell().bold(true),
            "Waiting".cell().bold(true),
            "Running".cell().bold(true),
            "Finished".cell().bold(true),
            "Failed".cell().bold(true),
            "Canceled".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);

        for stage in &snapshot.stages {
            for job in stage.jobs.iter().filter(|job| job.status.is_failure()) {
                println!(
                    "{} /{}/{} ({})",
                    "Failed job:".red().bold(),
                    stage.name,
                    job.name,
                    job.stderr_path.display()
                );
            }
        }
    }

    fn print_report_location(&self, url: &str) {
        println!("{:<30} {url}", "Report will be at:");
    }

    fn print_job_info(&self, stage: &str, job: &JobSnapshot) {
        println!("JOB \"/{stage}/{}\"", job.name);
        println!("--");
        println!("ENV:");
        for (key, value) in &job.env {
            println!("\t{key:10}: {value}");
        }
        println!("SCRIPT:");
        println!("{}", job.script);
    }

    fn print_logs(&self, logs: Vec<LogFile>) {
        for log in logs {
            print!("{}", log.content);
        }
    }

    fn print_error(&self, error: anyhow::Error) {
        eprintln!("{error:?}");
    }
}

fn stat_text(stats: &JsonMap, key: &str) -> String {
    match stats.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Null) | None => String::new(),
        Some(value) => value.to_string(),
    }
}

fn status_to_cell(status: ExecutionStatus) -> CellStruct {
    let color = match status {
        ExecutionStatus::Waiting => Color::Cyan,
        ExecutionStatus::Submitted => Color::Blue,
        ExecutionStatus::Running => Color::Yellow,
        ExecutionStatus::Success => Color::Green,
        ExecutionStatus::Error | ExecutionStatus::Killed => Color::Red,
        ExecutionStatus::Canceled => Color::Magenta,
    };
    status
        .as_str()
        .to_uppercase()
        .cell()
        .foreground_color(Some(color))
}
