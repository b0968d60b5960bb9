use std::path::Path;

use anyhow::Context;

use crate::model::Stage;
use crate::scheduler::common::{gb_to_mb, path_arg, run_command};
use crate::scheduler::{
    ActiveUnit, SchedulerAdapter, SchedulerFuture, SchedulerResult, UnitId, UnitState, command_dir,
};

pub struct PbsAdapter;

impl SchedulerAdapter for PbsAdapter {
    fn submit(&self, script: &Path, name: &str) -> SchedulerFuture<UnitId> {
        let script = script.to_path_buf();
        let name = name.to_string();

        Box::pin(async move {
            let workdir = command_dir(Some(&script));
            let script = path_arg(&script)?;
            let output = run_command("PBS", vec!["qsub", "-N", &name, &script], &workdir).await?;
            let id = output.lines().next().unwrap_or_default().trim();
            if id.is_empty() {
                anyhow::bail!("Missing job id in qsub output");
            }
            Ok(id.to_string())
        })
    }

    fn list_active(&self, name_prefix: &str) -> SchedulerFuture<Vec<ActiveUnit>> {
        let name_prefix = name_prefix.to_string();

        Box::pin(async move {
            let arguments = vec!["qstat", "-f", "-F", "json"];
            let output = run_command("PBS", arguments, &command_dir(None)).await?;
            Ok(parse_qstat_json(&output)?
                .into_iter()
                .filter(|unit| unit.name.starts_with(&name_prefix))
                .collect())
        })
    }

    fn delete(&self, ids: &[UnitId]) -> SchedulerFuture<()> {
        let ids = ids.to_vec();

        Box::pin(async move {
            let mut arguments = vec!["qdel"];
            arguments.extend(ids.iter().map(|id| id.as_str()));
            run_command("PBS", arguments, &command_dir(None)).await?;
            Ok(())
        })
    }
}

pub fn unit_directives(stage: &Stage, stdout: &Path, stderr: &Path) -> Vec<String> {
    let mut directives = vec![
        "#PBS -S /bin/bash".to_string(),
        format!("#PBS -l mem={}mb", gb_to_mb(stage.mem_hi_gb)),
        format!("#PBS -o {}", stdout.display()),
        format!("#PBS -e {}", stderr.display()),
    ];
    if let Some(queue) = &stage.queue {
        directives.push(format!("#PBS -q {queue}"));
    }
    directives
}

fn parse_qstat_json(output: &str) -> SchedulerResult<Vec<ActiveUnit>> {
    let data: serde_json::Value =
        serde_json::from_str(output).context("Cannot parse qstat JSON output")?;

    // Without any jobs, the `Jobs` key is missing completely
    let Some(jobs) = data["Jobs"].as_object() else {
        return Ok(vec![]);
    };

    let mut units = vec![];
    for (id, job) in jobs {
        let name = get_json_str(&job["Job_Name"], "Job name")?;
        let state = match get_json_str(&job["job_state"], "Job state")? {
            "F" | "X" => continue,
            "R" | "E" => UnitState::Running,
            _ => UnitState::Queued,
        };
        units.push(ActiveUnit {
            id: id.clone(),
            name: name.to_string(),
            state,
        });
    }
    Ok(units)
}

fn get_json_str<'a>(value: &'a serde_json::Value, context: &str) -> SchedulerResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("JSON key {} not found", context))
}
