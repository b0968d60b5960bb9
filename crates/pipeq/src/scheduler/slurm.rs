use std::path::Path;

use crate::model::Stage;
use crate::scheduler::common::{gb_to_mb, path_arg, run_command};
use crate::scheduler::{
    ActiveUnit, SchedulerAdapter, SchedulerFuture, SchedulerResult, UnitId, UnitState, command_dir,
};

pub struct SlurmAdapter;

impl SchedulerAdapter for SlurmAdapter {
    fn submit(&self, script: &Path, name: &str) -> SchedulerFuture<UnitId> {
        let script = script.to_path_buf();
        let name = name.to_string();

        Box::pin(async move {
            let workdir = command_dir(Some(&script));
            let script = path_arg(&script)?;
            let arguments = vec!["sbatch", "--parsable", "-J", &name, &script];
            let output = run_command("Slurm", arguments, &workdir).await?;
            log::debug!("Sbatch output: {output}");
            parse_submit_output(&output)
        })
    }

    fn list_active(&self, name_prefix: &str) -> SchedulerFuture<Vec<ActiveUnit>> {
        let name_prefix = name_prefix.to_string();

        Box::pin(async move {
            let arguments = vec!["squeue", "--noheader", "--me", "--format=%i|%j|%T"];
            let output = run_command("Slurm", arguments, &command_dir(None)).await?;
            Ok(parse_squeue_output(&output)?
                .into_iter()
                .filter(|unit| unit.name.starts_with(&name_prefix))
                .collect())
        })
    }

    fn delete(&self, ids: &[UnitId]) -> SchedulerFuture<()> {
        let ids = ids.to_vec();

        Box::pin(async move {
            let mut arguments = vec!["scancel"];
            arguments.extend(ids.iter().map(|id| id.as_str()));
            run_command("Slurm", arguments, &command_dir(None)).await?;
            Ok(())
        })
    }
}

pub fn unit_directives(stage: &Stage, stdout: &Path, stderr: &Path) -> Vec<String> {
    let mut directives = vec![
        format!("#SBATCH --mem={}M", gb_to_mb(stage.mem_hi_gb)),
        format!("#SBATCH --output={}", stdout.display()),
        format!("#SBATCH --error={}", stderr.display()),
    ];
    if let Some(queue) = &stage.queue {
        directives.push(format!("#SBATCH --partition={queue}"));
    }
    directives
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
fn parse_submit_output(output: &str) -> SchedulerResult<UnitId> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(';').next())
        .map(|id| id.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing job id in sbatch output\n{output}"))
}

fn parse_squeue_output(output: &str) -> SchedulerResult<Vec<ActiveUnit>> {
    output
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut items = line.splitn(3, '|');
            match (items.next(), items.next(), items.next()) {
                (Some(id), Some(name), Some(state)) => Ok(ActiveUnit {
                    id: id.to_string(),
                    name: name.to_string(),
                    state: match state {
                        "RUNNING" | "COMPLETING" => UnitState::Running,
                        _ => UnitState::Queued,
                    },
                }),
                _ => Err(anyhow::anyhow!("Invalid squeue line `{line}`")),
            }
        })
        .collect()
}
