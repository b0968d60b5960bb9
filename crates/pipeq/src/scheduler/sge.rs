use std::path::Path;

use crate::model::Stage;
use crate::scheduler::common::{path_arg, run_command};
use crate::scheduler::{
    ActiveUnit, SchedulerAdapter, SchedulerFuture, SchedulerResult, UnitId, UnitState, command_dir,
};

/// Sun/Oracle Grid Engine through `qsub`, `qstat -xml` and `qdel`.
pub struct SgeAdapter;

impl SchedulerAdapter for SgeAdapter {
    fn submit(&self, script: &Path, name: &str) -> SchedulerFuture<UnitId> {
        let script = script.to_path_buf();
        let name = name.to_string();

        Box::pin(async move {
            let workdir = command_dir(Some(&script));
            let script = path_arg(&script)?;
            let arguments = vec!["qsub", "-N", &name, "-terse", &script];
            let output = run_command("SGE", arguments, &workdir).await?;
            parse_submit_output(&output)
        })
    }

    fn list_active(&self, name_prefix: &str) -> SchedulerFuture<Vec<ActiveUnit>> {
        let name_prefix = name_prefix.to_string();

        Box::pin(async move {
            let output = run_command("SGE", vec!["qstat", "-xml"], &command_dir(None)).await?;
            Ok(parse_qstat_xml(&output)?
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
            run_command("SGE", arguments, &command_dir(None)).await?;
            Ok(())
        })
    }
}

pub fn unit_directives(stage: &Stage, stdout: &Path, stderr: &Path) -> Vec<String> {
    let mut directives = vec![
        "#$ -S /bin/bash".to_string(),
        format!("#$ -l mem_req={:.2}G", stage.mem_lo_gb),
        format!("#$ -l h_vmem={:.2}G", stage.mem_hi_gb),
        format!("#$ -o {}", stdout.display()),
        format!("#$ -e {}", stderr.display()),
    ];
    if let Some(queue) = &stage.queue {
        directives.push(format!("#$ -q {queue}"));
    }
    directives
}

/// `qsub -terse` prints the job id, array jobs are printed as `<id>.<range>`.
fn parse_submit_output(output: &str) -> SchedulerResult<UnitId> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .and_then(|line| line.split('.').next())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(|id| id.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing job id in qsub output\n{output}"))
}

fn parse_qstat_xml(output: &str) -> SchedulerResult<Vec<ActiveUnit>> {
    let mut units = vec![];
    for item in output.split("<job_list").skip(1) {
        let item = item.split("</job_list>").next().unwrap_or_default();
        let id = get_xml_value(item, "JB_job_number")?;
        let name = get_xml_value(item, "JB_name")?;
        let state = get_xml_value(item, "state")?;
        let state = if state.contains('r') || state.contains('t') {
            UnitState::Running
        } else {
            UnitState::Queued
        };
        units.push(ActiveUnit { id, name, state });
    }
    Ok(units)
}

fn get_xml_value(item: &str, tag: &str) -> SchedulerResult<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = item
        .find(&open)
        .map(|start| start + open.len())
        .ok_or_else(|| anyhow::anyhow!("Missing key {tag} in qstat output"))?;
    let end = item[start..]
        .find(&close)
        .ok_or_else(|| anyhow::anyhow!("Unterminated key {tag} in qstat output"))?;
    Ok(unescape_xml(item[start..start + end].trim()))
}

/// Decodes predefined entities and numeric character references, unknown entities are kept.
fn unescape_xml(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('&') {
        result.push_str(&rest[..start]);
        rest = &rest[start..];
        let decoded = rest.find(';').and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let hex = entity
                        .strip_prefix("#x")
                        .or_else(|| entity.strip_prefix("#X"));
                    let code = match hex {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => entity.strip_prefix('#').and_then(|dec| dec.parse().ok()),
                    };
                    code.and_then(char::from_u32)
                }
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                result.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                result.push('&');
                rest = &rest[1..];
            }
        }
    }
    result.push_str(rest);
    result
}
