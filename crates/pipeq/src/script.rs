//! Launch scripts of jobs and scheduler units.
//!
//! Scripts are described as a list of [`LaunchStep`]s and serialized deterministically.
//! A job script prepares the environment and runs the payload. A unit script checks the paths
//! used by each of its jobs and runs every job script through `pipeq wrap`, which emits the
//! markers of the job.
use std::path::{Path, PathBuf};

use crate::batch::{BatchUnit, stage_batches};
use crate::marker::{MarkerAction, encode, encode_status};
use crate::model::{Executable, Experiment, ExecutionStatus, Job, Stage};
use crate::rundir::RunDir;
use crate::scheduler::{ManagerType, unit_directives};

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchStep {
    Comment(String),
    /// Fails when `path` does not exist. With a `stderr` log, the failure is also reported
    /// through markers of the job.
    CheckPath {
        path: PathBuf,
        stderr: Option<PathBuf>,
    },
    Export {
        key: String,
        value: String,
    },
    Source(String),
    /// Prepends entries to a `:` separated variable, the first entry ends up last.
    PrependList {
        variable: String,
        entries: Vec<String>,
    },
    ChangeDir(PathBuf),
    Run(String),
    /// Runs a job script under the resource measuring wrapper.
    Wrapped {
        wrapper: PathBuf,
        strftime: String,
        stdout: PathBuf,
        stderr: PathBuf,
        script: PathBuf,
    },
}

impl LaunchStep {
    fn render(&self) -> crate::Result<Vec<String>> {
        let lines = match self {
            LaunchStep::Comment(text) => vec![format!("# {text}")],
            LaunchStep::CheckPath { path, stderr } => {
                let path = path.display().to_string();
                let message = format!("File \"{path}\" does not exist");
                match stderr {
                    None => vec![format!(
                        "if [ ! -e {} ]; then echo {} >&2; exit 1; fi",
                        double_quote(&path),
                        single_quote(&message)
                    )],
                    Some(stderr) => {
                        let stderr = double_quote(&stderr.display().to_string());
                        let stats = encode(
                            MarkerAction::Stats,
                            &serde_json::json!({ "validation_error": message }),
                        )?;
                        vec![
                            format!("if [ ! -e {} ]; then", double_quote(&path)),
                            format!("    echo {} >> {stderr}", single_quote(&stats)),
                            format!(
                                "    echo {} >> {stderr}",
                                single_quote(&encode_status(ExecutionStatus::Error))
                            ),
                            "    exit 1".to_string(),
                            "fi".to_string(),
                        ]
                    }
                }
            }
            LaunchStep::Export { key, value } => {
                vec![format!("export {key}={}", double_quote(value))]
            }
            LaunchStep::Source(source) => vec![format!("source {}", double_quote(source))],
            LaunchStep::PrependList { variable, entries } => {
                let mut entries = entries.clone();
                entries.reverse();
                vec![format!(
                    "export {variable}={}",
                    double_quote(&format!("{}:${variable}", entries.join(":")))
                )]
            }
            LaunchStep::ChangeDir(dir) => {
                vec![format!("cd {}", double_quote(&dir.display().to_string()))]
            }
            LaunchStep::Run(line) => vec![line.clone()],
            LaunchStep::Wrapped {
                wrapper,
                strftime,
                stdout,
                stderr,
                script,
            } => vec![format!(
                "{} wrap --strftime {} --stdout {} --stderr {} -- bash -e {}",
                double_quote(&wrapper.display().to_string()),
                single_quote(strftime),
                double_quote(&stdout.display().to_string()),
                double_quote(&stderr.display().to_string()),
                double_quote(&script.display().to_string()),
            )],
        };
        Ok(lines)
    }
}

pub fn render_steps(steps: &[LaunchStep]) -> crate::Result<Vec<String>> {
    let mut lines = vec![];
    for step in steps {
        lines.extend(step.render()?);
    }
    Ok(lines)
}

/// Double quotes keep `$VAR` expansion working.
fn double_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn shell_word(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        value.to_string()
    } else {
        single_quote(value)
    }
}

fn executable_line(executable: &Executable) -> String {
    match executable {
        Executable::Command { args } => args
            .iter()
            .map(|arg| shell_word(arg))
            .collect::<Vec<_>>()
            .join(" "),
        Executable::Script {
            interpreter,
            switches,
            script,
            args,
        } => [
            interpreter.clone(),
            switches.clone(),
            double_quote(&script.display().to_string()),
            args.clone(),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" "),
    }
}

fn job_header(stage: &Stage, job: &Job, job_idx: usize) -> LaunchStep {
    LaunchStep::Comment(format!(
        "stage.name = \"{}\", job.name = \"{}\", job_idx = {job_idx}",
        stage.name, job.name
    ))
}

fn path_checks(job: &Job, stderr: Option<&Path>) -> Vec<LaunchStep> {
    job.used_paths()
        .into_iter()
        .map(|used| LaunchStep::CheckPath {
            path: used.path,
            stderr: stderr.map(Path::to_path_buf),
        })
        .collect()
}

/// Environment preparation and payload of a job, without path checks.
pub fn job_steps(stage: &Stage, job: &Job, job_idx: usize) -> Vec<LaunchStep> {
    let mut steps = vec![job_header(stage, job, job_idx)];
    steps.extend(job.env.iter().map(|(key, value)| LaunchStep::Export {
        key: key.clone(),
        value: value.to_string(),
    }));
    steps.extend(stage.source.iter().rev().cloned().map(LaunchStep::Source));
    if !stage.path.is_empty() {
        steps.push(LaunchStep::PrependList {
            variable: "PATH".to_string(),
            entries: stage.path.clone(),
        });
    }
    if !stage.ld_library_path.is_empty() {
        steps.push(LaunchStep::PrependList {
            variable: "LD_LIBRARY_PATH".to_string(),
            entries: stage.ld_library_path.clone(),
        });
    }
    steps.push(LaunchStep::ChangeDir(job.cwd.clone()));
    steps.push(LaunchStep::Run(executable_line(&job.executable)));
    steps
}

pub fn render_job_script(stage: &Stage, job: &Job, job_idx: usize) -> crate::Result<String> {
    let mut lines = vec!["#!/bin/bash".to_string()];
    lines.extend(render_steps(&job_steps(stage, job, job_idx))?);
    Ok(lines.join("\n") + "\n")
}

/// Parameters of unit scripts that do not come from the experiment.
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    pub manager: ManagerType,
    /// The `pipeq` binary executed on compute nodes.
    pub wrapper: PathBuf,
    pub strftime: String,
}

pub fn unit_steps(
    options: &ScriptOptions,
    run_dir: &RunDir,
    stage: &Stage,
    unit: &BatchUnit,
) -> Vec<LaunchStep> {
    let mut steps = vec![];
    for job_idx in unit.jobs.clone() {
        let job = &stage.jobs[job_idx];
        let stderr = run_dir.job_stderr(&stage.name, job_idx);
        steps.push(job_header(stage, job, job_idx));
        steps.extend(path_checks(job, Some(&stderr)));
        steps.push(LaunchStep::Wrapped {
            wrapper: options.wrapper.clone(),
            strftime: options.strftime.clone(),
            stdout: run_dir.job_stdout(&stage.name, job_idx),
            stderr,
            script: run_dir.job_script(&stage.name, job_idx),
        });
    }
    steps
}

pub fn render_unit_script(
    options: &ScriptOptions,
    run_dir: &RunDir,
    stage: &Stage,
    unit: &BatchUnit,
) -> crate::Result<String> {
    let mut lines = vec!["#!/bin/bash".to_string()];
    lines.extend(unit_directives(
        options.manager,
        stage,
        &run_dir.unit_stdout(&stage.name, unit.index),
        &run_dir.unit_stderr(&stage.name, unit.index),
    ));
    lines.push(String::new());
    lines.extend(render_steps(&unit_steps(options, run_dir, stage, unit))?);
    Ok(lines.join("\n") + "\n")
}

/// A stand-alone script running every job in its own subshell, without any scheduler.
pub fn render_local_script(experiment: &Experiment) -> crate::Result<String> {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!(
            "# stand-alone script generated from \"{}\"",
            experiment.declaration.display()
        ),
        String::new(),
    ];
    for stage in &experiment.stages {
        for (job_idx, job) in stage.jobs.iter().enumerate() {
            let mut steps = job_steps(stage, job, job_idx);
            steps.splice(1..1, path_checks(job, None));
            lines.push("(".to_string());
            lines.extend(
                render_steps(&steps)?
                    .into_iter()
                    .map(|line| format!("\t{line}")),
            );
            lines.push(")".to_string());
            lines.push(String::new());
        }
    }
    Ok(lines.join("\n"))
}

/// Writes job and unit scripts of all stages and creates the requested output directories.
pub fn write_experiment(
    options: &ScriptOptions,
    run_dir: &RunDir,
    experiment: &Experiment,
) -> crate::Result<()> {
    create_output_dirs(experiment)?;
    for stage in &experiment.stages {
        run_dir.create_stage_dirs(stage)?;
        for (job_idx, job) in stage.jobs.iter().enumerate() {
            std::fs::write(
                run_dir.job_script(&stage.name, job_idx),
                render_job_script(stage, job, job_idx)?,
            )?;
        }
        for unit in stage_batches(stage) {
            std::fs::write(
                run_dir.unit_script(&stage.name, unit.index),
                render_unit_script(options, run_dir, stage, &unit)?,
            )?;
        }
    }
    Ok(())
}

/// Creates every used path declared with `mkdirs`.
pub fn create_output_dirs(experiment: &Experiment) -> crate::Result<()> {
    for path in experiment
        .stages
        .iter()
        .flat_map(|stage| stage.jobs.iter())
        .flat_map(|job| job.used_paths())
        .filter(|used| used.mkdirs && !used.path.exists())
    {
        log::debug!("Creating directory {}", path.path.display());
        std::fs::create_dir_all(&path.path)?;
    }
    Ok(())
}
