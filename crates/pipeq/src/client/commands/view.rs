//! Read-only views of an experiment, usable while it is being run by another process.
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::batch::stage_batches;
use crate::client::globalsettings::GlobalSettings;
use crate::client::output::outputs::LogFile;
use crate::common::config::Config;
use crate::model::Experiment;
use crate::model::declaration::load_experiment;
use crate::projector::{ExperimentSnapshot, Projector, restore_statuses};
use crate::report::write_reports;
use crate::rundir::{RunDir, read_or_empty};

#[derive(Parser)]
pub struct ViewOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,
}

#[derive(Parser)]
pub struct LogOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,

    /// `/` for the experiment, `/<stage>` for its units or `/<stage>/<job>` for a job
    #[arg(long, value_parser = XPath::from_str)]
    pub xpath: XPath,

    /// Print only stdout logs
    #[arg(long, conflicts_with("stderr"))]
    pub stdout: bool,

    /// Print only stderr logs
    #[arg(long)]
    pub stderr: bool,
}

#[derive(Parser)]
pub struct InfoOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,

    /// Job in the form `/<stage>/<job>`
    #[arg(long, value_parser = XPath::from_str)]
    pub xpath: XPath,
}

/// Address of a part of an experiment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XPath {
    Experiment,
    Stage(String),
    Job { stage: String, job: String },
}

impl FromStr for XPath {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some(path) = value.strip_prefix('/') else {
            anyhow::bail!("XPath has to start with `/`, got `{value}`");
        };
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Ok(XPath::Experiment);
        }
        Ok(match path.split_once('/') {
            Some((stage, job)) => XPath::Job {
                stage: stage.to_string(),
                job: job.to_string(),
            },
            None => XPath::Stage(path.to_string()),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogSelection {
    pub stdout: bool,
    pub stderr: bool,
}

/// Paths of the logs addressed by `xpath`, stdout before stderr for every item.
pub fn log_paths(
    experiment: &Experiment,
    run_dir: &RunDir,
    xpath: &XPath,
    selection: LogSelection,
) -> anyhow::Result<Vec<PathBuf>> {
    let pairs = match xpath {
        XPath::Experiment => vec![(run_dir.experiment_stdout(), run_dir.experiment_stderr())],
        XPath::Stage(name) => {
            let stage = experiment
                .stages
                .iter()
                .find(|stage| stage.name == *name)
                .ok_or_else(|| anyhow::anyhow!("Stage `{name}` not found"))?;
            stage_batches(stage)
                .iter()
                .map(|unit| {
                    (
                        run_dir.unit_stdout(&stage.name, unit.index),
                        run_dir.unit_stderr(&stage.name, unit.index),
                    )
                })
                .collect()
        }
        XPath::Job { stage, job } => {
            let job_idx = find_job(experiment, stage, job)?;
            vec![(run_dir.job_stdout(stage, job_idx), run_dir.job_stderr(stage, job_idx))]
        }
    };

    let mut paths = vec![];
    for (stdout, stderr) in pairs {
        if selection.stdout {
            paths.push(stdout);
        }
        if selection.stderr {
            paths.push(stderr);
        }
    }
    Ok(paths)
}

fn find_job(experiment: &Experiment, stage: &str, job: &str) -> anyhow::Result<usize> {
    experiment
        .stages
        .iter()
        .find(|s| s.name == stage)
        .and_then(|s| s.jobs.iter().position(|j| j.name == job))
        .ok_or_else(|| anyhow::anyhow!("Job `/{stage}/{job}` not found"))
}

/// Loads the experiment and rebuilds its job statuses from logs.
fn load_snapshot(
    config: &Config,
    declaration: &std::path::Path,
) -> anyhow::Result<(Experiment, RunDir, ExperimentSnapshot)> {
    let mut experiment = load_experiment(declaration, config)?;
    let run_dir = RunDir::for_experiment(&config.root, &experiment);
    restore_statuses(&mut experiment, &run_dir)?;
    let snapshot = Projector::new(&run_dir, config).snapshot(&experiment)?;
    Ok((experiment, run_dir, snapshot))
}

pub fn command_html(gsettings: &GlobalSettings, opts: ViewOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let (experiment, _, snapshot) = load_snapshot(config, &opts.declaration)?;
    write_reports(config, &snapshot)?;
    gsettings
        .printer()
        .print_report_location(&config.report_url(&experiment.name_code));
    Ok(())
}

pub fn command_status(gsettings: &GlobalSettings, opts: ViewOpts) -> anyhow::Result<()> {
    let (_, _, snapshot) = load_snapshot(gsettings.config(), &opts.declaration)?;
    gsettings.printer().print_experiment_status(&snapshot);
    Ok(())
}

pub fn command_log(gsettings: &GlobalSettings, opts: LogOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let experiment = load_experiment(&opts.declaration, config)?;
    let run_dir = RunDir::for_experiment(&config.root, &experiment);
    let selection = LogSelection {
        stdout: !opts.stderr,
        stderr: !opts.stdout,
    };
    let logs = log_paths(&experiment, &run_dir, &opts.xpath, selection)?
        .into_iter()
        .map(|path| {
            let content = read_or_empty(&path)?;
            Ok(LogFile { path, content })
        })
        .collect::<crate::Result<Vec<_>>>()?;
    gsettings.printer().print_logs(logs);
    Ok(())
}

pub fn command_info(gsettings: &GlobalSettings, opts: InfoOpts) -> anyhow::Result<()> {
    let XPath::Job { stage, job } = &opts.xpath else {
        anyhow::bail!("Info is available only for jobs, use `/<stage>/<job>`");
    };
    let (experiment, _, snapshot) = load_snapshot(gsettings.config(), &opts.declaration)?;
    let job_idx = find_job(&experiment, stage, job)?;
    let job = snapshot
        .stage(stage)
        .map(|stage| &stage.jobs[job_idx])
        .ok_or_else(|| anyhow::anyhow!("Stage `{stage}` not found"))?;
    gsettings.printer().print_job_info(stage, job);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::str::FromStr;

    use crate::client::commands::view::{LogSelection, XPath, log_paths};
    use crate::rundir::RunDir;
    use crate::tests::utils::{StageBuilder, experiment};

    const BOTH: LogSelection = LogSelection {
        stdout: true,
        stderr: true,
    };

    #[test]
    fn test_parse_xpath() {
        assert_eq!(XPath::from_str("/").unwrap(), XPath::Experiment);
        assert_eq!(
            XPath::from_str("/prep").unwrap(),
            XPath::Stage("prep".to_string())
        );
        assert_eq!(
            XPath::from_str("/prep/").unwrap(),
            XPath::Stage("prep".to_string())
        );
        assert_eq!(
            XPath::from_str("/prep/a_1").unwrap(),
            XPath::Job {
                stage: "prep".to_string(),
                job: "a_1".to_string()
            }
        );
        assert!(XPath::from_str("prep").is_err());
    }

    #[test]
    fn test_log_paths() {
        let exp = experiment(vec![
            StageBuilder::default().name("prep").jobs(3).batch_size(2),
        ]);
        let run_dir = RunDir::new(&PathBuf::from("/r"), &exp.name_code);

        let paths = log_paths(&exp, &run_dir, &XPath::Experiment, BOTH).unwrap();
        assert_eq!(
            paths,
            vec![run_dir.experiment_stdout(), run_dir.experiment_stderr()]
        );

        let paths = log_paths(
            &exp,
            &run_dir,
            &XPath::Stage("prep".to_string()),
            LogSelection {
                stdout: false,
                stderr: true,
            },
        )
        .unwrap();
        assert_eq!(
            paths,
            vec![run_dir.unit_stderr("prep", 0), run_dir.unit_stderr("prep", 1)]
        );

        let job = XPath::Job {
            stage: "prep".to_string(),
            job: "2".to_string(),
        };
        let paths = log_paths(&exp, &run_dir, &job, BOTH).unwrap();
        assert_eq!(
            paths,
            vec![run_dir.job_stdout("prep", 2), run_dir.job_stderr("prep", 2)]
        );

        assert!(log_paths(&exp, &run_dir, &XPath::Stage("x".to_string()), BOTH).is_err());
        let missing = XPath::Job {
            stage: "prep".to_string(),
            job: "7".to_string(),
        };
        assert!(log_paths(&exp, &run_dir, &missing, BOTH).is_err());
    }
}
