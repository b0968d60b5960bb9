use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use crate::TOOL_NAME;
use crate::client::globalsettings::GlobalSettings;
use crate::common::config::Config;
use crate::common::notify::{Failure, FailureNotifier};
use crate::common::tee::Tee;
use crate::common::utils::fs::remove_dir_if_exists;
use crate::common::utils::str::pluralize;
use crate::model::Experiment;
use crate::model::declaration::load_experiment;
use crate::orchestrator::{Orchestrator, RunOptions, RunOutput, active_units, stop};
use crate::report::write_experiment_report;
use crate::rundir::{LOG_DIR, RunDir};
use crate::scheduler::{SchedulerAdapter, create_adapter};
use crate::script::{ScriptOptions, create_output_dirs, render_local_script, write_experiment};

#[derive(Parser)]
pub struct GenOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,

    /// Stop units of a previous run of the experiment instead of failing
    #[arg(long)]
    pub force: bool,

    /// Write a single stand-alone script next to the declaration instead
    #[arg(long)]
    pub locally: bool,
}

#[derive(Parser)]
pub struct RunOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,

    /// Stop units of a previous run of the experiment instead of failing
    #[arg(long)]
    pub force: bool,

    /// Generate scripts and the report, but do not submit anything
    #[arg(long)]
    pub dry: bool,

    /// Print scheduler activity to the console
    #[arg(long)]
    pub verbose: bool,

    /// Run configured notification commands when the experiment finishes
    #[arg(long)]
    pub notify: bool,
}

#[derive(Parser)]
pub struct StopOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,
}

#[derive(Parser)]
pub struct CleanOpts {
    /// Path of the pipeline declaration
    pub declaration: PathBuf,
}

pub async fn command_gen(gsettings: &GlobalSettings, opts: GenOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let experiment = load_experiment(&opts.declaration, config)?;

    let path = if opts.locally {
        generate_locally(&experiment)?
    } else {
        let adapter = create_adapter(config.manager);
        let run_dir = generate(config, adapter.as_ref(), &experiment, opts.force).await?;
        run_dir.directory().to_path_buf()
    };
    println!("{:<30} {}", "Generating the experiment to:", path.display());
    Ok(())
}

pub async fn command_run(gsettings: &GlobalSettings, opts: RunOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let experiment = load_experiment(&opts.declaration, config)?;
    let adapter = create_adapter(config.manager);

    let run_dir = generate(config, adapter.as_ref(), &experiment, opts.force).await?;
    println!(
        "{:<30} {}",
        "Generating the experiment to:",
        run_dir.directory().display()
    );
    gsettings
        .printer()
        .print_report_location(&config.report_url(&experiment.name_code));
    write_experiment_report(config, &run_dir, &experiment)?;

    if opts.dry {
        println!("Dry run. Quitting.");
        return Ok(());
    }

    std::fs::create_dir_all(run_dir.directory().join(LOG_DIR))?;
    let output = RunOutput {
        stdout: Tee::append_to(
            &run_dir.experiment_stdout(),
            vec![Box::new(std::io::stdout())],
        )?,
        stderr: Tee::append_to(
            &run_dir.experiment_stderr(),
            vec![Box::new(std::io::stderr())],
        )?,
    };
    let options = RunOptions {
        poll_interval: config.sleep_between_queue_checks,
        verbose: opts.verbose,
        strftime: config.strftime.clone(),
    };

    let name_code = experiment.name_code.clone();
    let report_dir = run_dir.clone();
    let mut orchestrator =
        Orchestrator::new(experiment, adapter.as_ref(), run_dir, options, output)
            .with_observer(move |experiment: &Experiment| {
                write_experiment_report(config, &report_dir, experiment).map(|_| ())
            })
            .with_notifier(FailureNotifier::new(config, &name_code, opts.notify));

    let result = tokio::select! {
        result = orchestrator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!(
                "\nQuitting (Ctrl+C pressed). To stop jobs:\n\n{}\n",
                stop_command(&opts.declaration)
            );
            std::process::exit(130);
        }
    };

    match result {
        Ok(outcome) => match outcome.failure {
            None => Ok(()),
            Some(failure) => anyhow::bail!(
                "Experiment {name_code} failed in stage `{}`",
                failure.stage.unwrap_or_default()
            ),
        },
        Err(error) => {
            let failure = Failure {
                stage: orchestrator.current_stage().map(str::to_string),
                job: None,
                message: Some(format!("{error:?}")),
            };
            FailureNotifier::new(config, &name_code, opts.notify)
                .notify_error(&failure)
                .await;
            Err(error.into())
        }
    }
}

pub async fn command_stop(gsettings: &GlobalSettings, opts: StopOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let experiment = load_experiment(&opts.declaration, config)?;
    println!("Stopping the experiment \"{}\"...", experiment.name_code);

    let adapter = create_adapter(config.manager);
    let deleted = stop(
        adapter.as_ref(),
        &experiment.name_code,
        config.sleep_between_queue_checks,
    )
    .await;
    println!("Done. Deleted {deleted} {}.", pluralize("unit", deleted));
    Ok(())
}

pub fn command_clean(gsettings: &GlobalSettings, opts: CleanOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let experiment = load_experiment(&opts.declaration, config)?;
    let run_dir = RunDir::for_experiment(&config.root, &experiment);
    if remove_dir_if_exists(run_dir.directory())? {
        println!("Removed {}", run_dir.directory().display());
    } else {
        println!("Nothing to remove at {}", run_dir.directory().display());
    }
    Ok(())
}

/// Writes the scripts of `experiment` into a fresh run directory.
///
/// Fails when units of a previous run are still active, unless `force` is set, in which case
/// they are stopped first.
pub async fn generate(
    config: &Config,
    adapter: &dyn SchedulerAdapter,
    experiment: &Experiment,
    force: bool,
) -> anyhow::Result<RunDir> {
    let poll_interval = config.sleep_between_queue_checks;
    let active = active_units(adapter, &experiment.name_code, poll_interval).await;
    if !active.is_empty() {
        if !force {
            anyhow::bail!(
                "Please stop existing jobs for this experiment first. Add --force to the previous command or type:\n\n{}\n",
                stop_command(&experiment.declaration)
            );
        }
        log::info!(
            "Stopping {} active {} of a previous run",
            active.len(),
            pluralize("unit", active.len())
        );
        stop(adapter, &experiment.name_code, poll_interval).await;
    }

    let run_dir = RunDir::for_experiment(&config.root, experiment);
    if remove_dir_if_exists(run_dir.directory())? {
        log::debug!("Removed previous run {}", run_dir.directory().display());
    }
    let options = ScriptOptions {
        manager: config.manager,
        wrapper: config.wrapper_path()?,
        strftime: config.strftime.clone(),
    };
    write_experiment(&options, &run_dir, experiment)
        .with_context(|| format!("Cannot write {}", run_dir.directory().display()))?;
    Ok(run_dir)
}

/// Writes a stand-alone script running all jobs without a scheduler.
pub fn generate_locally(experiment: &Experiment) -> anyhow::Result<PathBuf> {
    let path = local_script_path(&experiment.declaration);
    create_output_dirs(experiment)?;
    std::fs::write(&path, render_local_script(experiment)?)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(path)
}

fn local_script_path(declaration: &Path) -> PathBuf {
    let mut path = declaration.as_os_str().to_owned();
    path.push(".generated.sh");
    PathBuf::from(path)
}

pub fn stop_command(declaration: &Path) -> String {
    format!("{TOOL_NAME} stop \"{}\"", declaration.display())
}
