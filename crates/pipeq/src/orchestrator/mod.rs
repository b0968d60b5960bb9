//! Submission and polling loop of a running experiment.
//!
//! Stages are processed strictly in declaration order. Units of a stage are submitted while
//! the number of active units stays below the parallelism limit of the stage, then the loop
//! waits until the stage drains. Job statuses are rebuilt from the marker streams in job logs,
//! the scheduler is only asked which units are still alive.
mod observer;

use std::collections::HashSet;
use std::io::Write;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::batch::stage_batches;
use crate::common::notify::{Failure, FailureNotifier};
use crate::common::tee::Tee;
use crate::common::utils::str::pluralize;
use crate::common::utils::time::{format_elapsed, format_local_now};
use crate::marker::{self, MarkerAction, append_marker, write_marker};
use crate::model::{ExecutionStatus, Experiment, Stage};
use crate::rundir::{RunDir, read_or_empty, unit_name, unit_prefix};
use crate::scheduler::{
    ActiveUnit, SchedulerAdapter, UnitId, UnitState, list_active_retry, stop_units, submit_unit,
};

pub use observer::TickObserver;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Sleep between two scheduler polls, also used as the retry backoff.
    pub poll_interval: Duration,
    /// Mirror unit activity to the console.
    pub verbose: bool,
    pub strftime: String,
}

/// Experiment log writers, each mirrored to the console.
pub struct RunOutput {
    pub stdout: Tee,
    pub stderr: Tee,
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub failure: Option<Failure>,
    pub skipped_stages: Vec<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

struct SubmittedUnit {
    id: UnitId,
    stage_idx: usize,
    jobs: Range<usize>,
}

pub struct Orchestrator<'a> {
    experiment: Experiment,
    adapter: &'a dyn SchedulerAdapter,
    run_dir: RunDir,
    options: RunOptions,
    output: RunOutput,
    observer: Option<Box<dyn TickObserver + 'a>>,
    notifier: Option<FailureNotifier>,
    units: Vec<SubmittedUnit>,
    current_stage: Option<usize>,
    last_activity: Option<(usize, usize)>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        experiment: Experiment,
        adapter: &'a dyn SchedulerAdapter,
        run_dir: RunDir,
        options: RunOptions,
        output: RunOutput,
    ) -> Self {
        Self {
            experiment,
            adapter,
            run_dir,
            options,
            output,
            observer: None,
            notifier: None,
            units: vec![],
            current_stage: None,
            last_activity: None,
        }
    }

    pub fn with_observer<O: TickObserver + 'a>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_notifier(mut self, notifier: FailureNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Name of the stage that is being processed, if any.
    pub fn current_stage(&self) -> Option<&str> {
        self.current_stage
            .map(|idx| self.experiment.stages[idx].name.as_str())
    }

    pub async fn run(&mut self) -> crate::Result<RunOutcome> {
        self.write_start_markers()?;
        let mut outcome = RunOutcome::default();

        for stage_idx in 0..self.experiment.stages.len() {
            self.current_stage = Some(stage_idx);
            let started = Instant::now();
            {
                let stage = &self.experiment.stages[stage_idx];
                let count = stage.jobs.len();
                let title = format!("{} ({count} {})", stage.name, pluralize("job", count));
                write!(self.output.stdout, "{title:<30} ")?;
                self.output.stdout.flush()?;
                log::info!("Starting stage {} with {count} {}", stage.name, pluralize("job", count));
            }

            self.run_stage(stage_idx).await?;
            let elapsed = format_elapsed(started.elapsed());

            let stage = &self.experiment.stages[stage_idx];
            if stage.aggregate_status()? == ExecutionStatus::Error {
                writeln!(self.output.stdout, "[error, elapsed {elapsed}]")?;
                outcome.failure = Some(Failure {
                    stage: Some(stage.name.clone()),
                    job: stage.first_failed_job().map(|job| job.name.clone()),
                    message: None,
                });
                outcome.skipped_stages = self.cancel_stages_after(stage_idx)?;
                writeln!(
                    self.output.stdout,
                    "\nStopping the experiment. Skipped stages: {}",
                    outcome.skipped_stages.join(", ")
                )?;
                break;
            }
            writeln!(self.output.stdout, "[ok, elapsed {elapsed}]")?;
        }
        self.current_stage = None;

        write_marker(
            &mut self.output.stderr.nodup(),
            MarkerAction::Stats,
            &serde_json::json!({ "time_finished": format_local_now(&self.options.strftime) }),
        )?;
        self.observe()?;

        if let Some(notifier) = &self.notifier {
            match &outcome.failure {
                Some(failure) => notifier.notify_error(failure).await,
                None => notifier.notify_success().await,
            }
        }
        if outcome.is_success() {
            writeln!(self.output.stdout, "\nAll stages finished successfully.")?;
        }
        Ok(outcome)
    }

    fn write_start_markers(&mut self) -> crate::Result<()> {
        let mut stderr = self.output.stderr.nodup();
        write_marker(
            &mut stderr,
            MarkerAction::Stats,
            &serde_json::json!({ "time_started": format_local_now(&self.options.strftime) }),
        )?;
        let environ: crate::Map<String, String> = std::env::vars().collect();
        write_marker(&mut stderr, MarkerAction::Environ, &environ)?;
        Ok(())
    }

    async fn run_stage(&mut self, stage_idx: usize) -> crate::Result<()> {
        let stage = &self.experiment.stages[stage_idx];
        let stage_name = stage.name.clone();
        let limit = stage.parallel_jobs.max(1) as usize;

        for unit in stage_batches(stage) {
            self.wait_while_active_more_than(stage_idx, limit - 1).await?;

            let name = unit_name(&self.experiment.name_code, &stage_name, unit.index);
            let script = self.run_dir.unit_script(&stage_name, unit.index);
            let id = submit_unit(self.adapter, &script, &name, self.options.poll_interval).await;
            log::debug!("Unit {name} submitted as {id}");

            for job in &mut self.experiment.stages[stage_idx].jobs[unit.jobs.clone()] {
                job.update_status(ExecutionStatus::Submitted);
            }
            self.units.push(SubmittedUnit {
                id,
                stage_idx,
                jobs: unit.jobs,
            });
        }

        self.wait_while_active_more_than(stage_idx, 0).await
    }

    async fn wait_while_active_more_than(
        &mut self,
        stage_idx: usize,
        count: usize,
    ) -> crate::Result<()> {
        loop {
            let active = self.tick(stage_idx).await?;
            if active.len() <= count {
                return Ok(());
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Lists active units, then refreshes the jobs of the stage from their logs.
    ///
    /// Liveness is queried first, so a unit that disappears during the tick had the chance to
    /// write its terminal markers before they are read.
    async fn tick(&mut self, stage_idx: usize) -> crate::Result<Vec<ActiveUnit>> {
        let prefix = unit_prefix(&self.experiment.name_code);
        let active = list_active_retry(self.adapter, &prefix, self.options.poll_interval).await;

        let alive: HashSet<&str> = active.iter().map(|unit| unit.id.as_str()).collect();
        let stage = &mut self.experiment.stages[stage_idx];
        for unit in self.units.iter().filter(|unit| unit.stage_idx == stage_idx) {
            let unit_alive = alive.contains(unit.id.as_str());
            for job_idx in unit.jobs.clone() {
                refresh_job(&self.run_dir, stage, job_idx, unit_alive)?;
            }
        }

        self.report_activity(&active)?;
        self.observe()?;
        Ok(active)
    }

    fn report_activity(&mut self, active: &[ActiveUnit]) -> crate::Result<()> {
        if active.is_empty() {
            return Ok(());
        }
        let running = active
            .iter()
            .filter(|unit| unit.state == UnitState::Running)
            .count();
        let activity = (running, active.len() - running);
        if self.last_activity != Some(activity) {
            writeln!(
                self.output.stderr.verbose(self.options.verbose),
                "Running {} {}, waiting {} {}.",
                activity.0,
                pluralize("unit", activity.0),
                activity.1,
                pluralize("unit", activity.1)
            )?;
            self.last_activity = Some(activity);
        }
        Ok(())
    }

    fn observe(&mut self) -> crate::Result<()> {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_tick(&self.experiment)?;
        }
        Ok(())
    }

    /// Cancels all jobs of the following stages and records it in their logs.
    fn cancel_stages_after(&mut self, stage_idx: usize) -> crate::Result<Vec<String>> {
        for (idx, job_idx) in self.experiment.cancel_stages_after(stage_idx)? {
            let stage = &self.experiment.stages[idx];
            append_marker(
                &self.run_dir.job_stderr(&stage.name, job_idx),
                MarkerAction::Status,
                &ExecutionStatus::Canceled,
            )?;
        }
        Ok(self.experiment.stages[stage_idx + 1..]
            .iter()
            .map(|stage| stage.name.clone())
            .collect())
    }
}

/// Applies the last status written by a job. A job of a vanished unit that never reported a
/// terminal status is killed.
fn refresh_job(
    run_dir: &RunDir,
    stage: &mut Stage,
    job_idx: usize,
    unit_alive: bool,
) -> crate::Result<()> {
    let stderr = run_dir.job_stderr(&stage.name, job_idx);
    let record = marker::decode(&read_or_empty(&stderr)?);
    let job = &mut stage.jobs[job_idx];
    if let Some(status) = record.status {
        job.update_status(status);
    }
    if !unit_alive
        && matches!(
            job.status(),
            ExecutionStatus::Submitted | ExecutionStatus::Running
        )
    {
        log::warn!(
            "Job {}/{} disappeared without reporting its result",
            stage.name,
            job.name
        );
        job.update_status(ExecutionStatus::Killed);
        append_marker(&stderr, MarkerAction::Status, &ExecutionStatus::Killed)?;
    }
    Ok(())
}

/// Units of `name_code` that are still queued or running.
pub async fn active_units(
    adapter: &dyn SchedulerAdapter,
    name_code: &str,
    poll_interval: Duration,
) -> Vec<ActiveUnit> {
    list_active_retry(adapter, &unit_prefix(name_code), poll_interval).await
}

/// Deletes every unit of `name_code` and waits until none is listed.
pub async fn stop(
    adapter: &dyn SchedulerAdapter,
    name_code: &str,
    poll_interval: Duration,
) -> usize {
    stop_units(adapter, &unit_prefix(name_code), poll_interval).await
}
