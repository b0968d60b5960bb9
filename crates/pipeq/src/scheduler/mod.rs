mod common;
pub mod pbs;
pub mod sge;
pub mod slurm;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Stage;
use crate::scheduler::pbs::PbsAdapter;
use crate::scheduler::sge::SgeAdapter;
use crate::scheduler::slurm::SlurmAdapter;

/// Any error of a scheduler call is considered transient and the call is retried.
pub type SchedulerResult<T> = anyhow::Result<T>;

pub type UnitId = String;

pub type SchedulerFuture<T> = Pin<Box<dyn Future<Output = SchedulerResult<T>>>>;

#[derive(clap::ValueEnum, Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManagerType {
    #[default]
    Sge,
    Pbs,
    Slurm,
}

impl Display for ManagerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerType::Sge => f.write_str("SGE"),
            ManagerType::Pbs => f.write_str("PBS"),
            ManagerType::Slurm => f.write_str("SLURM"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitState {
    Queued,
    Running,
}

/// A unit that currently occupies a slot in the scheduler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActiveUnit {
    pub id: UnitId,
    pub name: String,
    pub state: UnitState,
}

/// Narrow interface to the native CLI of a batch scheduler.
///
/// The scheduler is only asked for liveness. The outcome of a job is read from its logs.
pub trait SchedulerAdapter {
    fn submit(&self, script: &Path, name: &str) -> SchedulerFuture<UnitId>;

    /// Lists all queued or running units whose name starts with `name_prefix`.
    fn list_active(&self, name_prefix: &str) -> SchedulerFuture<Vec<ActiveUnit>>;

    fn delete(&self, ids: &[UnitId]) -> SchedulerFuture<()>;
}

pub fn create_adapter(manager: ManagerType) -> Box<dyn SchedulerAdapter> {
    match manager {
        ManagerType::Sge => Box::new(SgeAdapter),
        ManagerType::Pbs => Box::new(PbsAdapter),
        ManagerType::Slurm => Box::new(SlurmAdapter),
    }
}

/// Header lines of a unit script for the given scheduler.
pub fn unit_directives(
    manager: ManagerType,
    stage: &Stage,
    stdout: &Path,
    stderr: &Path,
) -> Vec<String> {
    match manager {
        ManagerType::Sge => sge::unit_directives(stage, stdout, stderr),
        ManagerType::Pbs => pbs::unit_directives(stage, stdout, stderr),
        ManagerType::Slurm => slurm::unit_directives(stage, stdout, stderr),
    }
}

/// Environment variables that carry the id of the running unit, checked in order.
pub const JOB_ID_VARIABLES: [&str; 3] = ["JOB_ID", "PBS_JOBID", "SLURM_JOB_ID"];

pub fn filter_units(units: &[ActiveUnit], state: Option<UnitState>) -> Vec<UnitId> {
    units
        .iter()
        .filter(|unit| state.is_none_or(|state| unit.state == state))
        .map(|unit| unit.id.clone())
        .collect()
}

/// Repeats `operation` until it succeeds, sleeping `backoff` after every failure.
///
/// There is no retry limit, a permanently failing scheduler keeps the caller waiting.
pub async fn retry_forever<T, F, Fut>(backoff: Duration, description: &str, mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    loop {
        match operation().await {
            Ok(value) => return value,
            Err(error) => {
                log::warn!("Retrying {description}, scheduler call failed: {error:?}");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Submits a unit, retrying until the scheduler accepts it.
///
/// A submission can fail after the scheduler has already accepted the unit. When exactly one
/// active unit carries `name` after a failed attempt, its id is used instead of submitting again.
pub async fn submit_unit(
    adapter: &dyn SchedulerAdapter,
    script: &Path,
    name: &str,
    backoff: Duration,
) -> UnitId {
    loop {
        match adapter.submit(script, name).await {
            Ok(id) => return id,
            Err(error) => {
                log::warn!("Retrying submission of {name}: {error:?}");
                if let Ok(units) = adapter.list_active(name).await {
                    let matching: Vec<&ActiveUnit> =
                        units.iter().filter(|unit| unit.name == name).collect();
                    if let [unit] = matching.as_slice() {
                        log::debug!("Unit {name} was submitted as {} despite the error", unit.id);
                        return unit.id.clone();
                    }
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

pub async fn list_active_retry(
    adapter: &dyn SchedulerAdapter,
    name_prefix: &str,
    backoff: Duration,
) -> Vec<ActiveUnit> {
    retry_forever(backoff, "listing of active units", || {
        adapter.list_active(name_prefix)
    })
    .await
}

pub async fn delete_retry(adapter: &dyn SchedulerAdapter, ids: &[UnitId], backoff: Duration) {
    if ids.is_empty() {
        return;
    }
    retry_forever(backoff, "deletion of units", || adapter.delete(ids)).await
}

/// Deletes every unit of an experiment and waits until the scheduler stops listing them.
pub async fn stop_units(adapter: &dyn SchedulerAdapter, name_prefix: &str, poll: Duration) -> usize {
    let units = list_active_retry(adapter, name_prefix, poll).await;
    let ids = filter_units(&units, None);
    delete_retry(adapter, &ids, poll).await;
    loop {
        let remaining = list_active_retry(adapter, name_prefix, poll).await;
        if remaining.is_empty() {
            return ids.len();
        }
        log::debug!("Waiting for {} units to disappear", remaining.len());
        tokio::time::sleep(poll).await;
    }
}

/// Directory used as working directory of scheduler commands.
pub(crate) fn command_dir(script: Option<&Path>) -> PathBuf {
    script
        .and_then(|script| script.parent())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use crate::scheduler::{UnitState, filter_units, retry_forever, stop_units, submit_unit};
    use crate::tests::utils::MockScheduler;

    #[tokio::test]
    async fn test_retry_until_success() {
        let mut attempts = 0;
        let value = retry_forever(Duration::ZERO, "test", || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    anyhow::bail!("failure {attempt}");
                }
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_submit_recovers_accepted_unit() {
        let scheduler = MockScheduler::default();
        scheduler.fail_next_submits_after_accepting(1);
        let id = submit_unit(&scheduler, Path::new("/tmp/s000000.sh"), "exp_A_0", Duration::ZERO).await;
        assert_eq!(scheduler.submitted_names(), vec!["exp_A_0".to_string()]);
        assert_eq!(scheduler.active_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_submit_retries_rejected_unit() {
        let scheduler = MockScheduler::default();
        scheduler.fail_next_submits(2);
        submit_unit(&scheduler, Path::new("/tmp/s000000.sh"), "exp_A_0", Duration::ZERO).await;
        assert_eq!(scheduler.submitted_names(), vec!["exp_A_0".to_string()]);
        assert_eq!(scheduler.submit_attempts(), 3);
    }

    #[tokio::test]
    async fn test_stop_units() {
        let scheduler = MockScheduler::default();
        for name in ["exp_A_0", "exp_A_1", "other_A_0"] {
            submit_unit(&scheduler, Path::new("/tmp/s.sh"), name, Duration::ZERO).await;
        }
        scheduler.set_running("exp_A_0");
        let units = scheduler.units_with_prefix("exp_");
        assert_eq!(filter_units(&units, Some(UnitState::Running)).len(), 1);
        assert_eq!(filter_units(&units, Some(UnitState::Queued)).len(), 1);

        assert_eq!(stop_units(&scheduler, "exp_", Duration::ZERO).await, 2);
        assert_eq!(scheduler.active_names(), vec!["other_A_0".to_string()]);
    }
}
