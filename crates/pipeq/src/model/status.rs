use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::error::PipeqError;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Waiting,
    Submitted,
    Running,
    Success,
    Error,
    Killed,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Killed => "killed",
            ExecutionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Error
                | ExecutionStatus::Killed
                | ExecutionStatus::Canceled
        )
    }

    /// `killed` is folded into the error signal.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Error | ExecutionStatus::Killed)
    }

    /// A job may skip `running` when it finishes between two polls or when it fails validation.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, next),
            (Waiting, Submitted)
                | (Waiting, Canceled)
                | (Submitted, Running)
                | (Submitted, Success)
                | (Submitted, Error)
                | (Submitted, Killed)
                | (Running, Success)
                | (Running, Error)
                | (Running, Killed)
        )
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes the aggregate status of a stage from the statuses of its jobs.
///
/// The rules are evaluated in a fixed order, the first matching one wins:
/// 1. any `error`/`killed` => `error`
/// 2. any `canceled` and the rest `waiting` => `canceled`
/// 3. all `success` => `success`
/// 4. all `waiting` => `waiting`
/// 5. any `running` and the rest in `{waiting, submitted, success}` => `running`
/// 6. any `submitted` and the rest in `{waiting, success}` => `submitted`
///
/// Any other combination is reported as [`PipeqError::InconsistentState`].
pub fn aggregate_status<I>(statuses: I) -> crate::Result<ExecutionStatus>
where
    I: IntoIterator<Item = ExecutionStatus>,
{
    use ExecutionStatus::*;

    let statuses: Vec<ExecutionStatus> = statuses.into_iter().collect();
    let any = |status: ExecutionStatus| statuses.contains(&status);
    let all_in = |allowed: &[ExecutionStatus]| statuses.iter().all(|s| allowed.contains(s));

    if statuses.iter().any(|s| s.is_failure()) {
        Ok(Error)
    } else if any(Canceled) && all_in(&[Canceled, Waiting]) {
        Ok(Canceled)
    } else if all_in(&[Success]) {
        Ok(Success)
    } else if all_in(&[Waiting]) {
        Ok(Waiting)
    } else if any(Running) && all_in(&[Running, Waiting, Submitted, Success]) {
        Ok(Running)
    } else if any(Submitted) && all_in(&[Submitted, Waiting, Success]) {
        Ok(Submitted)
    } else {
        Err(PipeqError::InconsistentState(format!(
            "cannot aggregate job statuses [{}]",
            statuses
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}
