use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// The closed status set shared by Test, Run and Build (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    Passed,
    Failed,
    RunningWithFailures,
    Uploading,
    Promoted,
    Skipped,
    Cancelling,
}

impl Status {
    /// Terminal for a Build or Run. `Skipped` is only ever reached by a Test
    /// or TestResult, but it's still terminal wherever it appears.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Passed | Status::Failed | Status::Promoted | Status::Skipped
        )
    }

    /// Stable integer discriminant used for the `status` database columns
    /// (Design Notes §9: "Hybrid status columns (stored as integer, exposed
    /// as enum with comparators)"). The mapping is part of the on-disk
    /// format so variants must never be renumbered.
    pub fn discriminant(self) -> i64 {
        match self {
            Status::Queued => 1,
            Status::Running => 2,
            Status::Passed => 3,
            Status::Failed => 4,
            Status::RunningWithFailures => 5,
            Status::Uploading => 6,
            Status::Promoted => 7,
            Status::Skipped => 8,
            Status::Cancelling => 9,
        }
    }
}

impl TryFrom<i64> for Status {
    type Error = anyhow::Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Status::Queued,
            2 => Status::Running,
            3 => Status::Passed,
            4 => Status::Failed,
            5 => Status::RunningWithFailures,
            6 => Status::Uploading,
            7 => Status::Promoted,
            8 => Status::Skipped,
            9 => Status::Cancelling,
            other => anyhow::bail!("unknown status discriminant {other}"),
        })
    }
}

impl From<Status> for i64 {
    fn from(s: Status) -> i64 {
        s.discriminant()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Passed => "PASSED",
            Status::Failed => "FAILED",
            Status::RunningWithFailures => "RUNNING_WITH_FAILURES",
            Status::Uploading => "UPLOADING",
            Status::Promoted => "PROMOTED",
            Status::Skipped => "SKIPPED",
            Status::Cancelling => "CANCELLING",
        };
        write!(f, "{s}")
    }
}

/// Rules in order, first match wins (§4.1). Pure function; the single source
/// of truth for a Build's status from its Runs, and a Test's from its
/// TestResults.
///
/// Adopts the union form of rule 2 per the Open Question in Design Notes §9:
/// `CANCELLING` counts both as "still running" (alongside `RUNNING` /
/// `UPLOADING`) and as a failure signal (alongside `FAILED`).
pub fn cumulative_status<I: IntoIterator<Item = Status>>(children: I) -> Status {
    let states: HashSet<Status> = children.into_iter().collect();
    assert!(!states.is_empty(), "cumulative_status needs a non-empty set");

    // Rule 1: every child already terminal-passed/failed/skipped.
    let only_terminal = states
        .iter()
        .all(|s| matches!(s, Status::Passed | Status::Failed | Status::Skipped));
    if only_terminal {
        return if states.contains(&Status::Failed) {
            Status::Failed
        } else {
            Status::Passed
        };
    }

    // Rule 2: something still running.
    if states.contains(&Status::Running)
        || states.contains(&Status::Uploading)
        || states.contains(&Status::Cancelling)
    {
        return if states.contains(&Status::Failed) || states.contains(&Status::Cancelling) {
            Status::RunningWithFailures
        } else {
            Status::Running
        };
    }

    // Rule 3 & 4: mix of queued with already-terminal siblings.
    if states.contains(&Status::Queued) && states.contains(&Status::Failed) {
        return Status::RunningWithFailures;
    }
    if states.contains(&Status::Queued) && states.contains(&Status::Passed) {
        return Status::Running;
    }

    // Rule 5: default.
    Status::Queued
}

impl std::str::FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "QUEUED" => Status::Queued,
            "RUNNING" => Status::Running,
            "PASSED" => Status::Passed,
            "FAILED" => Status::Failed,
            "RUNNING_WITH_FAILURES" => Status::RunningWithFailures,
            "UPLOADING" => Status::Uploading,
            "PROMOTED" => Status::Promoted,
            "SKIPPED" => Status::Skipped,
            "CANCELLING" => Status::Cancelling,
            other => anyhow::bail!("unknown status name {other:?}"),
        })
    }
}
