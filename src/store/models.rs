//! Row types for the relational store (§3). Each struct mirrors a table from
//! `migrations/0001_init.sql`; status columns are stored as the integer
//! discriminant from [`crate::status::Status`] and converted back at the
//! boundary, per Design Notes §9.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::status::Status;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub synchronous_builds: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Trigger {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    pub trigger_type: String,
    pub user: String,
    pub definition_repo: Option<String>,
    pub definition_file: Option<String>,
    pub encrypted_secrets: String,
    pub queue_priority: i64,
}

#[derive(Debug, Clone, FromRow)]
pub(super) struct BuildRow {
    id: i64,
    project_id: i64,
    build_id: i64,
    status: i64,
    reason: Option<String>,
    trigger_name: Option<String>,
    name: Option<String>,
    annotation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub id: i64,
    pub project_id: i64,
    pub build_id: i64,
    pub status: Status,
    pub reason: Option<String>,
    pub trigger_name: Option<String>,
    pub name: Option<String>,
    pub annotation: Option<String>,
}

impl TryFrom<BuildRow> for Build {
    type Error = anyhow::Error;
    fn try_from(r: BuildRow) -> anyhow::Result<Self> {
        Ok(Build {
            id: r.id,
            project_id: r.project_id,
            build_id: r.build_id,
            status: Status::try_from(r.status)?,
            reason: r.reason,
            trigger_name: r.trigger_name,
            name: r.name,
            annotation: r.annotation,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BuildEvent {
    pub id: i64,
    pub build_id: i64,
    status: i64,
    created_at: DateTime<Utc>,
}

impl BuildEvent {
    pub fn status(&self) -> anyhow::Result<Status> {
        Status::try_from(self.status)
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, FromRow)]
pub(super) struct RunRow {
    id: i64,
    build_id: i64,
    name: String,
    status: i64,
    api_key: String,
    trigger_name: Option<String>,
    host_tag: String,
    queue_priority: i64,
    worker_name: Option<String>,
    meta: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: i64,
    pub build_id: i64,
    pub name: String,
    pub status: Status,
    pub api_key: String,
    pub trigger_name: Option<String>,
    pub host_tag: String,
    pub queue_priority: i64,
    pub worker_name: Option<String>,
    pub meta: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = anyhow::Error;
    fn try_from(r: RunRow) -> anyhow::Result<Self> {
        Ok(Run {
            id: r.id,
            build_id: r.build_id,
            name: r.name,
            status: Status::try_from(r.status)?,
            api_key: r.api_key,
            trigger_name: r.trigger_name,
            host_tag: r.host_tag,
            queue_priority: r.queue_priority,
            worker_name: r.worker_name,
            meta: r.meta,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: i64,
    status: i64,
    created_at: DateTime<Utc>,
}

impl RunEvent {
    pub fn status(&self) -> anyhow::Result<Status> {
        Status::try_from(self.status)
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, FromRow)]
pub(super) struct TestRow {
    id: i64,
    run_id: i64,
    name: String,
    context: Option<String>,
    status: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Test {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub context: Option<String>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TestRow> for Test {
    type Error = anyhow::Error;
    fn try_from(r: TestRow) -> anyhow::Result<Self> {
        Ok(Test {
            id: r.id,
            run_id: r.run_id,
            name: r.name,
            context: r.context,
            status: Status::try_from(r.status)?,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(super) struct TestResultRow {
    id: i64,
    test_id: i64,
    name: String,
    context: Option<String>,
    status: i64,
    output: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub id: i64,
    pub test_id: i64,
    pub name: String,
    pub context: Option<String>,
    pub status: Status,
    pub output: Option<String>,
}

impl TryFrom<TestResultRow> for TestResult {
    type Error = anyhow::Error;
    fn try_from(r: TestResultRow) -> anyhow::Result<Self> {
        Ok(TestResult {
            id: r.id,
            test_id: r.test_id,
            name: r.name,
            context: r.context,
            status: Status::try_from(r.status)?,
            output: r.output,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Worker {
    pub name: String,
    pub distro: String,
    pub mem_total: i64,
    pub cpu_total: i64,
    pub cpu_type: String,
    pub concurrent_runs: i64,
    pub host_tags: String,
    #[serde(skip)]
    pub api_key_hash: String,
    pub enlisted: bool,
    pub online: bool,
    pub surges_only: bool,
    pub deleted: bool,
    pub last_ping_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// A worker is available for dispatch when enlisted, not deleted, and
    /// either not surges-only or one of its tags is currently surging (§4.4).
    pub fn available(&self, surging_tags: &std::collections::HashSet<String>) -> bool {
        if !self.enlisted || self.deleted {
            return false;
        }
        if !self.surges_only {
            return true;
        }
        self.split_tags().iter().any(|t| surging_tags.contains(t))
    }

    /// Host tags, lowercased so every consumer (dispatch, surge accounting)
    /// agrees on case-insensitive matching regardless of how the tag was
    /// entered at registration, mirroring `create_run`'s lowercasing of a
    /// Run's own host tag.
    pub fn split_tags(&self) -> Vec<String> {
        self.host_tags
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

pub(super) fn build_row_to_build(row: BuildRow) -> anyhow::Result<Build> {
    row.try_into()
}
pub(super) fn run_row_to_run(row: RunRow) -> anyhow::Result<Run> {
    row.try_into()
}
pub(super) fn test_row_to_test(row: TestRow) -> anyhow::Result<Test> {
    row.try_into()
}
pub(super) fn test_result_row_to_test_result(row: TestResultRow) -> anyhow::Result<TestResult> {
    row.try_into()
}

pub(super) type RawBuildRow = BuildRow;
pub(super) type RawRunRow = RunRow;
pub(super) type RawTestRow = TestRow;
pub(super) type RawTestResultRow = TestResultRow;
