//! The relational store (§3, §0's "Non-goals ... a relational store with
//! row-level locking and unique constraints"). Backed by `sqlx` against
//! SQLite, the way `mqk-db` wraps a Postgres pool behind a typed newtype
//! with `sqlx::migrate!` for schema management.

pub mod build_lock;
pub mod models;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::{JobservError, Result};
use crate::status::Status;
use models::{Build, BuildEvent, Project, Run, RunEvent, Test, TestResult, Trigger, Worker};

/// Number of candidate `build_id`s tried before giving up with `Conflict`,
/// mirroring `jobserv/models.py: Build._try_build_ids` (§10 supplement).
const BUILD_ID_RETRY_WINDOW: i64 = 10;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| JobservError::Unexpected(anyhow::anyhow!(e)))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn map_db_err(e: sqlx::Error) -> JobservError {
        JobservError::Unexpected(anyhow::anyhow!(e))
    }

    // ---- Projects -----------------------------------------------------

    pub async fn create_project(&self, name: &str, synchronous_builds: bool) -> Result<Project> {
        let rec = sqlx::query_as::<_, Project>(
            "INSERT INTO projects (name, synchronous_builds) VALUES (?, ?) RETURNING id, name, synchronous_builds",
        )
        .bind(name)
        .bind(synchronous_builds)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref dbe) if dbe.message().contains("UNIQUE") => {
                JobservError::Conflict(format!("project {name} already exists"))
            }
            e => Self::map_db_err(e),
        })?;
        Ok(rec)
    }

    pub async fn get_project(&self, name: &str) -> Result<Project> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, synchronous_builds FROM projects WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?
        .ok_or_else(|| JobservError::NotFound(format!("project {name}")))
    }

    /// The project name owning a given row id, for call sites (e.g. a
    /// worker poll) that only have a Build/Run's `project_id` FK at hand.
    pub async fn get_project_name_by_id(&self, project_id: i64) -> Result<String> {
        sqlx::query_scalar("SELECT name FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_db_err)?
            .ok_or_else(|| JobservError::NotFound(format!("project {project_id}")))
    }

    pub async fn list_projects(&self, limit: i64, offset: i64) -> Result<(Vec<Project>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        let rows = sqlx::query_as::<_, Project>(
            "SELECT id, name, synchronous_builds FROM projects ORDER BY name ASC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        Ok((rows, total))
    }

    /// Cascade delete: Triggers, Builds (and their Runs/Tests/events) for
    /// this Project. Workers are never touched (they're only weakly
    /// referenced by Runs, per §3's ownership rules).
    pub async fn delete_project(&self, name: &str) -> Result<()> {
        let project = self.get_project(name).await?;
        let mut tx = self.pool.begin().await.map_err(Self::map_db_err)?;
        sqlx::query(
            "DELETE FROM test_results WHERE test_id IN (
                SELECT t.id FROM tests t
                JOIN runs r ON t.run_id = r.id
                JOIN builds b ON r.build_id = b.id
                WHERE b.project_id = ?)",
        )
        .bind(project.id)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_db_err)?;
        sqlx::query(
            "DELETE FROM tests WHERE run_id IN (
                SELECT r.id FROM runs r JOIN builds b ON r.build_id = b.id WHERE b.project_id = ?)",
        )
        .bind(project.id)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_db_err)?;
        sqlx::query(
            "DELETE FROM run_events WHERE run_id IN (
                SELECT r.id FROM runs r JOIN builds b ON r.build_id = b.id WHERE b.project_id = ?)",
        )
        .bind(project.id)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_db_err)?;
        sqlx::query(
            "DELETE FROM runs WHERE build_id IN (SELECT id FROM builds WHERE project_id = ?)",
        )
        .bind(project.id)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_db_err)?;
        sqlx::query("DELETE FROM build_events WHERE build_id IN (SELECT id FROM builds WHERE project_id = ?)")
            .bind(project.id)
            .execute(&mut *tx)
            .await
            .map_err(Self::map_db_err)?;
        sqlx::query("DELETE FROM builds WHERE project_id = ?")
            .bind(project.id)
            .execute(&mut *tx)
            .await
            .map_err(Self::map_db_err)?;
        sqlx::query("DELETE FROM triggers WHERE project_id = ?")
            .bind(project.id)
            .execute(&mut *tx)
            .await
            .map_err(Self::map_db_err)?;
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project.id)
            .execute(&mut *tx)
            .await
            .map_err(Self::map_db_err)?;
        tx.commit().await.map_err(Self::map_db_err)?;
        Ok(())
    }

    // ---- Triggers -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_trigger(
        &self,
        project_id: i64,
        name: &str,
        trigger_type: &str,
        user: &str,
        definition_repo: Option<&str>,
        definition_file: Option<&str>,
        encrypted_secrets: &str,
        queue_priority: i64,
    ) -> Result<Trigger> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO triggers
                (project_id, name, type, user, definition_repo, definition_file, encrypted_secrets, queue_priority)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(project_id)
        .bind(name)
        .bind(trigger_type)
        .bind(user)
        .bind(definition_repo)
        .bind(definition_file)
        .bind(encrypted_secrets)
        .bind(queue_priority)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        Ok(Trigger {
            id,
            project_id,
            name: name.to_string(),
            trigger_type: trigger_type.to_string(),
            user: user.to_string(),
            definition_repo: definition_repo.map(String::from),
            definition_file: definition_file.map(String::from),
            encrypted_secrets: encrypted_secrets.to_string(),
            queue_priority,
        })
    }

    pub async fn get_trigger(&self, project_id: i64, name: &str) -> Result<Trigger> {
        sqlx::query_as::<_, Trigger>(
            "SELECT id, project_id, name, type, user, definition_repo, definition_file,
                    encrypted_secrets, queue_priority
             FROM triggers WHERE project_id = ? AND name = ?",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?
        .ok_or_else(|| JobservError::NotFound(format!("trigger {name}")))
    }

    // ---- Builds ---------------------------------------------------------

    /// Allocates the next positive `build_id` for `project_id` and inserts
    /// the Build row plus its initial QUEUED BuildEvent, retrying across a
    /// bounded window of candidate ids on a unique-constraint collision
    /// (§3, §8, §10).
    pub async fn create_build(
        &self,
        project_id: i64,
        reason: Option<&str>,
        trigger_name: Option<&str>,
    ) -> Result<Build> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(build_id) FROM builds WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Self::map_db_err)?;
        let start = last.unwrap_or(0) + 1;

        let mut last_err = None;
        for build_id in start..start + BUILD_ID_RETRY_WINDOW {
            let mut tx = self.pool.begin().await.map_err(Self::map_db_err)?;
            let inserted: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
                "INSERT INTO builds (project_id, build_id, status, reason, trigger_name)
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(project_id)
            .bind(build_id)
            .bind(Status::Queued.discriminant())
            .bind(reason)
            .bind(trigger_name)
            .fetch_one(&mut *tx)
            .await;

            match inserted {
                Ok(id) => {
                    sqlx::query(
                        "INSERT INTO build_events (build_id, status, created_at) VALUES (?, ?, ?)",
                    )
                    .bind(id)
                    .bind(Status::Queued.discriminant())
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::map_db_err)?;
                    tx.commit().await.map_err(Self::map_db_err)?;
                    return Ok(Build {
                        id,
                        project_id,
                        build_id,
                        status: Status::Queued,
                        reason: reason.map(String::from),
                        trigger_name: trigger_name.map(String::from),
                        name: None,
                        annotation: None,
                    });
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    last_err = Some(e);
                }
            }
        }
        Err(JobservError::Conflict(format!(
            "couldn't allocate a build_id for project {project_id} after {BUILD_ID_RETRY_WINDOW} attempts: {:?}",
            last_err
        )))
    }

    pub async fn list_builds_for_project(
        &self,
        project_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Build>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        let rows: Vec<models::RawBuildRow> = sqlx::query_as(
            "SELECT id, project_id, build_id, status, reason, trigger_name, name, annotation
             FROM builds WHERE project_id = ? ORDER BY build_id DESC LIMIT ? OFFSET ?",
        )
        .bind(project_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        let builds = rows
            .into_iter()
            .map(|r| models::build_row_to_build(r).map_err(JobservError::Unexpected))
            .collect::<Result<Vec<_>>>()?;
        Ok((builds, total))
    }

    pub async fn get_build(&self, project_id: i64, build_id: i64) -> Result<Build> {
        let row: Option<models::RawBuildRow> = sqlx::query_as(
            "SELECT id, project_id, build_id, status, reason, trigger_name, name, annotation
             FROM builds WHERE project_id = ? AND build_id = ?",
        )
        .bind(project_id)
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        let row = row.ok_or_else(|| JobservError::NotFound(format!("build {build_id}")))?;
        models::build_row_to_build(row).map_err(JobservError::Unexpected)
    }

    pub async fn get_build_by_id(&self, id: i64) -> Result<Build> {
        let row: Option<models::RawBuildRow> = sqlx::query_as(
            "SELECT id, project_id, build_id, status, reason, trigger_name, name, annotation
             FROM builds WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        let row = row.ok_or_else(|| JobservError::NotFound(format!("build row {id}")))?;
        models::build_row_to_build(row).map_err(JobservError::Unexpected)
    }

    pub async fn set_build_status(&self, build_id: i64, status: Status) -> Result<()> {
        sqlx::query("UPDATE builds SET status = ? WHERE id = ?")
            .bind(status.discriminant())
            .bind(build_id)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn append_build_event(&self, build_id: i64, status: Status) -> Result<()> {
        sqlx::query("INSERT INTO build_events (build_id, status, created_at) VALUES (?, ?, ?)")
            .bind(build_id)
            .bind(status.discriminant())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn list_build_events(&self, build_id: i64) -> Result<Vec<BuildEvent>> {
        sqlx::query_as::<_, BuildEvent>(
            "SELECT id, build_id, status, created_at FROM build_events
             WHERE build_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)
    }

    // ---- Runs -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        build_id: i64,
        name: &str,
        api_key: &str,
        trigger_name: Option<&str>,
        host_tag: &str,
        queue_priority: i64,
    ) -> Result<Run> {
        let id: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO runs (build_id, name, status, api_key, trigger_name, host_tag, queue_priority)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(build_id)
        .bind(name)
        .bind(Status::Queued.discriminant())
        .bind(api_key)
        .bind(trigger_name)
        .bind(host_tag.to_lowercase())
        .bind(queue_priority)
        .fetch_one(&self.pool)
        .await;

        let id = id.map_err(|e| match &e {
            sqlx::Error::Database(dbe) if dbe.message().contains("UNIQUE") => {
                JobservError::Conflict(format!("run {name} already exists in this build"))
            }
            _ => Self::map_db_err(e),
        })?;

        self.append_run_event(id, Status::Queued).await?;

        Ok(Run {
            id,
            build_id,
            name: name.to_string(),
            status: Status::Queued,
            api_key: api_key.to_string(),
            trigger_name: trigger_name.map(String::from),
            host_tag: host_tag.to_lowercase(),
            queue_priority,
            worker_name: None,
            meta: None,
        })
    }

    pub async fn get_run(&self, build_id: i64, name: &str) -> Result<Run> {
        let row: Option<models::RawRunRow> = sqlx::query_as(
            "SELECT id, build_id, name, status, api_key, trigger_name, host_tag, queue_priority, worker_name, meta
             FROM runs WHERE build_id = ? AND name = ?",
        )
        .bind(build_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        let row = row.ok_or_else(|| JobservError::NotFound(format!("run {name}")))?;
        models::run_row_to_run(row).map_err(JobservError::Unexpected)
    }

    pub async fn get_run_by_id(&self, id: i64) -> Result<Run> {
        let row: Option<models::RawRunRow> = sqlx::query_as(
            "SELECT id, build_id, name, status, api_key, trigger_name, host_tag, queue_priority, worker_name, meta
             FROM runs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        let row = row.ok_or_else(|| JobservError::NotFound(format!("run row {id}")))?;
        models::run_row_to_run(row).map_err(JobservError::Unexpected)
    }

    pub async fn list_runs_for_build(&self, build_id: i64) -> Result<Vec<Run>> {
        let rows: Vec<models::RawRunRow> = sqlx::query_as(
            "SELECT id, build_id, name, status, api_key, trigger_name, host_tag, queue_priority, worker_name, meta
             FROM runs WHERE build_id = ? ORDER BY id ASC",
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        rows.into_iter()
            .map(|r| models::run_row_to_run(r).map_err(JobservError::Unexpected))
            .collect()
    }

    pub async fn set_run_status(&self, run_id: i64, status: Status) -> Result<()> {
        sqlx::query("UPDATE runs SET status = ? WHERE id = ?")
            .bind(status.discriminant())
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn set_run_meta(&self, run_id: i64, meta: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET meta = ? WHERE id = ?")
            .bind(meta)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn append_run_event(&self, run_id: i64, status: Status) -> Result<()> {
        sqlx::query("INSERT INTO run_events (run_id, status, created_at) VALUES (?, ?, ?)")
            .bind(run_id)
            .bind(status.discriminant())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn list_run_events(&self, run_id: i64) -> Result<Vec<RunEvent>> {
        sqlx::query_as::<_, RunEvent>(
            "SELECT id, run_id, status, created_at FROM run_events
             WHERE run_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)
    }

    /// Raw rows used by the dispatcher's scan (§4.4): every QUEUED/RUNNING
    /// run joined with its Build/Project, ordered exactly per the selection
    /// ordering rules. The dispatcher itself applies tag/availability
    /// filtering and the atomic claim.
    pub async fn scan_dispatch_candidates(&self) -> Result<Vec<DispatchRow>> {
        let raw = sqlx::query(
            "SELECT r.id as run_id, r.build_id as run_build_id, r.name as run_name,
                    r.status as run_status, r.host_tag as host_tag,
                    r.queue_priority as queue_priority,
                    b.id as build_row_id, b.build_id as build_seq, b.project_id as project_id,
                    p.synchronous_builds as synchronous_builds
             FROM runs r
             JOIN builds b ON r.build_id = b.id
             JOIN projects p ON b.project_id = p.id
             WHERE r.status IN (?, ?)
             ORDER BY
                (r.status = ?) DESC,
                r.queue_priority DESC,
                b.build_id ASC,
                r.id ASC",
        )
        .bind(Status::Running.discriminant())
        .bind(Status::Queued.discriminant())
        .bind(Status::Running.discriminant())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;

        raw.into_iter()
            .map(|row| {
                Ok(DispatchRow {
                    run_id: row.try_get("run_id").map_err(Self::map_db_err)?,
                    build_row_id: row.try_get("build_row_id").map_err(Self::map_db_err)?,
                    build_seq: row.try_get("build_seq").map_err(Self::map_db_err)?,
                    project_id: row.try_get("project_id").map_err(Self::map_db_err)?,
                    run_name: row.try_get("run_name").map_err(Self::map_db_err)?,
                    host_tag: row.try_get("host_tag").map_err(Self::map_db_err)?,
                    status: Status::try_from(row.try_get::<i64, _>("run_status").map_err(Self::map_db_err)?)
                        .map_err(JobservError::Unexpected)?,
                    synchronous_builds: row.try_get("synchronous_builds").map_err(Self::map_db_err)?,
                })
            })
            .collect()
    }

    /// Conditional update: set status RUNNING where `id = run_id AND status
    /// = QUEUED`, bind the worker. Returns `true` iff this call won the
    /// claim. This is the single non-blocking round-trip the dispatcher
    /// relies on for exclusivity (§4.4, §8).
    pub async fn claim_queued_run(&self, run_id: i64, worker_name: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, worker_name = ? WHERE id = ? AND status = ?",
        )
        .bind(Status::Running.discriminant())
        .bind(worker_name)
        .bind(run_id)
        .bind(Status::Queued.discriminant())
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        let won = result.rows_affected() == 1;
        if won {
            self.append_run_event(run_id, Status::Running).await?;
        }
        Ok(won)
    }

    pub async fn list_queued_runs_by_host_tag(&self) -> Result<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, host_tag FROM runs WHERE status = ? ORDER BY id ASC",
        )
        .bind(Status::Queued.discriminant())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        Ok(rows)
    }

    // ---- Tests --------------------------------------------------------

    pub async fn create_test(&self, run_id: i64, name: &str, context: Option<&str>) -> Result<Test> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tests (run_id, name, context, status, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(run_id)
        .bind(name)
        .bind(context)
        .bind(Status::Queued.discriminant())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        Ok(Test {
            id,
            run_id,
            name: name.to_string(),
            context: context.map(String::from),
            status: Status::Queued,
            created_at: Utc::now(),
        })
    }

    pub async fn set_test_status(&self, test_id: i64, status: Status) -> Result<()> {
        sqlx::query("UPDATE tests SET status = ? WHERE id = ?")
            .bind(status.discriminant())
            .bind(test_id)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn list_tests_for_run(&self, run_id: i64) -> Result<Vec<Test>> {
        let rows: Vec<models::RawTestRow> = sqlx::query_as(
            "SELECT id, run_id, name, context, status, created_at FROM tests WHERE run_id = ? ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        rows.into_iter()
            .map(|r| models::test_row_to_test(r).map_err(JobservError::Unexpected))
            .collect()
    }

    pub async fn create_test_result(
        &self,
        test_id: i64,
        name: &str,
        context: Option<&str>,
        status: Status,
        output: Option<&str>,
    ) -> Result<TestResult> {
        // §3: TestResult output capped at 64 KiB.
        const MAX_OUTPUT: usize = 64 * 1024;
        let output = output.map(|o| {
            if o.len() > MAX_OUTPUT {
                &o[..MAX_OUTPUT]
            } else {
                o
            }
        });
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO test_results (test_id, name, context, status, output) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(test_id)
        .bind(name)
        .bind(context)
        .bind(status.discriminant())
        .bind(output)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        Ok(TestResult {
            id,
            test_id,
            name: name.to_string(),
            context: context.map(String::from),
            status,
            output: output.map(String::from),
        })
    }

    pub async fn list_test_results(&self, test_id: i64) -> Result<Vec<TestResult>> {
        let rows: Vec<models::RawTestResultRow> = sqlx::query_as(
            "SELECT id, test_id, name, context, status, output FROM test_results WHERE test_id = ? ORDER BY id ASC",
        )
        .bind(test_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_db_err)?;
        rows.into_iter()
            .map(|r| models::test_result_row_to_test_result(r).map_err(JobservError::Unexpected))
            .collect()
    }

    // ---- Workers --------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_worker(
        &self,
        name: &str,
        distro: &str,
        mem_total: i64,
        cpu_total: i64,
        cpu_type: &str,
        concurrent_runs: i64,
        host_tags: &str,
        api_key_hash: &str,
        surges_only: bool,
    ) -> Result<Worker> {
        sqlx::query(
            "INSERT INTO workers
                (name, distro, mem_total, cpu_total, cpu_type, concurrent_runs, host_tags,
                 api_key_hash, enlisted, online, surges_only, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 1, ?, 0)",
        )
        .bind(name)
        .bind(distro)
        .bind(mem_total)
        .bind(cpu_total)
        .bind(cpu_type)
        .bind(concurrent_runs)
        .bind(host_tags)
        .bind(api_key_hash)
        .bind(surges_only)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(dbe) if dbe.message().contains("UNIQUE") => {
                JobservError::Conflict(format!("worker {name} already registered"))
            }
            _ => Self::map_db_err(e),
        })?;
        self.get_worker(name).await
    }

    pub async fn get_worker(&self, name: &str) -> Result<Worker> {
        sqlx::query_as::<_, Worker>(
            "SELECT name, distro, mem_total, cpu_total, cpu_type, concurrent_runs, host_tags,
                    api_key_hash, enlisted, online, surges_only, deleted, last_ping_at
             FROM workers WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_db_err)?
        .ok_or_else(|| JobservError::NotFound(format!("worker {name}")))
    }

    pub async fn list_workers(&self, include_deleted: bool) -> Result<Vec<Worker>> {
        let sql = if include_deleted {
            "SELECT name, distro, mem_total, cpu_total, cpu_type, concurrent_runs, host_tags,
                    api_key_hash, enlisted, online, surges_only, deleted, last_ping_at
             FROM workers ORDER BY name ASC"
        } else {
            "SELECT name, distro, mem_total, cpu_total, cpu_type, concurrent_runs, host_tags,
                    api_key_hash, enlisted, online, surges_only, deleted, last_ping_at
             FROM workers WHERE deleted = 0 ORDER BY name ASC"
        };
        sqlx::query_as::<_, Worker>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_db_err)
    }

    pub async fn set_worker_enlisted(&self, name: &str, enlisted: bool) -> Result<()> {
        sqlx::query("UPDATE workers SET enlisted = ? WHERE name = ?")
            .bind(enlisted)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn set_worker_online(&self, name: &str, online: bool) -> Result<()> {
        sqlx::query("UPDATE workers SET online = ? WHERE name = ?")
            .bind(online)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    pub async fn touch_worker_ping(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET last_ping_at = ?, online = 1 WHERE name = ?")
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }

    /// Soft delete: the original never hard-deletes a Worker row, to keep
    /// Run's weak FK reference intact (§3, §10).
    pub async fn delete_worker(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET deleted = 1, enlisted = 0 WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Self::map_db_err)?;
        Ok(())
    }
}

/// One candidate row from the dispatcher's ordered scan (§4.4).
pub struct DispatchRow {
    pub run_id: i64,
    pub build_row_id: i64,
    pub build_seq: i64,
    pub project_id: i64,
    pub run_name: String,
    pub host_tag: String,
    pub status: Status,
    pub synchronous_builds: bool,
}
