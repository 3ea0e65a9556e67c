use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// One schema change. Ids are sequential and applied exactly once, in order.
pub struct Migration {
    pub id: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "create_jobs_and_tasks",
        sql: "
            CREATE TABLE jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                working_directory TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'not_started',
                task_type TEXT NOT NULL DEFAULT 'build',
                branch TEXT,
                pr_link TEXT,
                execution_log TEXT NOT NULL DEFAULT '',
                commit_sha TEXT,
                comment_url TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        ",
    },
    Migration {
        id: 2,
        name: "add_task_provenance",
        sql: "
            ALTER TABLE tasks ADD COLUMN pr_number INTEGER;
            ALTER TABLE tasks ADD COLUMN comment_author TEXT;
            ALTER TABLE tasks ADD COLUMN comment_path TEXT;
            ALTER TABLE tasks ADD COLUMN comment_line INTEGER;
            ALTER TABLE tasks ADD COLUMN comment_body TEXT;
            ALTER TABLE tasks ADD COLUMN check_names TEXT;
        ",
    },
    Migration {
        id: 3,
        name: "index_tasks",
        sql: "
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_branch ON tasks(branch);
            CREATE INDEX IF NOT EXISTS idx_tasks_comment_path ON tasks(task_type, comment_path);
        ",
    },
];

const TASK_COLUMNS: &str = "id, job_id, description, status, task_type, branch, pr_link, execution_log, \
     commit_sha, comment_url, pr_number, comment_author, comment_path, comment_line, comment_body, \
     check_names, created_at, updated_at";

fn task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        task_type: row.get(4)?,
        branch: row.get(5)?,
        pr_link: row.get(6)?,
        execution_log: row.get(7)?,
        commit_sha: row.get(8)?,
        comment_url: row.get(9)?,
        pr_number: row.get(10)?,
        comment_author: row.get(11)?,
        comment_path: row.get(12)?,
        comment_line: row.get(13)?,
        comment_body: row.get(14)?,
        check_names: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        description: row.get(1)?,
        working_directory: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations(MIGRATIONS)
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Apply every migration newer than the ledger's high-water mark.
    /// Each migration and its ledger row commit together.
    pub fn run_migrations(&self, migrations: &[Migration]) -> Result<usize> {
        for pair in migrations.windows(2) {
            if pair[1].id <= pair[0].id {
                anyhow::bail!(
                    "Migration ids must be strictly increasing ({} follows {})",
                    pair[1].id,
                    pair[0].id
                );
            }
        }

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                );",
            )
            .context("Failed to create schema_migrations table")?;

        let current: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(id), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .context("Failed to read migration ledger")?;

        let mut applied = 0;
        for migration in migrations.iter().filter(|m| m.id > current) {
            // Safety: Store is only reached through StoreHandle's mutex.
            let tx = self
                .conn
                .unchecked_transaction()
                .context("Failed to begin migration transaction")?;
            tx.execute_batch(migration.sql).with_context(|| {
                format!("Migration {} ({}) failed", migration.id, migration.name)
            })?;
            tx.execute(
                "INSERT INTO schema_migrations (id, name) VALUES (?1, ?2)",
                params![migration.id, migration.name],
            )
            .context("Failed to record migration")?;
            tx.commit().context("Failed to commit migration")?;
            tracing::debug!(id = migration.id, name = migration.name, "applied migration");
            applied += 1;
        }
        Ok(applied)
    }

    /// Ids recorded in the migration ledger, ascending.
    pub fn applied_migrations(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM schema_migrations ORDER BY id")
            .context("Failed to prepare applied_migrations")?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query migrations")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read migration row")?);
        }
        Ok(ids)
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(&self, description: &str, working_directory: &str) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (description, working_directory) VALUES (?1, ?2)",
                params![description, working_directory],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                "SELECT id, description, working_directory, created_at FROM jobs WHERE id = ?1",
                params![id],
                job_row,
            )
            .optional()
            .context("Failed to query job")
    }

    pub fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, description, working_directory, created_at
                 FROM jobs ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![limit], job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?);
        }
        Ok(jobs)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(&self, job_id: i64, task: &NewTask) -> Result<Task> {
        let p = &task.provenance;
        self.conn
            .execute(
                "INSERT INTO tasks (job_id, description, task_type, branch, comment_url, pr_number,
                    comment_author, comment_path, comment_line, comment_body, check_names)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job_id,
                    task.description,
                    task.task_type.as_str(),
                    task.branch,
                    task.comment_url,
                    p.pr_number,
                    p.comment_author,
                    p.comment_path,
                    p.comment_line,
                    p.comment_body,
                    p.check_names,
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, task_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn list_tasks_for_job(&self, job_id: i64) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {} FROM tasks WHERE job_id = ?1 ORDER BY id", TASK_COLUMNS),
            params![job_id],
        )
    }

    /// Tasks of a job that still need to run (`not_started` or `retry_eligible`).
    pub fn pending_tasks(&self, job_id: i64) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE job_id = ?1 AND status IN ('not_started', 'retry_eligible')
                 ORDER BY id",
                TASK_COLUMNS
            ),
            params![job_id],
        )
    }

    /// Completed address tasks that touched `path`, most recent first.
    pub fn completed_address_tasks_for_path(&self, path: &str, limit: i64) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks
                 WHERE task_type = 'address' AND status = 'completed' AND comment_path = ?1
                 ORDER BY id DESC LIMIT ?2",
                TASK_COLUMNS
            ),
            params![path, limit],
        )
    }

    /// Assign a task's branch. A branch is set once; re-assigning the same
    /// name is a no-op, a different name is an error.
    pub fn assign_branch(&self, id: i64, branch: &str) -> Result<Task> {
        let task = self.get_task(id)?.context("Task not found")?;
        match task.branch.as_deref() {
            Some(existing) if existing == branch => return Ok(task),
            Some(existing) => anyhow::bail!(
                "Task {} already has branch '{}' (refusing to reassign to '{}')",
                id,
                existing,
                branch
            ),
            None => {}
        }
        self.conn
            .execute(
                "UPDATE tasks SET branch = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND branch IS NULL",
                params![branch, id],
            )
            .context("Failed to assign task branch")?;
        self.get_task(id)?.context("Task not found after branch update")
    }

    /// Move a task through the state machine, rejecting illegal transitions.
    pub fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Task> {
        let task = self.get_task(id)?.context("Task not found")?;
        if task.status == status {
            return Ok(task);
        }
        if !task.status.can_transition_to(status) {
            anyhow::bail!(
                "Invalid task status transition for task {}: {} -> {}",
                id,
                task.status,
                status
            );
        }
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update task status")?;
        self.get_task(id)?.context("Task not found after status update")
    }

    /// Tasks left `active` by an interrupted process become retry-eligible.
    pub fn reset_stale_active(&self, job_id: i64) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'retry_eligible', updated_at = datetime('now')
                 WHERE job_id = ?1 AND status = 'active'",
                params![job_id],
            )
            .context("Failed to reset stale tasks")?;
        Ok(count)
    }

    pub fn append_execution_log(&self, id: i64, text: &str) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE tasks SET execution_log = execution_log || ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![text, id],
            )
            .context("Failed to append execution log")?;
        if count == 0 {
            anyhow::bail!("Task {} not found", id);
        }
        Ok(())
    }

    pub fn set_pr_link(&self, id: i64, pr_link: &str) -> Result<()> {
        self.set_text_column(id, "pr_link", pr_link)
    }

    pub fn set_commit_sha(&self, id: i64, sha: &str) -> Result<()> {
        self.set_text_column(id, "commit_sha", sha)
    }

    pub fn set_comment_url(&self, id: i64, url: &str) -> Result<()> {
        self.set_text_column(id, "comment_url", url)
    }

    fn set_text_column(&self, id: i64, column: &'static str, value: &str) -> Result<()> {
        let count = self
            .conn
            .execute(
                &format!(
                    "UPDATE tasks SET {} = ?1, updated_at = datetime('now') WHERE id = ?2",
                    column
                ),
                params![value, id],
            )
            .with_context(|| format!("Failed to update task {}", column))?;
        if count == 0 {
            anyhow::bail!("Task {} not found", id);
        }
        Ok(())
    }
}

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, keeping synchronous SQLite I/O off the
/// async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Store::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Store::open_in_memory()?))
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }
}
