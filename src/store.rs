use crate::db::{self, OptionalRowExt};
use crate::models::{
    DownloadJob, DownloadTask, JobStatus, JobSummary, NewTask, PendingTask, TaskStatus,
};
use crate::paths::AppPaths;
use crate::{now_ms, EngineError, Result};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Persistent home of jobs and tasks. Every mutation is scoped to one task
/// or one job.
pub trait TaskStore: Send + Sync {
    /// PENDING tasks with their job columns, in insertion order.
    fn fetch_pending_tasks(&self) -> Result<Vec<PendingTask>>;

    fn fetch_job_with_tasks(&self, job_id: &str) -> Result<Option<DownloadJob>>;

    fn fetch_task(&self, task_id: &str) -> Result<Option<DownloadTask>>;

    /// Moves a task PENDING -> DOWNLOADING. Returns false if it was no longer pending.
    fn claim_task(&self, task_id: &str) -> Result<bool>;

    /// Writes a terminal task (status, progress, file fields, error,
    /// warnings) only while the stored row is still DOWNLOADING. Returns
    /// false when it had already left DOWNLOADING.
    fn finish_task(&self, task: &DownloadTask) -> Result<bool>;

    fn update_task_progress(&self, task_id: &str, progress: f64) -> Result<()>;

    fn save_job_status(&self, job_id: &str, status: JobStatus) -> Result<()>;

    fn create_job(&self, config_name: Option<&str>, tasks: Vec<NewTask>) -> Result<DownloadJob>;

    /// Deletes a task and returns the id of the job it belonged to.
    fn delete_task(&self, task_id: &str) -> Result<Option<String>>;

    /// Fails tasks stuck in DOWNLOADING from a previous run and returns the
    /// ids of their jobs.
    fn fail_orphaned_downloads(&self, message: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    paths: AppPaths,
}

impl SqliteStore {
    pub fn open(paths: AppPaths) -> Result<Self> {
        db::ensure_schema(&paths)?;
        Ok(Self { paths })
    }

    fn conn(&self) -> Result<Connection> {
        db::open(&self.paths)
    }
}

const TASK_COLUMNS: &str = r#"
  t.id,
  t.job_id,
  t.video_id,
  t.title,
  t.thumbnail_url,
  t.description,
  t.status,
  t.progress,
  t.file_path,
  t.file_size,
  t.error_message,
  t.warnings_json,
  t.created_at_ms,
  t.updated_at_ms"#;

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<DownloadTask> {
    let status: String = row.get(6)?;
    let file_size: Option<i64> = row.get(9)?;
    let warnings_json: String = row.get(11)?;
    Ok(DownloadTask {
        id: row.get(0)?,
        job_id: row.get(1)?,
        video_id: row.get(2)?,
        title: row.get(3)?,
        thumbnail_url: row.get(4)?,
        description: row.get(5)?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Failed),
        progress: row.get(7)?,
        file_path: row.get(8)?,
        file_size: file_size.map(|v| v.max(0) as u64),
        error_message: row.get(10)?,
        warnings: serde_json::from_str(&warnings_json).unwrap_or_default(),
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
    })
}

fn job_status_from_row(value: &str) -> JobStatus {
    JobStatus::from_str(value).unwrap_or(JobStatus::Pending)
}

impl TaskStore for SqliteStore {
    fn fetch_pending_tasks(&self) -> Result<Vec<PendingTask>> {
        let conn = self.conn()?;
        let sql = format!(
            r#"
SELECT
{TASK_COLUMNS},
  j.status,
  j.config_name
FROM download_task t
JOIN download_job j ON j.id = t.job_id
WHERE t.status = ?1
ORDER BY t.seq ASC
"#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![TaskStatus::Pending.as_str()], |row| {
                let task = row_to_task(row)?;
                let job_status: String = row.get(14)?;
                Ok(PendingTask {
                    job: JobSummary {
                        id: task.job_id.clone(),
                        status: job_status_from_row(&job_status),
                        config_name: row.get(15)?,
                    },
                    task,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn fetch_job_with_tasks(&self, job_id: &str) -> Result<Option<DownloadJob>> {
        let conn = self.conn()?;
        let header = conn
            .query_row(
                "SELECT id, status, config_name, created_at_ms, updated_at_ms FROM download_job WHERE id=?1",
                params![job_id],
                |row| {
                    let status: String = row.get(1)?;
                    Ok(DownloadJob {
                        id: row.get(0)?,
                        status: job_status_from_row(&status),
                        config_name: row.get(2)?,
                        tasks: Vec::new(),
                        created_at_ms: row.get(3)?,
                        updated_at_ms: row.get(4)?,
                    })
                },
            )
            .optional()?;
        let Some(mut job) = header else {
            return Ok(None);
        };

        let sql = format!("SELECT {TASK_COLUMNS} FROM download_task t WHERE t.job_id=?1 ORDER BY t.seq ASC");
        let mut stmt = conn.prepare(&sql)?;
        job.tasks = stmt
            .query_map(params![job_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(job))
    }

    fn fetch_task(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM download_task t WHERE t.id=?1");
        let task = conn
            .query_row(&sql, params![task_id], row_to_task)
            .optional()?;
        Ok(task)
    }

    fn claim_task(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE download_task SET status=?1, updated_at_ms=?2 WHERE id=?3 AND status=?4",
            params![
                TaskStatus::Downloading.as_str(),
                now_ms(),
                task_id,
                TaskStatus::Pending.as_str()
            ],
        )?;
        Ok(updated == 1)
    }

    fn finish_task(&self, task: &DownloadTask) -> Result<bool> {
        if !TaskStatus::Downloading.can_transition_to(task.status) {
            return Err(EngineError::InvalidTransition {
                task_id: task.id.clone(),
                to: task.status.as_str(),
            });
        }
        let conn = self.conn()?;
        let warnings_json = serde_json::to_string(&task.warnings)?;
        let updated = conn.execute(
            r#"
UPDATE download_task
SET
  status=?1,
  progress=?2,
  file_path=?3,
  file_size=?4,
  error_message=?5,
  warnings_json=?6,
  updated_at_ms=?7
WHERE id=?8 AND status=?9
"#,
            params![
                task.status.as_str(),
                task.progress,
                task.file_path,
                task.file_size.map(|v| v as i64),
                task.error_message,
                warnings_json,
                now_ms(),
                task.id,
                TaskStatus::Downloading.as_str()
            ],
        )?;
        Ok(updated == 1)
    }

    fn update_task_progress(&self, task_id: &str, progress: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE download_task SET progress=?1, updated_at_ms=?2 WHERE id=?3 AND status=?4",
            params![
                progress.clamp(0.0, 100.0),
                now_ms(),
                task_id,
                TaskStatus::Downloading.as_str()
            ],
        )?;
        Ok(())
    }

    fn save_job_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE download_job SET status=?1, updated_at_ms=?2 WHERE id=?3",
            params![status.as_str(), now_ms(), job_id],
        )?;
        if updated == 0 {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn create_job(&self, config_name: Option<&str>, tasks: Vec<NewTask>) -> Result<DownloadJob> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let job_id = Uuid::new_v4().to_string();
        let created_at_ms = now_ms();
        let config_name = config_name
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        tx.execute(
            "INSERT INTO download_job (id, status, config_name, created_at_ms, updated_at_ms) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![&job_id, JobStatus::Pending.as_str(), &config_name, created_at_ms],
        )?;

        let mut rows = Vec::with_capacity(tasks.len());
        for new_task in tasks {
            let task = DownloadTask {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.clone(),
                video_id: new_task.video_id,
                title: new_task.title,
                thumbnail_url: new_task.thumbnail_url,
                description: new_task.description,
                status: TaskStatus::Pending,
                progress: None,
                file_path: None,
                file_size: None,
                error_message: None,
                warnings: Vec::new(),
                created_at_ms,
                updated_at_ms: created_at_ms,
            };
            tx.execute(
                r#"
INSERT INTO download_task (
  id,
  job_id,
  video_id,
  title,
  thumbnail_url,
  description,
  status,
  created_at_ms,
  updated_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
"#,
                params![
                    &task.id,
                    &task.job_id,
                    &task.video_id,
                    &task.title,
                    &task.thumbnail_url,
                    &task.description,
                    task.status.as_str(),
                    created_at_ms
                ],
            )?;
            rows.push(task);
        }
        tx.commit()?;

        Ok(DownloadJob {
            id: job_id,
            status: JobStatus::Pending,
            config_name,
            tasks: rows,
            created_at_ms,
            updated_at_ms: created_at_ms,
        })
    }

    fn delete_task(&self, task_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let job_id: Option<String> = conn
            .query_row(
                "SELECT job_id FROM download_task WHERE id=?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        if job_id.is_some() {
            conn.execute("DELETE FROM download_task WHERE id=?1", params![task_id])?;
        }
        Ok(job_id)
    }

    fn fail_orphaned_downloads(&self, message: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let job_ids = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT job_id FROM download_task WHERE status=?1 ORDER BY job_id",
            )?;
            let ids = stmt
                .query_map(params![TaskStatus::Downloading.as_str()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };
        tx.execute(
            r#"
UPDATE download_task
SET status=?1, error_message=?2, file_path=NULL, file_size=NULL, updated_at_ms=?3
WHERE status=?4
"#,
            params![
                TaskStatus::Failed.as_str(),
                message,
                now_ms(),
                TaskStatus::Downloading.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(job_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(video_id: &str) -> NewTask {
        NewTask {
            video_id: video_id.to_string(),
            title: format!("Video {video_id}"),
            thumbnail_url: None,
            description: Some("desc".to_string()),
        }
    }

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(AppPaths::new(dir.path().to_path_buf())).expect("store");
        (dir, store)
    }

    #[test]
    fn pending_fetch_joins_job_and_keeps_insertion_order() {
        let (_dir, store) = open_store();
        let first = store
            .create_job(Some("hq"), vec![new_task("a"), new_task("b")])
            .expect("job1");
        let second = store.create_job(None, vec![new_task("c")]).expect("job2");

        let pending = store.fetch_pending_tasks().expect("pending");
        let ids: Vec<&str> = pending.iter().map(|p| p.task.video_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(pending[0].job.id, first.id);
        assert_eq!(pending[0].job.config_name.as_deref(), Some("hq"));
        assert_eq!(pending[2].job.id, second.id);
        assert!(pending[2].job.config_name.is_none());
    }

    #[test]
    fn claim_is_exclusive() {
        let (_dir, store) = open_store();
        let job = store.create_job(None, vec![new_task("a")]).expect("job");
        let task_id = &job.tasks[0].id;

        assert!(store.claim_task(task_id).expect("claim"));
        assert!(!store.claim_task(task_id).expect("claim again"));
        assert!(store.fetch_pending_tasks().expect("pending").is_empty());
        let task = store.fetch_task(task_id).expect("fetch").expect("exists");
        assert_eq!(task.status, TaskStatus::Downloading);
    }

    #[test]
    fn finish_task_persists_terminal_fields_and_warnings() {
        let (_dir, store) = open_store();
        let job = store.create_job(None, vec![new_task("a")]).expect("job");
        let mut task = job.tasks[0].clone();
        store.claim_task(&task.id).expect("claim");
        store.update_task_progress(&task.id, 55.5).expect("progress");
        assert_eq!(
            store.fetch_task(&task.id).expect("fetch").expect("exists").progress,
            Some(55.5)
        );

        task.status = TaskStatus::Downloaded;
        task.progress = Some(100.0);
        task.file_path = Some("/x/a.mp4".to_string());
        task.file_size = Some(1234);
        task.warnings = vec!["no thumbnail".to_string()];
        assert!(store.finish_task(&task).expect("finish"));

        let job = store.fetch_job_with_tasks(&job.id).expect("fetch").expect("job");
        let saved = &job.tasks[0];
        assert_eq!(saved.status, TaskStatus::Downloaded);
        assert_eq!(saved.file_size, Some(1234));
        assert_eq!(saved.file_path.as_deref(), Some("/x/a.mp4"));
        assert_eq!(saved.warnings, vec!["no thumbnail".to_string()]);
    }

    #[test]
    fn finish_task_only_moves_out_of_downloading() {
        let (_dir, store) = open_store();
        let job = store.create_job(None, vec![new_task("a")]).expect("job");
        let mut task = job.tasks[0].clone();

        task.status = TaskStatus::Downloaded;
        assert!(!store.finish_task(&task).expect("pending row"));

        store.claim_task(&task.id).expect("claim");
        task.status = TaskStatus::Failed;
        task.error_message = Some("boom".to_string());
        assert!(store.finish_task(&task).expect("finish"));

        task.status = TaskStatus::Downloaded;
        task.error_message = None;
        assert!(!store.finish_task(&task).expect("already failed"));
        let stored = store.fetch_task(&task.id).expect("fetch").expect("exists");
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));

        task.status = TaskStatus::Pending;
        assert!(matches!(
            store.finish_task(&task),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn progress_is_only_written_while_downloading() {
        let (_dir, store) = open_store();
        let job = store.create_job(None, vec![new_task("a")]).expect("job");
        store.update_task_progress(&job.tasks[0].id, 10.0).expect("progress");
        let task = store.fetch_task(&job.tasks[0].id).expect("fetch").expect("exists");
        assert!(task.progress.is_none());
    }

    #[test]
    fn missing_rows_are_reported() {
        let (_dir, store) = open_store();
        assert!(store.fetch_job_with_tasks("nope").expect("fetch").is_none());
        assert!(matches!(
            store.save_job_status("nope", JobStatus::Completed),
            Err(EngineError::JobNotFound(_))
        ));
        assert!(store.delete_task("nope").expect("delete").is_none());
    }

    #[test]
    fn delete_task_returns_owning_job() {
        let (_dir, store) = open_store();
        let job = store
            .create_job(None, vec![new_task("a"), new_task("b")])
            .expect("job");
        let owner = store.delete_task(&job.tasks[0].id).expect("delete");
        assert_eq!(owner.as_deref(), Some(job.id.as_str()));
        let job = store.fetch_job_with_tasks(&job.id).expect("fetch").expect("job");
        assert_eq!(job.tasks.len(), 1);
        assert_eq!(job.tasks[0].video_id, "b");
    }

    #[test]
    fn orphaned_downloads_are_failed_after_restart() {
        let (_dir, store) = open_store();
        let job = store
            .create_job(None, vec![new_task("a"), new_task("b")])
            .expect("job");
        store.claim_task(&job.tasks[0].id).expect("claim");

        let jobs = store
            .fail_orphaned_downloads("interrupted by engine shutdown")
            .expect("recover");
        assert_eq!(jobs, vec![job.id.clone()]);

        let task = store.fetch_task(&job.tasks[0].id).expect("fetch").expect("exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("interrupted by engine shutdown")
        );
        let untouched = store.fetch_task(&job.tasks[1].id).expect("fetch").expect("exists");
        assert_eq!(untouched.status, TaskStatus::Pending);
    }
}
