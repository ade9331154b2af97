use crate::models::{JobStatus, TaskStatus};
use crate::store::TaskStore;
use crate::{EngineError, Result};

/// Job status as a pure function of its task statuses.
///
/// * no tasks, or every task terminal with none failed -> COMPLETED
/// * every task terminal, some DOWNLOADED and some FAILED -> PARTIALLY_COMPLETED
/// * every task terminal, none DOWNLOADED -> FAILED
/// * every task still PENDING -> PENDING
/// * anything else -> IN_PROGRESS
pub fn compute_job_status<I>(statuses: I) -> JobStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut total = 0_usize;
    let mut pending = 0_usize;
    let mut downloaded = 0_usize;
    let mut failed = 0_usize;
    for status in statuses {
        total += 1;
        match status {
            TaskStatus::Pending => pending += 1,
            TaskStatus::Downloading => {}
            TaskStatus::Downloaded => downloaded += 1,
            TaskStatus::Failed => failed += 1,
        }
    }

    if total == 0 {
        return JobStatus::Completed;
    }
    if downloaded + failed == total {
        return match (downloaded, failed) {
            (_, 0) => JobStatus::Completed,
            (0, _) => JobStatus::Failed,
            _ => JobStatus::PartiallyCompleted,
        };
    }
    if pending == total {
        return JobStatus::Pending;
    }
    JobStatus::InProgress
}

/// Re-reads the job with all of its tasks and stores the derived status.
/// A missing job is a caller bug and is reported, not retried.
pub fn recompute_job_status(store: &dyn TaskStore, job_id: &str) -> Result<JobStatus> {
    let job = store
        .fetch_job_with_tasks(job_id)?
        .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
    let status = compute_job_status(job.tasks.iter().map(|t| t.status));
    if status != job.status {
        store.save_job_status(job_id, status)?;
        log::debug!("job {job_id}: {} -> {}", job.status.as_str(), status.as_str());
    }
    Ok(status)
}
