use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Downloaded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Downloaded => "DOWNLOADED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TaskStatus::Pending),
            "DOWNLOADING" => Some(TaskStatus::Downloading),
            "DOWNLOADED" => Some(TaskStatus::Downloaded),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// PENDING -> DOWNLOADING -> {DOWNLOADED, FAILED}; nothing else.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Downloading)
                | (TaskStatus::Downloading, TaskStatus::Downloaded)
                | (TaskStatus::Downloading, TaskStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::PartiallyCompleted => "PARTIALLY_COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(JobStatus::Pending),
            "IN_PROGRESS" => Some(JobStatus::InProgress),
            "COMPLETED" => Some(JobStatus::Completed),
            "PARTIALLY_COMPLETED" => Some(JobStatus::PartiallyCompleted),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub job_id: String,
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub progress: Option<f64>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl DownloadTask {
    pub fn video_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub status: JobStatus,
    pub config_name: Option<String>,
    pub tasks: Vec<DownloadTask>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Job columns carried along with a pending task by the joined fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub config_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task: DownloadTask,
    pub job: JobSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
}

/// Outcome of one execution attempt. Never persisted on its own; folded into
/// the task by [`DownloadResult::apply_to`].
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub success: bool,
    pub video_id: String,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
}

impl DownloadResult {
    pub fn new(video_id: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            ..Self::default()
        }
    }

    pub fn failed(video_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            video_id: video_id.to_string(),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn terminal_status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Downloaded
        } else {
            TaskStatus::Failed
        }
    }

    /// File fields are set only on DOWNLOADED, the error only on FAILED.
    pub fn apply_to(&self, task: &mut DownloadTask) {
        task.status = self.terminal_status();
        task.warnings.extend(self.warnings.iter().cloned());
        if self.success {
            task.file_path = self
                .file_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string());
            task.file_size = Some(self.file_size.unwrap_or(0));
            task.error_message = None;
            task.progress = Some(100.0);
        } else {
            task.file_path = None;
            task.file_size = None;
            task.error_message = Some(
                self.error_message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "download failed".to_string()),
            );
        }
    }
}
