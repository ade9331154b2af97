use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid pool size: core={core}, max={max}")]
    InvalidPoolSize { core: usize, max: usize },

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("download job not found: {0}")]
    JobNotFound(String),

    #[error("download task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} cannot be finished as {to}")]
    InvalidTransition { task_id: String, to: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("interrupted while running {0}")]
    Interrupted(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
