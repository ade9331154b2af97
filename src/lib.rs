pub mod aggregator;
pub mod best_effort;
pub mod command;
pub mod config;
pub mod db;
mod error;
pub mod executor;
pub mod models;
pub mod parser;
pub mod paths;
pub mod pool;
pub mod process;
pub mod reporter;
pub mod scheduler;
pub mod store;
pub mod task_log;
pub mod throttle;

pub use error::{EngineError, Result};

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
