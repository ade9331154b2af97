use crate::paths::AppPaths;
use crate::{now_ms, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TASK_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const TASK_LOG_MAX_BACKUPS: usize = 2;
const TASK_LOG_MAX_AGE_DAYS: u64 = 30;
const TASK_LOG_TOTAL_CAP_BYTES: u64 = 512 * 1024 * 1024;
const MAX_OUTPUT_LINE_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// JSONL event log for one task at `logs/tasks/<task_id>.jsonl`.
///
/// Writes never fail the caller; an unwritable log only produces a
/// `log::debug!` line.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: PathBuf,
    task_id: String,
}

impl TaskLog {
    pub fn new(paths: &AppPaths, task_id: &str) -> Self {
        Self {
            path: paths.task_log_path(task_id),
            task_id: task_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn event(&self, level: Level, event: &str, data: serde_json::Value) {
        if let Err(err) = self.append(level, event, data) {
            log::debug!("task {}: could not write task log: {err}", self.task_id);
        }
    }

    pub fn output(&self, line: &str) {
        let line: String = line.chars().take(MAX_OUTPUT_LINE_CHARS).collect();
        self.event(Level::Debug, "output", serde_json::json!({ "line": line }));
    }

    fn append(&self, level: Level, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "task_id": self.task_id,
            "level": level.as_str(),
            "event": event,
            "data": data
        })
        .to_string();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rotate_if_needed(&self.path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

/// Shifts `<log>.1 .. <log>.N-1` up by one and moves the live log to
/// `<log>.1` once it reaches the rotation size. The oldest backup is lost.
fn rotate_if_needed(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= TASK_LOG_ROTATE_BYTES => {}
        _ => return Ok(()),
    }
    shift_backups(path, TASK_LOG_MAX_BACKUPS)?;
    Ok(())
}

fn shift_backups(path: &Path, keep: usize) -> std::io::Result<()> {
    if keep == 0 {
        return match std::fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        };
    }
    let _ = std::fs::remove_file(backup_path(path, keep));
    for n in (1..keep).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            std::fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    std::fs::rename(path, backup_path(path, 1))
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    path.with_file_name(name)
}

/// Drops task logs older than the retention window, then the oldest ones
/// until the directory fits under the size cap.
pub fn prune_task_logs(paths: &AppPaths) -> Result<usize> {
    let dir = paths.task_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(TASK_LOG_MAX_AGE_DAYS * 24 * 60 * 60))
        .unwrap_or(UNIX_EPOCH);

    let mut removed = 0_usize;
    let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for entry in std::fs::read_dir(&dir)?.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let path = entry.path();
        if modified < cutoff {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            continue;
        }
        candidates.push((path, modified, meta.len()));
    }

    candidates.sort_by_key(|(_, modified, _)| *modified);
    let mut total: u64 = candidates.iter().map(|(_, _, size)| *size).sum();
    for (path, _, size) in candidates {
        if total <= TASK_LOG_TOTAL_CAP_BYTES {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
        total = total.saturating_sub(size);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = TaskLog::new(&paths, "task-1");
        log.event(Level::Info, "task_started", serde_json::json!({ "argv": ["-U"] }));
        log.output("[download]  1.0%");

        let raw = std::fs::read_to_string(log.path()).expect("read");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "task_started");
        assert_eq!(lines[0]["task_id"], "task-1");
        assert_eq!(lines[1]["level"], "debug");
        assert_eq!(lines[1]["data"]["line"], "[download]  1.0%");
    }

    #[test]
    fn rotation_moves_live_log_to_first_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("task.jsonl");

        std::fs::write(&log, "main").expect("write main");
        std::fs::write(backup_path(&log, 1), "b1").expect("write b1");
        std::fs::write(backup_path(&log, 2), "b2").expect("write b2");

        shift_backups(&log, 2).expect("rotate");

        assert!(!log.exists());
        assert_eq!(
            std::fs::read_to_string(backup_path(&log, 1)).expect("r1"),
            "main"
        );
        assert_eq!(
            std::fs::read_to_string(backup_path(&log, 2)).expect("r2"),
            "b1"
        );
    }

    #[test]
    fn prune_keeps_recent_logs_under_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        TaskLog::new(&paths, "a").event(Level::Info, "x", serde_json::json!({}));
        assert_eq!(prune_task_logs(&paths).expect("prune"), 0);
        assert!(paths.task_log_path("a").exists());
    }
}
