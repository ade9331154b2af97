use crate::aggregator::recompute_job_status;
use crate::best_effort::{log_on_error, Warnings};
use crate::command::{self, DownloadCommand};
use crate::config::ResolvedConfiguration;
use crate::models::{DownloadResult, DownloadTask, JobStatus, TaskStatus};
use crate::parser::{LineEvent, OutputParser};
use crate::paths::AppPaths;
use crate::process::{OutputMode, ProcessRunner};
use crate::reporter::{build_http_agent, StatusReporter};
use crate::store::TaskStore;
use crate::task_log::{Level, TaskLog};
use crate::{EngineError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const THUMBNAIL_TIMEOUT_SECS: u64 = 30;
const ERROR_MARKER: &str = "ERROR:";
const WARNING_MARKER: &str = "WARNING:";

/// Runs one task's yt-dlp process and folds the outcome back into storage.
pub struct TaskExecutor {
    paths: AppPaths,
    runner: Arc<dyn ProcessRunner>,
    store: Arc<dyn TaskStore>,
    reporter: Arc<dyn StatusReporter>,
    http: ureq::Agent,
}

impl TaskExecutor {
    pub fn new(
        paths: AppPaths,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn TaskStore>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            paths,
            runner,
            store,
            reporter,
            http: build_http_agent(THUMBNAIL_TIMEOUT_SECS),
        }
    }

    /// Claims a PENDING task and announces DOWNLOADING. Returns false when
    /// another caller already claimed it.
    pub fn begin(&self, task: &mut DownloadTask) -> Result<bool> {
        if !self.store.claim_task(&task.id)? {
            return Ok(false);
        }
        task.status = TaskStatus::Downloading;
        log_on_error(&format!("status notification for {}", task.video_id), || {
            self.reporter
                .notify_status(&task.video_id, &task.id, TaskStatus::Downloading)
        });
        Ok(true)
    }

    /// Executes and finalizes a claimed task. Never panics on task failure;
    /// only storage errors during finalization are returned.
    pub fn run_task(&self, task: &DownloadTask, config: &ResolvedConfiguration) -> Result<JobStatus> {
        let result = self.execute(task, config);
        self.finalize(&task.id, &result)
    }

    pub fn execute(&self, task: &DownloadTask, config: &ResolvedConfiguration) -> DownloadResult {
        let log = TaskLog::new(&self.paths, &task.id);
        let out_dir = command::output_dir(
            &config.effective_download_root(&self.paths),
            &task.title,
            &task.video_id,
        );

        let result = match self.try_execute(task, config, &out_dir, &log) {
            Ok(result) => result,
            Err(EngineError::Interrupted(tool)) => {
                log::warn!("task {}: interrupted while running {tool}", task.id);
                DownloadResult::failed(&task.video_id, "download interrupted")
            }
            Err(err) => {
                log::warn!("task {}: {err}", task.id);
                DownloadResult::failed(&task.video_id, err.to_string())
            }
        };

        for warning in &result.warnings {
            log.event(Level::Warn, "warning", serde_json::json!({ "message": warning }));
        }
        if result.success {
            log.event(
                Level::Info,
                "task_succeeded",
                serde_json::json!({
                    "file_path": result.file_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                    "file_size": result.file_size,
                    "warnings": result.warnings,
                }),
            );
        } else {
            log.event(
                Level::Error,
                "task_failed",
                serde_json::json!({ "error": result.error_message, "warnings": result.warnings }),
            );
            if config.auto_cleanup && out_dir.exists() {
                log_on_error(&format!("cleanup of {}", out_dir.display()), || {
                    std::fs::remove_dir_all(&out_dir).map_err(EngineError::from)
                });
            }
        }
        result
    }

    fn try_execute(
        &self,
        task: &DownloadTask,
        config: &ResolvedConfiguration,
        out_dir: &Path,
        log: &TaskLog,
    ) -> Result<DownloadResult> {
        let binary = config.effective_binary(&self.paths);
        let url = task.video_url();
        std::fs::create_dir_all(out_dir)?;

        let mut warnings = Warnings::new();
        let subtitles_available = if config.write_subtitles {
            self.probe_subtitles(&binary, &url, out_dir, &mut warnings)?
        } else {
            false
        };

        let cookies_file = if config.use_cookies {
            let path = config.effective_cookies_path(&self.paths);
            if path.is_file() {
                Some(path)
            } else {
                log::warn!("task {}: cookie file not found at {}", task.id, path.display());
                None
            }
        } else {
            None
        };

        let args = DownloadCommand {
            config,
            url: &url,
            cookies_file: cookies_file.as_deref(),
            subtitles_available,
        }
        .args();
        let mode = if config.no_progress {
            OutputMode::Chunks
        } else {
            OutputMode::Lines
        };

        log::info!("task {}: downloading {}", task.id, task.video_id);
        log.event(
            Level::Info,
            "task_started",
            serde_json::json!({
                "binary": binary.to_string_lossy(),
                "argv": args,
                "working_dir": out_dir.to_string_lossy(),
            }),
        );

        let mut parser = OutputParser::new();
        let mut output: Vec<String> = Vec::new();
        let exit_code = self.runner.run(&binary, &args, out_dir, mode, &mut |line| {
            log.output(line);
            if let Some(warning) = line.trim_start().strip_prefix(WARNING_MARKER) {
                warnings.push(warning.trim());
            }
            if let Some(LineEvent::Progress(percent)) = parser.parse_line(line) {
                log_on_error(&format!("progress update for task {}", task.id), || {
                    self.store.update_task_progress(&task.id, percent)
                });
                log.event(Level::Debug, "progress", serde_json::json!({ "percent": percent }));
            }
            output.push(line.to_string());
        })?;

        let filename = parser.filename().map(str::to_string);
        if !is_success_exit(exit_code, filename.as_deref(), &warnings) {
            let mut result = DownloadResult::failed(
                &task.video_id,
                extract_error_message(&output, exit_code),
            );
            result.warnings = warnings.into_vec();
            return Ok(result);
        }

        let mut result = DownloadResult::new(&task.video_id);
        result.success = true;
        let fallback_stem = out_dir.join(command::sanitize_title(&task.title));
        let sidecar_stem = match filename {
            Some(name) => {
                let path = out_dir.join(name);
                match std::fs::metadata(&path) {
                    Ok(meta) if meta.is_file() => {
                        result.file_size = Some(meta.len());
                        result.file_path = Some(path.clone());
                        path.with_extension("")
                    }
                    _ => {
                        warnings.push(format!(
                            "reported output file is missing: {}",
                            path.display()
                        ));
                        result.file_path = Some(path);
                        fallback_stem
                    }
                }
            }
            None => {
                warnings.push("yt-dlp reported success without an output filename");
                result.file_path = Some(out_dir.to_path_buf());
                fallback_stem
            }
        };

        self.write_sidecars(task, &sidecar_stem, &mut warnings);
        result.warnings = warnings.into_vec();
        Ok(result)
    }

    fn probe_subtitles(
        &self,
        binary: &Path,
        url: &str,
        out_dir: &Path,
        warnings: &mut Warnings,
    ) -> Result<bool> {
        let args = command::subtitle_probe_args(url);
        let available = match self.runner.run_captured(binary, &args, out_dir) {
            Ok(out) if out.exit_code == 0 => command::subtitles_available(&out.text()),
            Ok(out) => {
                warnings.push(format!("subtitle check exited with code {}", out.exit_code));
                false
            }
            Err(err @ EngineError::Interrupted(_)) => return Err(err),
            Err(err) => {
                warnings.push(format!("subtitle check failed: {err}"));
                false
            }
        };
        if !available {
            warnings.push("no subtitles available; skipping subtitle download");
        }
        Ok(available)
    }

    /// Thumbnail and description next to the media file, named `<stem>.jpg`
    /// and `<stem>.description.txt`.
    fn write_sidecars(&self, task: &DownloadTask, stem: &Path, warnings: &mut Warnings) {
        if let Some(url) = task.thumbnail_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            let dest = with_suffix(stem, ".jpg");
            warnings.attempt("thumbnail download failed", || {
                download_to_file(&self.http, url, &dest)
            });
        }
        if let Some(description) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let dest = with_suffix(stem, ".description.txt");
            warnings.attempt("description write failed", || {
                std::fs::write(&dest, description).map_err(EngineError::from)
            });
        }
    }

    /// Applies `result` to the stored task, reports it, and recomputes the job.
    /// A task that already left DOWNLOADING keeps its stored outcome and no
    /// notification is sent.
    pub fn finalize(&self, task_id: &str, result: &DownloadResult) -> Result<JobStatus> {
        let mut task = self
            .store
            .fetch_task(task_id)?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let next = result.terminal_status();
        if !task.status.can_transition_to(next) {
            log::warn!(
                "task {task_id}: already {}, dropping {} result",
                task.status.as_str(),
                next.as_str()
            );
            return recompute_job_status(self.store.as_ref(), &task.job_id);
        }
        result.apply_to(&mut task);
        if !self.store.finish_task(&task)? {
            log::warn!("task {task_id}: left DOWNLOADING before its result was saved");
            return recompute_job_status(self.store.as_ref(), &task.job_id);
        }

        let what = format!("status notification for {}", task.video_id);
        match (&task.status, task.file_path.as_deref()) {
            (TaskStatus::Downloaded, Some(file_path)) => {
                log_on_error(&what, || {
                    self.reporter.notify_completion(
                        &task.video_id,
                        &task.id,
                        task.file_size.unwrap_or(0),
                        file_path,
                        task.status,
                    )
                });
            }
            (status, _) => {
                log_on_error(&what, || {
                    self.reporter.notify_status(&task.video_id, &task.id, *status)
                });
            }
        }

        log::info!("task {task_id}: {}", task.status.as_str());
        recompute_job_status(self.store.as_ref(), &task.job_id)
    }
}

/// Exit 0, or exit 1 with a recovered filename and at least one warning.
pub fn is_success_exit(exit_code: i32, filename: Option<&str>, warnings: &Warnings) -> bool {
    match exit_code {
        0 => true,
        1 => filename.is_some_and(|f| !f.trim().is_empty()) && !warnings.is_empty(),
        _ => false,
    }
}

/// First `ERROR:` line without the marker, or a generic exit-code message.
pub fn extract_error_message(output: &[String], exit_code: i32) -> String {
    output
        .iter()
        .filter_map(|line| line.trim_start().strip_prefix(ERROR_MARKER))
        .map(str::trim)
        .find(|msg| !msg.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("yt-dlp exited with code {exit_code}"))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    path.with_file_name(format!("{name}{suffix}"))
}

fn download_to_file(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<u64> {
    let mut response = agent
        .get(url)
        .call()
        .map_err(|e| EngineError::Http(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Http(format!("GET {url} returned {status}")));
    }

    let temp_path = with_suffix(dest, ".part");
    let mut output = std::fs::File::create(&temp_path)?;
    let copied = std::io::copy(&mut response.body_mut().as_reader(), &mut output);
    let copied = match copied {
        Ok(n) => n,
        Err(err) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(EngineError::Http(format!("failed reading {url}: {err}")));
        }
    };
    output.flush()?;
    drop(output);
    std::fs::rename(&temp_path, dest)?;
    Ok(copied)
}
