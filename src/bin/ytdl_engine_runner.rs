use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ytdl_engine::config::FileConfigResolver;
use ytdl_engine::paths::AppPaths;
use ytdl_engine::process::{Interrupt, SystemProcessRunner};
use ytdl_engine::reporter::{HttpStatusReporter, NoopStatusReporter, StatusReporter};
use ytdl_engine::scheduler::{Scheduler, TickOutcome};
use ytdl_engine::store::SqliteStore;

const DEFAULT_ONCE_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const INTERRUPT_GRACE_SECS: u64 = 10;

fn main() -> Result<(), String> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut status_api: Option<String> = None;
    let mut once = false;
    let mut once_timeout = Duration::from_secs(DEFAULT_ONCE_TIMEOUT_SECS);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--status-api" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--status-api requires a value".to_string())?;
                status_api = Some(v.to_string());
            }
            "--once" => once = true,
            "--once-timeout" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .ok_or_else(|| "--once-timeout requires a value".to_string())?
                    .parse()
                    .map_err(|_| "--once-timeout must be a number of seconds".to_string())?;
                once_timeout = Duration::from_secs(secs);
            }
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    let reporter: Arc<dyn StatusReporter> = match status_api {
        Some(url) => Arc::new(HttpStatusReporter::new(&url).map_err(|e| e.to_string())?),
        None => Arc::new(NoopStatusReporter),
    };
    let store = SqliteStore::open(paths.clone()).map_err(|e| e.to_string())?;
    let interrupt = Interrupt::new();
    let scheduler = Scheduler::new(
        paths.clone(),
        Arc::new(store),
        Arc::new(FileConfigResolver::new(paths.clone())),
        Arc::new(SystemProcessRunner::new(interrupt.clone())),
        reporter,
    )
    .map_err(|e| e.to_string())?;

    println!("Base dir: {}", paths.base_dir.to_string_lossy());

    if once {
        match scheduler
            .process_pending_tasks_once()
            .map_err(|e| e.to_string())?
        {
            TickOutcome::Dispatched(n) => println!("Dispatched {n} tasks"),
            TickOutcome::Idle => println!("No pending tasks"),
            TickOutcome::Skipped { queued } => println!("Skipped: {queued} tasks queued"),
        }
        if !scheduler.pool().wait_idle(once_timeout) {
            // Kills running yt-dlp children; their tasks finish as FAILED.
            interrupt.raise();
            scheduler
                .pool()
                .wait_idle(Duration::from_secs(INTERRUPT_GRACE_SECS));
            return Err("timed out waiting for downloads to finish".to_string());
        }
        return Ok(());
    }

    if !scheduler.start_if_enabled().map_err(|e| e.to_string())? {
        println!("auto_start is off in the default profile; use --once for a single pass");
        return Ok(());
    }
    loop {
        std::thread::park();
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("YTDL_ENGINE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }
    std::env::current_dir().ok().map(|d| d.join("ytdl-engine"))
}

fn print_help() {
    println!(
        r#"ytdl_engine_runner

Runs the download engine against a base directory:
  <base>/db/engine.sqlite              jobs and tasks
  <base>/config/download_profiles.json download profiles
  <base>/logs/tasks/<task>.jsonl       per-task event logs

Usage:
  ytdl_engine_runner [--base-dir <path>] [--status-api <url>] [--once [--once-timeout <secs>]]

Flags:
  --base-dir <path>    Base directory (or YTDL_ENGINE_BASE_DIR)
  --status-api <url>   POST status updates to <url>/api/videos/<id>/download-status
  --once               Run a single pass, wait for its downloads, then exit
  --once-timeout <s>   With --once, kill downloads still running after <s> seconds
  -h, --help           Show this help
"#
    );
}
