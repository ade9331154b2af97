use crate::aggregator::recompute_job_status;
use crate::best_effort::log_on_error;
use crate::command;
use crate::config::{ConfigResolver, ResolvedConfiguration};
use crate::executor::TaskExecutor;
use crate::models::{DownloadResult, DownloadTask};
use crate::paths::AppPaths;
use crate::pool::WorkerPool;
use crate::process::ProcessRunner;
use crate::reporter::StatusReporter;
use crate::store::TaskStore;
use crate::task_log::prune_task_logs;
use crate::{EngineError, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Ticks skip fetching while more than this many tasks wait in the pool queue.
pub const ADMISSION_QUEUE_LIMIT: usize = 50;

const ORPHANED_TASK_MESSAGE: &str = "interrupted by engine shutdown";
const SHUTDOWN_TASK_MESSAGE: &str = "engine is shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Admission gate closed; nothing was fetched.
    Skipped { queued: usize },
    /// No pending tasks.
    Idle,
    /// Number of tasks handed to the pool.
    Dispatched(usize),
}

/// Polls for PENDING tasks and feeds them to the worker pool.
///
/// Construction fails every task a previous process left in DOWNLOADING, so
/// one store should be driven by a single `Scheduler`.
pub struct Scheduler {
    inner: Arc<Inner>,
    ticker: Mutex<Option<Ticker>>,
}

struct Inner {
    paths: AppPaths,
    store: Arc<dyn TaskStore>,
    resolver: Arc<dyn ConfigResolver>,
    runner: Arc<dyn ProcessRunner>,
    executor: Arc<TaskExecutor>,
    pool: WorkerPool,
}

struct Ticker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(
        paths: AppPaths,
        store: Arc<dyn TaskStore>,
        resolver: Arc<dyn ConfigResolver>,
        runner: Arc<dyn ProcessRunner>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let pool_size = resolver.resolve(None).thread_pool_size.max(1);
        let pool = WorkerPool::new("ytdl", pool_size)?;
        let executor = Arc::new(TaskExecutor::new(
            paths.clone(),
            runner.clone(),
            store.clone(),
            reporter,
        ));
        let inner = Inner {
            paths,
            store,
            resolver,
            runner,
            executor,
            pool,
        };
        inner.recover_orphaned_tasks()?;

        let log_paths = inner.paths.clone();
        thread::spawn(move || {
            if let Some(removed) = log_on_error("task log pruning", || prune_task_logs(&log_paths)) {
                if removed > 0 {
                    log::info!("pruned {removed} old task logs");
                }
            }
        });

        Ok(Self {
            inner: Arc::new(inner),
            ticker: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Starts periodic ticks. A second call while running does nothing.
    ///
    /// The poll interval is read once here; later config edits apply on the
    /// next `start`.
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return Ok(());
        }

        let interval = Duration::from_secs(self.inner.resolver.resolve(None).poll_interval_secs.max(1));
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let inner = self.inner.clone();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("ytdl-scheduler".to_string())
            .spawn(move || run_ticks(inner, interval, thread_stop))?;

        log::info!("scheduler started (poll every {}s)", interval.as_secs());
        *ticker = Some(Ticker { stop, handle });
        Ok(())
    }

    /// Starts periodic ticks only when `auto_start` is set in the default
    /// configuration. Returns whether the scheduler is running afterwards.
    pub fn start_if_enabled(&self) -> Result<bool> {
        if !self.inner.resolver.resolve(None).auto_start {
            log::info!("auto_start is off; scheduler not started");
            return Ok(self.is_running());
        }
        self.start()?;
        Ok(true)
    }

    /// Cancels future ticks. Waits for a tick already in progress to return
    /// but never touches dispatched downloads. The ticker slot stays locked
    /// until the old thread is joined, so a concurrent `start` cannot overlap it.
    pub fn stop(&self) {
        let mut slot = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ticker) = slot.take() else {
            return;
        };
        {
            let (flag, cvar) = &*ticker.stop;
            *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
            cvar.notify_all();
        }
        if ticker.handle.join().is_err() {
            log::error!("scheduler thread panicked");
        }
        log::info!("scheduler stopped");
    }

    /// Stops ticking and closes the worker pool. Tasks still queued are
    /// failed with "engine is shutting down"; running downloads finish.
    /// Later ticks fail whatever they claim the same way. Returns how many
    /// queued tasks were failed.
    pub fn shutdown(&self) -> usize {
        self.stop();
        let dropped = self.inner.pool.shutdown();
        if dropped > 0 {
            log::warn!("failed {dropped} queued tasks on shutdown");
        }
        dropped
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One tick: sizing, admission, then dispatch of every PENDING task.
    pub fn process_pending_tasks_once(&self) -> Result<TickOutcome> {
        self.inner.tick()
    }

    /// Deletes a task and recomputes its job. Returns false if it did not exist.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        let Some(job_id) = self.inner.store.delete_task(task_id)? else {
            return Ok(false);
        };
        recompute_job_status(self.inner.store.as_ref(), &job_id)?;
        Ok(true)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_ticks(inner: Arc<Inner>, interval: Duration, stop: Arc<(Mutex<bool>, Condvar)>) {
    let (flag, cvar) = &*stop;
    loop {
        if let Err(err) = inner.tick() {
            log::error!("scheduler tick failed: {err}");
        }

        let mut stopped = flag.lock().unwrap_or_else(|e| e.into_inner());
        let mut remaining = interval;
        while !*stopped && !remaining.is_zero() {
            let started = std::time::Instant::now();
            stopped = match cvar.wait_timeout(stopped, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            remaining = remaining.saturating_sub(started.elapsed());
        }
        if *stopped {
            return;
        }
    }
}

/// A claimed task handed to the pool. If it is dropped without running
/// (pool shut down, or the submit refused) the task is finalized as FAILED
/// instead of staying in DOWNLOADING.
struct Dispatch {
    executor: Arc<TaskExecutor>,
    task: DownloadTask,
    config: ResolvedConfiguration,
    started: bool,
}

impl Dispatch {
    fn run(mut self) {
        self.started = true;
        if let Err(err) = self.executor.run_task(&self.task, &self.config) {
            log::error!("task {}: could not finalize: {err}", self.task.id);
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        if self.started {
            return;
        }
        let result = DownloadResult::failed(&self.task.video_id, SHUTDOWN_TASK_MESSAGE);
        log_on_error(&format!("task {} finalize", self.task.id), || {
            self.executor.finalize(&self.task.id, &result)
        });
    }
}

impl Inner {
    fn tick(&self) -> Result<TickOutcome> {
        let config = self.resolver.resolve(None);

        if let Err(err) = resize_pool(&self.pool, config.thread_pool_size) {
            log::warn!("could not resize worker pool: {err}");
        }

        let queued = self.pool.queue_depth();
        if queued > ADMISSION_QUEUE_LIMIT {
            log::info!("{queued} tasks already queued; skipping fetch this tick");
            return Ok(TickOutcome::Skipped { queued });
        }

        let pending = self.store.fetch_pending_tasks()?;
        if pending.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        if config.check_for_updates {
            self.check_for_update(&config);
        }

        let mut dispatched = 0_usize;
        for entry in pending {
            let mut task = entry.task;
            match self.executor.begin(&mut task) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    log::warn!("task {}: could not claim: {err}", task.id);
                    continue;
                }
            }
            log_on_error(&format!("job {} status", task.job_id), || {
                recompute_job_status(self.store.as_ref(), &task.job_id)
            });

            let task_id = task.id.clone();
            let dispatch = Dispatch {
                executor: self.executor.clone(),
                config: self.resolver.resolve(entry.job.config_name.as_deref()),
                task,
                started: false,
            };
            match self.pool.submit(move || dispatch.run()) {
                Ok(()) => dispatched += 1,
                Err(err) => log::warn!("task {task_id}: {err}"),
            }
        }

        if dispatched > 0 {
            let stats = self.pool.stats();
            log::info!(
                "dispatched {dispatched} tasks ({} running, {} queued)",
                stats.active,
                stats.queued
            );
        }
        Ok(TickOutcome::Dispatched(dispatched))
    }

    fn check_for_update(&self, config: &ResolvedConfiguration) {
        let binary = config.effective_binary(&self.paths);
        log_on_error("yt-dlp update check", || {
            let out = self.runner.run_captured(
                &binary,
                &command::update_check_args(),
                &self.paths.base_dir,
            )?;
            if out.exit_code != 0 {
                return Err(EngineError::ExternalToolFailed {
                    tool: binary.to_string_lossy().to_string(),
                    code: Some(out.exit_code),
                    stderr: out.lines.last().cloned().unwrap_or_default(),
                });
            }
            Ok(())
        });
    }

    fn recover_orphaned_tasks(&self) -> Result<()> {
        let job_ids = self.store.fail_orphaned_downloads(ORPHANED_TASK_MESSAGE)?;
        if job_ids.is_empty() {
            return Ok(());
        }
        log::warn!("marked downloads from a previous run as failed in {} jobs", job_ids.len());
        for job_id in job_ids {
            log_on_error(&format!("job {job_id} status"), || {
                recompute_job_status(self.store.as_ref(), &job_id)
            });
        }
        Ok(())
    }
}

/// Moves the pool to `desired` threads. Growing raises max before core,
/// shrinking lowers core before max, so neither step is rejected.
/// Returns whether anything changed.
pub fn resize_pool(pool: &WorkerPool, desired: usize) -> Result<bool> {
    let current = pool.core_size();
    if desired == 0 || desired == current {
        return Ok(false);
    }
    if desired > current {
        pool.set_max_size(desired)?;
        pool.set_core_size(desired)?;
    } else {
        pool.set_core_size(desired)?;
        pool.set_max_size(desired)?;
    }
    log::info!("worker pool resized {current} -> {desired}");
    Ok(true)
}
