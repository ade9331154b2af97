use crate::{EngineError, Result};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread pool with a live-adjustable size and an unbounded FIFO queue.
///
/// Like a core/max executor over an unbounded queue, at most `core_size`
/// jobs run at once; `max_size` is an upper bound `core_size` may never
/// exceed. Each setter rejects a value that would break `core <= max`, which
/// is why growing must raise max first and shrinking must lower core first.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    state: Mutex<PoolState>,
    changed: Condvar,
}

struct PoolState {
    core_size: usize,
    max_size: usize,
    active: usize,
    queue: VecDeque<Job>,
    shutdown: bool,
    completed: u64,
}

impl PoolState {
    fn limit(&self) -> usize {
        self.core_size.min(self.max_size)
    }
}

/// Point-in-time view for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub core_size: usize,
    pub max_size: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(EngineError::InvalidPoolSize { core: 0, max: 0 });
        }
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(PoolState {
                    core_size: size,
                    max_size: size,
                    active: 0,
                    queue: VecDeque::new(),
                    shutdown: false,
                    completed: 0,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    pub fn core_size(&self) -> usize {
        self.shared.lock().core_size
    }

    pub fn max_size(&self) -> usize {
        self.shared.lock().max_size
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            core_size: state.core_size,
            max_size: state.max_size,
            active: state.active,
            queued: state.queue.len(),
            completed: state.completed,
        }
    }

    /// Rejects 0 and anything above the current max.
    pub fn set_core_size(&self, core: usize) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if core == 0 || core > state.max_size {
                return Err(EngineError::InvalidPoolSize {
                    core,
                    max: state.max_size,
                });
            }
            state.core_size = core;
        }
        Shared::start_ready(&self.shared);
        Ok(())
    }

    /// Rejects 0 and anything below the current core size.
    pub fn set_max_size(&self, max: usize) -> Result<()> {
        let mut state = self.shared.lock();
        if max == 0 || max < state.core_size {
            return Err(EngineError::InvalidPoolSize {
                core: state.core_size,
                max,
            });
        }
        state.max_size = max;
        Ok(())
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(EngineError::PoolShutdown);
            }
            state.queue.push_back(Box::new(job));
        }
        Shared::start_ready(&self.shared);
        Ok(())
    }

    /// Blocks until nothing is running or queued. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.active > 0 || !state.queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Stops accepting work and drops queued jobs. Running jobs finish.
    /// Returns how many queued jobs were dropped. The dropped jobs are
    /// released after the pool lock, so their destructors may block.
    pub fn shutdown(&self) -> usize {
        let dropped: Vec<Job> = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
            state.queue.drain(..).collect()
        };
        let count = dropped.len();
        drop(dropped);
        count
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts queued jobs on new threads while there is room under the limit.
    fn start_ready(shared: &Arc<Shared>) {
        let mut starting: Vec<Job> = Vec::new();
        {
            let mut state = shared.lock();
            while !state.shutdown && state.active < state.limit() {
                let Some(job) = state.queue.pop_front() else {
                    break;
                };
                state.active += 1;
                starting.push(job);
            }
        }

        for job in starting {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker", shared.name))
                .spawn(move || Shared::worker_loop(worker_shared, job));
            if let Err(err) = spawned {
                log::error!("{}: could not start worker thread: {err}", shared.name);
                let mut state = shared.lock();
                state.active = state.active.saturating_sub(1);
                shared.changed.notify_all();
            }
        }
    }

    /// Runs `first`, then keeps pulling queued jobs while this worker still
    /// fits under the (possibly lowered) limit.
    fn worker_loop(shared: Arc<Shared>, first: Job) {
        let mut next = Some(first);
        while let Some(job) = next.take() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("{}: job panicked", shared.name);
            }

            let mut state = shared.lock();
            state.completed += 1;
            if !state.shutdown && state.active <= state.limit() {
                next = state.queue.pop_front();
            }
            if next.is_none() {
                state.active -= 1;
            }
            shared.changed.notify_all();
        }
    }
}
