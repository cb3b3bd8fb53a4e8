//! Elastic dispatch pool for inbound requests.
//!
//! Jobs are independent units of work, not per-connection loops, so a job
//! may block on a nested synchronous call while other workers keep draining
//! the queue. The pool grows when the backlog outruns idle workers (up to
//! `max_workers`) and shrinks back to `min_workers` after `idle_timeout`.
//! A panicking job is logged and does not take its worker down.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::types::{Error, Result, WorkerPoolConfig};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    idle: usize,
    next_worker: usize,
    threads: HashSet<ThreadId>,
    handles: HashMap<usize, JoinHandle<()>>,
    shutting_down: bool,
}

struct PoolInner {
    name: String,
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    /// Signalled when work is queued or the pool shuts down.
    work: Condvar,
    /// Signalled when a worker takes a job or exits.
    progress: Condvar,
    processed: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub queued: usize,
    pub processed: u64,
    pub panicked: u64,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Self> {
        let mut config = config;
        config.max_workers = config.max_workers.max(1);
        config.min_workers = config.min_workers.min(config.max_workers);
        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                state: Mutex::new(PoolState::default()),
                work: Condvar::new(),
                progress: Condvar::new(),
                processed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
        };
        {
            let mut state = pool.inner.state.lock();
            for _ in 0..pool.inner.config.min_workers {
                spawn_worker(&pool.inner, &mut state)?;
            }
        }
        Ok(pool)
    }

    /// Queue a job. May briefly wait for an idle worker before growing.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shutting_down {
            return Err(Error::disconnected(format!("{} is shut down", inner.name)));
        }
        state.queue.push_back(Box::new(job));
        inner.work.notify_one();

        if state.queue.len() <= state.idle || state.workers >= inner.config.max_workers {
            return Ok(());
        }

        let grace = Duration::from_millis(state.workers as u64 / 20 + 1).min(inner.config.backlog_grace);
        let deadline = Instant::now() + grace;
        while state.queue.len() > state.idle && !state.shutting_down {
            if inner.progress.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.queue.len() > state.idle && state.workers < inner.config.max_workers && !state.shutting_down {
            if let Err(e) = spawn_worker(inner, &mut state) {
                if state.workers == 0 {
                    return Err(e);
                }
                tracing::warn!("{}: could not grow past {} workers: {}", inner.name, state.workers, e);
            } else {
                tracing::debug!(
                    "{}: grew to {} workers (backlog {})",
                    inner.name,
                    state.workers,
                    state.queue.len()
                );
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            workers: state.workers,
            idle: state.idle,
            queued: state.queue.len(),
            processed: self.inner.processed.load(Ordering::Relaxed),
            panicked: self.inner.panicked.load(Ordering::Relaxed),
        }
    }

    /// Drop queued work and wait (up to `shutdown_timeout`) for workers to
    /// finish their current job. Safe to call from a worker thread.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shutting_down && state.workers == 0 {
            return;
        }
        state.shutting_down = true;
        let dropped = state.queue.len();
        state.queue.clear();
        inner.work.notify_all();

        let me = std::thread::current().id();
        let target = usize::from(state.threads.contains(&me));
        let deadline = Instant::now() + inner.config.shutdown_timeout;
        while state.workers > target {
            if inner.progress.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(
                    "{}: {} workers still busy after {:?}",
                    inner.name,
                    state.workers - target,
                    inner.config.shutdown_timeout
                );
                break;
            }
        }
        // Exited workers removed their own handles; what is left is either
        // this thread or a straggler, neither of which can be joined here.
        let stragglers = state.handles.len();
        state.handles.clear();
        tracing::info!(
            "{}: shut down (dropped {} queued jobs, {} workers detached)",
            inner.name,
            dropped,
            stragglers
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) -> Result<()> {
    let id = state.next_worker;
    let pool = inner.clone();
    let handle = std::thread::Builder::new()
        .name(format!("{}-{}", inner.name, id))
        .spawn(move || worker_loop(pool, id))?;
    state.next_worker += 1;
    state.workers += 1;
    state.threads.insert(handle.thread().id());
    state.handles.insert(id, handle);
    Ok(())
}

fn worker_loop(inner: Arc<PoolInner>, id: usize) {
    loop {
        let job = {
            let mut state = inner.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    inner.progress.notify_all();
                    break Some(job);
                }
                if state.shutting_down {
                    break None;
                }
                state.idle += 1;
                inner.progress.notify_all();
                let timed_out = inner
                    .work
                    .wait_for(&mut state, inner.config.idle_timeout)
                    .timed_out();
                state.idle -= 1;
                if timed_out && state.queue.is_empty() && state.workers > inner.config.min_workers {
                    tracing::debug!("{}: worker {} idle, shrinking to {}", inner.name, id, state.workers - 1);
                    break None;
                }
            }
        };
        let Some(job) = job else {
            break;
        };
        run_recovered(&inner, job);
    }

    let mut state = inner.state.lock();
    state.workers -= 1;
    state.threads.remove(&std::thread::current().id());
    state.handles.remove(&id);
    inner.progress.notify_all();
}

fn run_recovered(inner: &PoolInner, job: Job) {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => {
            inner.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            inner.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("{}: job panicked: {}", inner.name, panic_message(&payload));
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
