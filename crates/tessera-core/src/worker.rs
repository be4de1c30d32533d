// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Worker processors.
//!
//! Each processor owns one lock-free run queue and one thread. Threads park
//! on a shared condition variable when their queue is empty. A worker that
//! blocks inside a job (waiting on an event) keeps draining its own queue
//! through [`help_until`], so a parent task waiting on children mapped to
//! its own processor cannot deadlock.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::error::RuntimeError;
use crate::ident::ProcessorId;

/// Unit of work run on a processor.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Park interval for idle workers; bounds lost-wakeup latency.
const IDLE_PARK: Duration = Duration::from_millis(20);
/// Poll interval for workers helping while blocked.
const HELP_POLL: Duration = Duration::from_millis(1);

struct PoolInner {
    /// One run queue per processor.
    queues: Vec<SegQueue<Job>>,
    /// Jobs queued per processor.
    pending: Vec<AtomicUsize>,
    /// Jobs running per processor (nested when helping).
    running: Vec<AtomicUsize>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Mutex for condition variable.
    mutex: Mutex<()>,
}

impl PoolInner {
    fn run(&self, me: usize, job: Job) {
        self.running[me].fetch_add(1, Ordering::Relaxed);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
        self.running[me].fetch_sub(1, Ordering::Relaxed);
        if result.is_err() {
            tracing::error!(processor = me, "job panicked outside task isolation");
        }
    }

    fn pop(&self, me: usize) -> Option<Job> {
        let job = self.queues[me].pop()?;
        self.pending[me].fetch_sub(1, Ordering::Relaxed);
        Some(job)
    }

    fn park(&self, timeout: Duration) {
        let guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .condvar
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.condvar.notify_all();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(Arc<PoolInner>, usize)>> = const { RefCell::new(None) };
}

/// Fixed set of processors, one thread and run queue each.
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `workers` processors.
    pub(crate) fn new(workers: usize) -> Result<Self, RuntimeError> {
        let workers = workers.max(1);
        let inner = Arc::new(PoolInner {
            queues: (0..workers).map(|_| SegQueue::new()).collect(),
            pending: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            running: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        });
        let pool = Self {
            inner,
            handles: Mutex::new(Vec::with_capacity(workers)),
        };
        for me in 0..workers {
            let inner = Arc::clone(&pool.inner);
            let handle = thread::Builder::new()
                .name(format!("tessera-proc-{me}"))
                .spawn(move || worker_loop(inner, me))
                .map_err(|e| RuntimeError::WorkerSpawn(e.to_string()))?;
            pool.handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        Ok(pool)
    }

    /// Number of processors.
    pub(crate) fn processors(&self) -> usize {
        self.inner.queues.len()
    }

    /// Queues `job` on `proc` (wrapped modulo the processor count).
    pub(crate) fn dispatch(&self, proc: ProcessorId, job: Job) {
        let me = proc.index() % self.processors();
        self.inner.pending[me].fetch_add(1, Ordering::Relaxed);
        self.inner.queues[me].push(job);
        self.inner.notify_all();
    }

    /// Queued plus running jobs per processor.
    pub(crate) fn load(&self) -> Vec<usize> {
        (0..self.processors())
            .map(|i| {
                self.inner.pending[i].load(Ordering::Relaxed) + self.inner.running[i].load(Ordering::Relaxed)
            })
            .collect()
    }

    /// Stops the processors after their queues drain.
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify_all();
        let on_worker = CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|(pool, _)| Arc::ptr_eq(pool, &self.inner))
        });
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if on_worker {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, me: usize) {
    CURRENT.with(|c| *c.borrow_mut() = Some((Arc::clone(&inner), me)));
    loop {
        if let Some(job) = inner.pop(me) {
            inner.run(me, job);
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        inner.park(IDLE_PARK);
    }
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Processor the calling thread runs on, if it is a worker.
pub(crate) fn current_processor() -> Option<ProcessorId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|(_, me)| ProcessorId::from_raw(*me as u32)))
}

/// Wake callback for the calling worker's pool, if any.
pub(crate) fn waker() -> Option<impl Fn() + Send + Sync + 'static> {
    let pool = CURRENT.with(|c| c.borrow().as_ref().map(|(pool, _)| Arc::clone(pool)))?;
    Some(move || pool.notify_all())
}

/// Runs queued jobs of the calling worker until `done` holds.
///
/// Returns `false` without waiting when the caller is not a worker.
pub(crate) fn help_until<F: Fn() -> bool>(done: F) -> bool {
    let Some((inner, me)) = CURRENT.with(|c| c.borrow().clone()) else {
        return false;
    };
    while !done() {
        if let Some(job) = inner.pop(me) {
            inner.run(me, job);
            continue;
        }
        inner.park(HELP_POLL);
    }
    true
}
