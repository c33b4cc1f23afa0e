//! Bounded worker threads that run gate evaluations under a deadline.
//!
//! Each worker owns a single-threaded tokio runtime so async collaborators
//! (external processes, network calls) can be driven without a runtime on
//! the caller's side. The deadline starts when a worker picks the job up and
//! is enforced inside the worker: an overrunning future is dropped, which
//! frees the worker for the next job and kills child processes spawned with
//! `kill_on_drop`. A job that blocks its thread without yielding cannot be
//! dropped; the caller gives up after a grace period and a replacement
//! worker is started so later jobs are not stuck behind it.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce(&Runtime) + Send + 'static>;

/// Extra wait past the deadline before a worker is considered wedged.
const WEDGE_GRACE: Duration = Duration::from_millis(250);

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Why a gate job produced no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRunError {
    /// The job did not finish within its deadline.
    Timeout(Duration),
    /// Every worker is busy and the job queue is full.
    Saturated,
    /// The runner has been shut down.
    Shutdown,
    /// The job panicked.
    Panicked,
    /// Worker threads could not be started.
    Spawn(String),
}

impl fmt::Display for GateRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(limit) => write!(f, "timed out after {}", humantime::format_duration(*limit)),
            Self::Saturated => write!(f, "gate runner saturated"),
            Self::Shutdown => write!(f, "gate runner shut down"),
            Self::Panicked => write!(f, "gate evaluation panicked"),
            Self::Spawn(msg) => write!(f, "cannot start gate worker: {msg}"),
        }
    }
}

impl std::error::Error for GateRunError {}

/// Snapshot of runner counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Worker threads.
    pub workers: usize,
    /// Jobs accepted.
    pub submitted: u64,
    /// Jobs that returned a result in time.
    pub completed: u64,
    /// Jobs the caller stopped waiting for.
    pub timed_out: u64,
    /// Jobs that panicked.
    pub panicked: u64,
    /// Workers started to replace ones wedged by a blocking job.
    pub replaced: u64,
}

#[derive(Debug, Default)]
struct RunnerCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
    replaced: AtomicU64,
}

/// Fixed pool of gate worker threads.
pub struct GateRunner {
    job_tx: Mutex<Option<Sender<Job>>>,
    job_rx: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    spawned: AtomicUsize,
    counters: Arc<RunnerCounters>,
    shutdown: AtomicBool,
}

impl fmt::Debug for GateRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateRunner")
            .field("workers", &self.spawned.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl GateRunner {
    /// Start `workers` threads sharing a job queue of `queue_depth`.
    ///
    /// # Errors
    ///
    /// Returns [`GateRunError::Spawn`] if a thread cannot be created.
    pub fn new(workers: usize, queue_depth: usize) -> Result<Self, GateRunError> {
        let workers = workers.max(1);
        let (job_tx, job_rx) = bounded::<Job>(queue_depth.max(1));
        let counters = Arc::new(RunnerCounters::default());

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let handle = spawn_worker(worker_id, job_rx.clone(), Arc::clone(&counters))
                .map_err(|e| GateRunError::Spawn(e.to_string()))?;
            handles.push(handle);
        }

        info!(workers, queue_depth, "gate runner started");

        Ok(Self {
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            workers: Mutex::new(handles),
            worker_count: workers,
            spawned: AtomicUsize::new(workers),
            counters,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Run the future produced by `make` on a worker and wait for its
    /// output. `timeout` is measured from the moment a worker starts the
    /// job; a job still queued after `timeout` is withdrawn and never runs.
    ///
    /// # Errors
    ///
    /// [`GateRunError::Timeout`] when the deadline passes,
    /// [`GateRunError::Saturated`] when the queue is full,
    /// [`GateRunError::Panicked`] when the job panics and
    /// [`GateRunError::Shutdown`] after [`GateRunner::shutdown`].
    pub fn run<T, F, Fut>(&self, make: F, timeout: Duration) -> Result<T, GateRunError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T>,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(GateRunError::Shutdown);
        }

        let state = Arc::new(AtomicU8::new(QUEUED));
        let job_state = Arc::clone(&state);
        let (started_tx, started_rx) = bounded::<()>(1);
        let (result_tx, result_rx) = bounded::<Option<T>>(1);
        let job: Job = Box::new(move |rt: &Runtime| {
            if job_state
                .compare_exchange(QUEUED, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("skipping gate job withdrawn before it started");
                return;
            }
            let _ = started_tx.send(());
            let out = rt.block_on(async move { tokio::time::timeout(timeout, make()).await.ok() });
            // The caller may have given up already.
            let _ = result_tx.send(out);
        });

        {
            let guard = self.job_tx.lock();
            let Some(tx) = guard.as_ref() else {
                return Err(GateRunError::Shutdown);
            };
            match tx.try_send(job) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    warn!("gate runner queue is full");
                    return Err(GateRunError::Saturated);
                }
                Err(TrySendError::Disconnected(_)) => return Err(GateRunError::Shutdown),
            }
        }

        match started_rx.recv_timeout(timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                if state
                    .compare_exchange(QUEUED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(timeout = %humantime::format_duration(timeout), "no gate worker free before the deadline");
                    return Err(GateRunError::Timeout(timeout));
                }
                // Started in the meantime; wait for it like any other job.
            }
            Err(RecvTimeoutError::Disconnected) => return Err(GateRunError::Shutdown),
        }

        match result_rx.recv_timeout(timeout.saturating_add(WEDGE_GRACE)) {
            Ok(Some(out)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(out)
            }
            Ok(None) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(timeout = %humantime::format_duration(timeout), "gate job overran its deadline");
                Err(GateRunError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout = %humantime::format_duration(timeout),
                    "gate job blocked its worker past the deadline"
                );
                self.replace_wedged_worker();
                Err(GateRunError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(GateRunError::Panicked),
        }
    }

    /// Start one more worker in place of a wedged one. The pool never grows
    /// past twice its configured size.
    fn replace_wedged_worker(&self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let worker_id = self.spawned.fetch_add(1, Ordering::AcqRel);
        if worker_id >= self.worker_count * 2 {
            self.spawned.fetch_sub(1, Ordering::AcqRel);
            warn!(workers = worker_id, "gate runner at its replacement limit");
            return;
        }
        match spawn_worker(worker_id, self.job_rx.clone(), Arc::clone(&self.counters)) {
            Ok(handle) => {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                info!(worker_id, "replacement gate worker started");
                self.workers.lock().push(handle);
            }
            Err(e) => {
                self.spawned.fetch_sub(1, Ordering::AcqRel);
                error!(worker_id, error = %e, "cannot start replacement gate worker");
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            workers: self.spawned.load(Ordering::Relaxed),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and join idle workers. Workers still stuck on an
    /// overrun job are detached after a short wait.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.job_tx.lock() = None;

        let mut workers = self.workers.lock();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = bounded::<bool>(1);
            let joiner = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(true) => debug!(worker_id = idx, "gate worker joined"),
                Ok(false) => warn!(worker_id = idx, "gate worker panicked"),
                Err(_) => {
                    warn!(worker_id = idx, "gate worker still busy, detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!("gate runner shut down");
    }
}

impl Drop for GateRunner {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            *self.job_tx.lock() = None;
            debug!("gate runner dropped, workers detached");
        }
    }
}

fn build_runtime() -> std::io::Result<Runtime> {
    Builder::new_current_thread().enable_all().build()
}

fn spawn_worker(
    worker_id: usize,
    job_rx: Receiver<Job>,
    counters: Arc<RunnerCounters>,
) -> std::io::Result<JoinHandle<()>> {
    let mut rt = build_runtime()?;
    thread::Builder::new()
        .name(format!("gate-worker-{worker_id}"))
        .spawn(move || {
            while let Ok(job) = job_rx.recv() {
                if panic::catch_unwind(AssertUnwindSafe(|| job(&rt))).is_err() {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(worker_id, "gate job panicked");
                    // A runtime that unwound mid-poll is not reused.
                    match build_runtime() {
                        Ok(fresh) => rt = fresh,
                        Err(e) => {
                            error!(worker_id, error = %e, "cannot rebuild gate runtime, worker exiting");
                            return;
                        }
                    }
                }
            }
            debug!(worker_id, "gate worker exiting");
        })
}
