//! Worker pools for compute, adapter I/O, and timers
//!
//! Each pool is a dedicated tokio runtime with named threads. Admission is
//! bounded by a semaphore sized `threads + queue_capacity`; once a pool is
//! saturated the submitting caller runs the work itself, so nothing is dropped
//! and nothing blocks indefinitely.

use crate::config::PoolConfig;
use crate::error::SweepError;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, Semaphore, TryAcquireError};
use tokio::task::AbortHandle;

/// Which pool a piece of work belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// CPU-bound async work units
    Compute,
    /// Blocking adapter reads
    Io,
    /// Delayed and periodic jobs
    Timer,
}

impl PoolKind {
    /// Get the pool name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Compute => "compute",
            PoolKind::Io => "io",
            PoolKind::Timer => "timer",
        }
    }
}

/// Future resolving to the outcome of submitted work
///
/// Resolves to `Err(SweepError::Shutdown)` when the pool was already shut
/// down, and to `Err(SweepError::Worker)` when the work panicked or was torn
/// down by a forced shutdown.
#[must_use = "a TaskHandle does nothing unless awaited"]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T, SweepError>>,
    ran_on_caller: bool,
    refusal: Option<SweepError>,
}

impl<T> TaskHandle<T> {
    fn pending(receiver: oneshot::Receiver<Result<T, SweepError>>, ran_on_caller: bool) -> Self {
        Self {
            receiver,
            ran_on_caller,
            refusal: None,
        }
    }

    fn failed(error: SweepError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error.clone()));
        Self {
            refusal: Some(error),
            ..Self::pending(rx, false)
        }
    }

    /// Why the pool refused the work, when it never started
    pub fn refusal(&self) -> Option<&SweepError> {
        self.refusal.as_ref()
    }

    /// Whether backpressure pushed the work onto the submitting caller
    pub fn ran_on_caller(&self) -> bool {
        self.ran_on_caller
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, SweepError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SweepError::Worker(
                "work was dropped before completion".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to a delayed or periodic job
///
/// Dropping the handle leaves the job scheduled; call [`cancel`](Self::cancel)
/// to stop it.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    abort: AbortHandle,
}

impl ScheduledHandle {
    /// Stop the job; a run already in progress finishes first
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Whether the job ended (one-shot fired, cancelled, or pool gone)
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Counters for one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Which pool
    pub kind: PoolKind,
    /// Worker threads (blocking threads for the I/O pool)
    pub threads: usize,
    /// Maximum in-flight submissions before caller-runs kicks in
    pub capacity: usize,
    /// Submissions currently holding a slot
    pub in_flight: usize,
    /// Submissions since creation
    pub submitted: u64,
    /// Submissions executed by the caller under backpressure
    pub caller_runs: u64,
}

/// Snapshot of all pools
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Compute pool counters
    pub compute: PoolStats,
    /// I/O pool counters
    pub io: PoolStats,
    /// Timer pool counters
    pub timer: PoolStats,
    /// Whether shutdown has begun
    pub shutdown: bool,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stats in [&self.compute, &self.io, &self.timer] {
            write!(
                f,
                "{}: {}/{} in flight, {} threads, {} submitted, {} caller-run; ",
                stats.kind.as_str(),
                stats.in_flight,
                stats.capacity,
                stats.threads,
                stats.submitted,
                stats.caller_runs
            )?;
        }
        write!(f, "shutdown: {}", self.shutdown)
    }
}

struct Pool {
    kind: PoolKind,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    admission: Arc<Semaphore>,
    threads: usize,
    capacity: usize,
    grace: Duration,
    submitted: AtomicU64,
    caller_runs: AtomicU64,
}

impl Pool {
    fn new(kind: PoolKind, runtime: Runtime, threads: usize, queue: usize, grace: Duration) -> Self {
        let capacity = threads + queue;
        Self {
            kind,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            admission: Arc::new(Semaphore::new(capacity)),
            threads,
            capacity,
            grace,
            submitted: AtomicU64::new(0),
            caller_runs: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            kind: self.kind,
            threads: self.threads,
            capacity: self.capacity,
            in_flight: self
                .capacity
                .saturating_sub(self.admission.available_permits()),
            submitted: self.submitted.load(Ordering::Relaxed),
            caller_runs: self.caller_runs.load(Ordering::Relaxed),
        }
    }

    /// Wait up to the grace period for in-flight work, then stop the runtime.
    /// Must not be called from inside an async context.
    fn drain_and_stop(&self) -> bool {
        let Some(runtime) = self.runtime.lock().take() else {
            return true;
        };

        let admission = Arc::clone(&self.admission);
        let permits = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let grace = self.grace;
        let drained = runtime.block_on(async move {
            matches!(
                tokio::time::timeout(grace, admission.acquire_many_owned(permits)).await,
                Ok(Ok(_))
            )
        });

        if drained {
            runtime.shutdown_timeout(Duration::from_millis(250));
            tracing::debug!("{} pool terminated", self.kind.as_str());
        } else {
            tracing::warn!(
                "{} pool did not terminate within {:?}, forcing shutdown",
                self.kind.as_str(),
                grace
            );
            runtime.shutdown_background();
        }
        drained
    }

    fn stop_now(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

/// Owner of the compute, I/O and timer pools
///
/// # Examples
///
/// ```
/// use sweeper_engine::config::PoolConfig;
/// use sweeper_engine::pool::WorkerPoolManager;
///
/// # fn main() -> Result<(), sweeper_engine::SweepError> {
/// let pools = WorkerPoolManager::new(&PoolConfig::default())?;
/// let answer = futures::executor::block_on(pools.spawn_io(|| 6 * 7))?;
/// assert_eq!(answer, 42);
/// pools.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct WorkerPoolManager {
    compute: Pool,
    io: Pool,
    timer: Pool,
    shutdown: AtomicBool,
}

fn named_threads(prefix: &'static str) -> impl Fn() -> String + Send + Sync + 'static {
    let counter = AtomicUsize::new(0);
    move || format!("{}-{}", prefix, counter.fetch_add(1, Ordering::Relaxed))
}

fn build_error(kind: PoolKind, err: std::io::Error) -> SweepError {
    SweepError::Worker(format!("failed to build {} pool: {}", kind.as_str(), err))
}

impl WorkerPoolManager {
    /// Build all three pools
    pub fn new(config: &PoolConfig) -> Result<Self, SweepError> {
        let compute_threads = config.compute_threads.max(1);
        let io_threads = config.io_threads.max(1);
        let grace = Duration::from_secs(config.shutdown_grace_secs);

        let compute_rt = Builder::new_multi_thread()
            .worker_threads(compute_threads)
            .thread_name_fn(named_threads("sweeper-compute"))
            .enable_all()
            .build()
            .map_err(|e| build_error(PoolKind::Compute, e))?;

        let io_rt = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(io_threads)
            .thread_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .thread_name_fn(named_threads("sweeper-io"))
            .enable_all()
            .build()
            .map_err(|e| build_error(PoolKind::Io, e))?;

        let timer_rt = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sweeper-timer")
            .enable_all()
            .build()
            .map_err(|e| build_error(PoolKind::Timer, e))?;

        tracing::info!(
            "Worker pools started (compute: {}, io: {}, timer: 1)",
            compute_threads,
            io_threads
        );

        Ok(Self {
            compute: Pool::new(
                PoolKind::Compute,
                compute_rt,
                compute_threads,
                config.queue_capacity,
                grace,
            ),
            io: Pool::new(PoolKind::Io, io_rt, io_threads, config.queue_capacity, grace),
            timer: Pool::new(
                PoolKind::Timer,
                timer_rt,
                1,
                config.queue_capacity,
                Duration::from_secs(config.timer_shutdown_grace_secs),
            ),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Compute pool worker count
    pub fn compute_threads(&self) -> usize {
        self.compute.threads
    }

    /// Run an async work unit on the compute pool
    ///
    /// When the pool is saturated the future is spawned onto the caller's
    /// own runtime, or driven to completion on the calling thread when the
    /// caller has none.
    pub fn spawn_compute<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutdown() {
            return TaskHandle::failed(SweepError::Shutdown("compute pool is shut down".into()));
        }
        let pool = &self.compute;
        pool.submitted.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        let job = async move {
            let outcome = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(|payload| SweepError::Worker(panic_message(payload.as_ref())));
            let _ = tx.send(outcome);
        };

        match Arc::clone(&pool.admission).try_acquire_owned() {
            Ok(permit) => {
                pool.handle.spawn(async move {
                    job.await;
                    drop(permit);
                });
                TaskHandle::pending(rx, false)
            }
            Err(TryAcquireError::NoPermits) => {
                pool.caller_runs.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Compute pool saturated, running work on the caller");
                match Handle::try_current() {
                    Ok(caller) => {
                        caller.spawn(job);
                    }
                    Err(_) => {
                        let _guard = pool.handle.enter();
                        futures::executor::block_on(job);
                    }
                }
                TaskHandle::pending(rx, true)
            }
            Err(TryAcquireError::Closed) => {
                TaskHandle::failed(SweepError::Shutdown("compute pool is shut down".into()))
            }
        }
    }

    /// Run a blocking closure on the I/O pool
    ///
    /// When the pool is saturated the closure runs inline on the caller.
    pub fn spawn_io<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutdown() {
            return TaskHandle::failed(SweepError::Shutdown("io pool is shut down".into()));
        }
        let pool = &self.io;
        pool.submitted.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        let job = move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| SweepError::Worker(panic_message(payload.as_ref())));
            let _ = tx.send(outcome);
        };

        match Arc::clone(&pool.admission).try_acquire_owned() {
            Ok(permit) => {
                pool.handle.spawn_blocking(move || {
                    job();
                    drop(permit);
                });
                TaskHandle::pending(rx, false)
            }
            Err(TryAcquireError::NoPermits) => {
                pool.caller_runs.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("I/O pool saturated, running work on the caller");
                job();
                TaskHandle::pending(rx, true)
            }
            Err(TryAcquireError::Closed) => {
                TaskHandle::failed(SweepError::Shutdown("io pool is shut down".into()))
            }
        }
    }

    /// Run `job` once after `delay` on the timer pool
    pub fn schedule<F>(&self, job: F, delay: Duration) -> Result<ScheduledHandle, SweepError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(SweepError::Shutdown("timer pool is shut down".into()));
        }
        self.timer.submitted.fetch_add(1, Ordering::Relaxed);
        let admission = Arc::clone(&self.timer.admission);

        let join = self.timer.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = admission.acquire_owned().await else {
                return;
            };
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
                tracing::error!("Scheduled job panicked: {}", panic_message(payload.as_ref()));
            }
        });

        Ok(ScheduledHandle {
            abort: join.abort_handle(),
        })
    }

    /// Run `job` every `period` after `initial_delay` on the timer pool
    ///
    /// A panicking run is logged and the schedule continues.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        job: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle, SweepError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_shutdown() {
            return Err(SweepError::Shutdown("timer pool is shut down".into()));
        }
        if period.is_zero() {
            return Err(SweepError::Config("schedule period must be greater than zero".into()));
        }
        self.timer.submitted.fetch_add(1, Ordering::Relaxed);
        let admission = Arc::clone(&self.timer.admission);

        let join = self.timer.handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Ok(permit) = Arc::clone(&admission).acquire_owned().await else {
                    break;
                };
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(&job)) {
                    tracing::error!("Periodic job panicked: {}", panic_message(payload.as_ref()));
                }
                drop(permit);
            }
        });

        Ok(ScheduledHandle {
            abort: join.abort_handle(),
        })
    }

    /// Counters for every pool
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            compute: self.compute.stats(),
            io: self.io.stats(),
            timer: self.timer.stats(),
            shutdown: self.is_shutdown(),
        }
    }

    /// Stop admitting work, wait out the grace periods, then stop the pools
    ///
    /// Blocks the calling thread for at most the sum of the grace periods.
    /// Returns false when in-flight work had to be abandoned. Calling it again
    /// is a no-op.
    pub fn shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return true;
        }
        tracing::info!("Shutting down worker pools");

        // block_on panics inside an async context, so drain from a plain thread
        let graceful = std::thread::scope(|scope| {
            let drainer = std::thread::Builder::new()
                .name("sweeper-shutdown".to_string())
                .spawn_scoped(scope, || {
                    let compute = self.compute.drain_and_stop();
                    let io = self.io.drain_and_stop();
                    let timer = self.timer.drain_and_stop();
                    compute && io && timer
                });
            match drainer {
                Ok(handle) => handle.join().unwrap_or(false),
                Err(e) => {
                    tracing::warn!("Could not start shutdown thread ({}), forcing shutdown", e);
                    false
                }
            }
        });

        // Anything still held (e.g. the drain thread failed to start) goes now
        self.compute.stop_now();
        self.io.stop_now();
        self.timer.stop_now();

        tracing::info!("Worker pools stopped (graceful: {})", graceful);
        graceful
    }

    /// Stop every pool immediately, abandoning in-flight work
    pub fn shutdown_now(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.compute.stop_now();
        self.io.stop_now();
        self.timer.stop_now();
        tracing::info!("Worker pools stopped immediately");
    }
}

impl Drop for WorkerPoolManager {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

impl fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("status", &self.status())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
