//! Worker drivers
//!
//! Threads that each take a [`ThreadState`](crate::embedded::ThreadState) from
//! the environment and loop acquire → call → release. A worker stops at the
//! first failed runtime call, the same way it would abandon work when the
//! runtime goes away underneath it.
//!
//! [`run_naive`] is the uncoordinated counterpart: every worker initializes
//! and finalizes the runtime itself, and most of them lose that race.

use std::any::Any;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::embedded::RuntimeEnvironment;
use crate::runtime::{CallError, EmbeddedRuntime, RuntimeError};
use crate::util::config::DriverConfig;

/// How many workers to run and what each one does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    /// Number of worker threads.
    pub threads: usize,
    /// Acquire/call/release cycles per worker.
    pub iterations: usize,
    /// Sleep between cycles, outside the lock.
    pub pause: Duration,
}

impl Default for WorkerPlan {
    fn default() -> Self {
        Self::from(&DriverConfig::default())
    }
}

impl From<&DriverConfig> for WorkerPlan {
    fn from(config: &DriverConfig) -> Self {
        Self {
            threads: config.threads,
            iterations: config.iterations,
            pause: Duration::from_millis(config.pause_ms),
        }
    }
}

/// Which cycle a job invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCall {
    pub worker: usize,
    pub iteration: usize,
}

/// Outcome of one worker thread.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport<T, E = CallError> {
    pub index: usize,
    /// Results of the successful calls, in order.
    pub results: Vec<T>,
    /// The failure that made this worker stop, if any.
    pub failure: Option<E>,
    /// The environment had no thread state to give.
    pub abandoned: bool,
}

impl<T, E> WorkerReport<T, E> {
    fn new(index: usize) -> Self {
        Self {
            index,
            results: Vec::new(),
            failure: None,
            abandoned: false,
        }
    }

    pub fn completed(&self) -> usize {
        self.results.len()
    }
}

/// Outcome of a whole run, one report per worker in spawn order.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverReport<T, E = CallError> {
    pub workers: Vec<WorkerReport<T, E>>,
}

impl<T, E> DriverReport<T, E> {
    /// Successful calls across all workers.
    pub fn completed_calls(&self) -> usize {
        self.workers.iter().map(|w| w.completed()).sum()
    }

    pub fn failed_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.failure.is_some()).count()
    }

    pub fn abandoned_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.abandoned).count()
    }

    /// Every worker finished all its cycles.
    pub fn all_completed(
        &self,
        iterations: usize,
    ) -> bool {
        self.workers.iter().all(|w| w.completed() == iterations)
    }
}

/// Driver failures (not runtime call failures, which land in the reports).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker thread {index} panicked: {message}")]
    Panicked { index: usize, message: String },
    #[error("failed to spawn worker thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Run `plan.threads` workers against `env` and wait for all of them.
///
/// `job` runs once per cycle with the global lock held by the calling
/// worker. A worker gets a guard even when the runtime is shutting down; the
/// job's own call then fails and the worker stops.
pub fn run_workers<R, F, T>(
    env: &RuntimeEnvironment<R>,
    plan: &WorkerPlan,
    job: F,
) -> Result<DriverReport<T>, WorkerError>
where
    R: EmbeddedRuntime,
    F: Fn(&R, WorkerCall) -> Result<T, CallError> + Sync,
    T: Send,
{
    let job = &job;
    run_scoped(plan, |index| drive(env, index, plan, job))
}

/// Run `plan.threads` workers that each try to own the runtime lifecycle on
/// their own: initialize, call, finalize, every cycle.
///
/// Nothing coordinates them, so workers that lose the race on initialization
/// stop with [`NaiveFailure::Initialize`]. Nobody waits on the lock, so the
/// run always terminates.
pub fn run_naive<R, F, T>(
    runtime: &R,
    plan: &WorkerPlan,
    job: F,
) -> Result<DriverReport<T, NaiveFailure>, WorkerError>
where
    R: EmbeddedRuntime,
    F: Fn(&R, WorkerCall) -> Result<T, CallError> + Sync,
    T: Send,
{
    let job = &job;
    run_scoped(plan, |index| drive_naive(runtime, index, plan, job))
}

/// Why a naive worker stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NaiveFailure {
    #[error("initialize failed: {0}")]
    Initialize(#[source] RuntimeError),
    #[error("finalize failed: {0}")]
    Finalize(#[source] RuntimeError),
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Spawn one named scoped thread per worker and join all of them.
fn run_scoped<W, T, E>(
    plan: &WorkerPlan,
    work: W,
) -> Result<DriverReport<T, E>, WorkerError>
where
    W: Fn(usize) -> WorkerReport<T, E> + Sync,
    T: Send,
    E: Send,
{
    let work = &work;
    let outcome = crossbeam::thread::scope(|s| {
        let mut handles = Vec::with_capacity(plan.threads);
        let mut spawn_error = None;
        for index in 0..plan.threads {
            let spawned = s
                .builder()
                .name(format!("embed-worker-{}", index))
                .spawn(move |_| work(index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    spawn_error = Some(WorkerError::Spawn { index, source });
                    break;
                }
            }
        }

        // Join everything before reporting so no panic goes unobserved.
        let mut workers = Vec::with_capacity(handles.len());
        let mut first_panic = None;
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(report) => workers.push(report),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(worker = index, %message, "worker thread panicked");
                    if first_panic.is_none() {
                        first_panic = Some(WorkerError::Panicked { index, message });
                    }
                }
            }
        }

        match spawn_error.or(first_panic) {
            Some(err) => Err(err),
            None => Ok(DriverReport { workers }),
        }
    });

    match outcome {
        Ok(result) => result,
        // Every spawned handle is joined above.
        Err(payload) => Err(WorkerError::Panicked {
            index: 0,
            message: scope_panic_message(payload),
        }),
    }
}

/// Run `setup` on the calling thread under the bootstrap context.
///
/// Meant for the environment's creator thread before any worker starts.
/// `None` if the runtime is unavailable.
pub fn run_on_bootstrap<R, F, T>(
    env: &RuntimeEnvironment<R>,
    setup: F,
) -> Option<Result<T, CallError>>
where
    R: EmbeddedRuntime,
    F: FnOnce(&R) -> Result<T, CallError>,
{
    let thread_state = env.create_thread_state()?;
    let guard = thread_state.acquire_lock();
    Some(setup(guard.runtime()))
}

fn drive<R, F, T>(
    env: &RuntimeEnvironment<R>,
    index: usize,
    plan: &WorkerPlan,
    job: &F,
) -> WorkerReport<T>
where
    R: EmbeddedRuntime,
    F: Fn(&R, WorkerCall) -> Result<T, CallError>,
{
    info!("Thread started: {}", index);
    let mut report = WorkerReport::new(index);

    // Each thread must use its own thread state.
    let Some(thread_state) = env.create_thread_state() else {
        warn!(worker = index, "runtime unavailable, abandoning work");
        report.abandoned = true;
        return report;
    };

    for iteration in 0..plan.iterations {
        let call = WorkerCall {
            worker: index,
            iteration,
        };
        let outcome = {
            let guard = thread_state.acquire_lock();
            job(guard.runtime(), call)
        };

        match outcome {
            Ok(value) => report.results.push(value),
            Err(err) => {
                warn!(worker = index, iteration, %err, "runtime call raised");
                report.failure = Some(err);
                break;
            }
        }

        if !plan.pause.is_zero() {
            thread::sleep(plan.pause);
        }
    }

    debug!(worker = index, completed = report.completed(), "Thread exiting");
    report
}

fn drive_naive<R, F, T>(
    runtime: &R,
    index: usize,
    plan: &WorkerPlan,
    job: &F,
) -> WorkerReport<T, NaiveFailure>
where
    R: EmbeddedRuntime,
    F: Fn(&R, WorkerCall) -> Result<T, CallError>,
{
    info!("Thread started: {}", index);
    let mut report = WorkerReport::new(index);

    for iteration in 0..plan.iterations {
        if let Err(err) = runtime.initialize() {
            warn!(worker = index, iteration, %err, "initialize failed");
            report.failure = Some(NaiveFailure::Initialize(err));
            break;
        }
        let outcome = job(
            runtime,
            WorkerCall {
                worker: index,
                iteration,
            },
        );
        if let Err(err) = runtime.finalize() {
            warn!(worker = index, iteration, %err, "finalize failed");
            report.failure = Some(NaiveFailure::Finalize(err));
            break;
        }
        match outcome {
            Ok(value) => report.results.push(value),
            Err(err) => {
                warn!(worker = index, iteration, %err, "runtime call raised");
                report.failure = Some(err.into());
                break;
            }
        }

        if !plan.pause.is_zero() {
            thread::sleep(plan.pause);
        }
    }

    debug!(worker = index, completed = report.completed(), "Thread exiting");
    report
}

fn scope_panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<Vec<Box<dyn Any + Send>>>() {
        Ok(payloads) => payloads
            .first()
            .map(|payload| panic_message(payload.as_ref()))
            .unwrap_or_else(|| "worker scope panicked".to_string()),
        Err(payload) => panic_message(payload.as_ref()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
