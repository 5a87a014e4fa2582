//! The claim/process/report loop run by every worker process.
//!
//! Workers share nothing but the job store and its lock file. Each one
//! claims the lowest unstarted PID, runs the processing routine outside the
//! lock and records the outcome, until no unclaimed job is left.


use crate::{
    database::{ConnectionError, JobRecord, JobStore, Pid},
    processor::{JobProcessor, ProcessingError},
    sync::{locking, FileLock, LockError},
};
use rand::RngExt;
use serde_json::{json, Value};
use std::{error::Error as StdError, ops::RangeInclusive, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job store failure")]
    Connection(#[from] ConnectionError),
    #[error("Giving up after {failures} consecutive failures to acquire the store lock")]
    LockExhausted { failures: u32 },
    #[error("Processing failed")]
    Processing(#[from] ProcessingError),
    #[error("Failed to print job parameters")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// seconds to sleep before the first claim, `None` disables the jitter
    pub startup_jitter: Option<RangeInclusive<u64>>,
    pub lock_sleep_interval: Duration,
    pub lock_max_attempts: u32,
    pub stale_timeout: Duration,
    /// consecutive lock failures tolerated before the worker terminates
    pub max_lock_failures: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            startup_jitter: Some(1..=10),
            lock_sleep_interval: locking::DEFAULT_SLEEP_INTERVAL,
            lock_max_attempts: locking::DEFAULT_MAX_ATTEMPTS,
            stale_timeout: locking::DEFAULT_STALE_TIMEOUT,
            max_lock_failures: 10,
        }
    }
}

impl WorkerSettings {
    pub fn without_jitter(mut self) -> Self {
        self.startup_jitter = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Processing(JobRecord),
    Completing(Pid),
    Failing(Pid, Value),
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// What the single job debug mode does with the selected job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    PrintParams,
    RemoveOutputs,
    Run,
}

pub struct Worker<P: JobProcessor> {
    store: JobStore,
    processor: P,
    settings: WorkerSettings,
}

impl<P: JobProcessor> Worker<P> {
    pub fn new(store: JobStore, processor: P, settings: WorkerSettings) -> Self {
        let lock = FileLock::new(&store.descriptor().lock_file_path)
            .with_retry(settings.lock_sleep_interval, settings.lock_max_attempts)
            .with_stale_timeout(settings.stale_timeout);

        Self {
            store: store.with_lock(lock),
            processor,
            settings,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Claim and process jobs until the store runs dry
    #[instrument(skip(self), level = "info")]
    pub fn run(&self) -> Result<WorkerSummary, WorkerError> {
        if let Some(ref jitter) = self.settings.startup_jitter {
            let secs = rand::rng().random_range(jitter.clone());
            debug!("Sleeping {secs} s before the first claim");
            thread::sleep(Duration::from_secs(secs));
        }

        let mut summary = WorkerSummary::default();
        let mut lock_failures = 0;
        let mut state = WorkerState::Idle;

        loop {
            state = match state {
                WorkerState::Idle => WorkerState::Claiming,
                WorkerState::Claiming => match self.store.claim_next() {
                    Ok(Some(job)) => {
                        lock_failures = 0;
                        summary.claimed += 1;

                        WorkerState::Processing(job)
                    }
                    Ok(None) => WorkerState::Terminated,
                    Err(ConnectionError::Lock(error)) => {
                        self.lock_contention(&mut lock_failures, &error)?;

                        WorkerState::Claiming
                    }
                    Err(error) => return Err(error.into()),
                },
                WorkerState::Processing(job) => match self.process(&job) {
                    Ok(()) => WorkerState::Completing(job.pid),
                    Err(error) => {
                        debug!(pid = job.pid, "Job failed: {error}");

                        WorkerState::Failing(job.pid, error_info(&error))
                    }
                },
                WorkerState::Completing(pid) => {
                    self.with_lock_retry(&mut lock_failures, |store| store.mark_completed(pid))?;
                    summary.completed += 1;

                    WorkerState::Idle
                }
                WorkerState::Failing(pid, info) => {
                    self.with_lock_retry(&mut lock_failures, |store| store.mark_error(pid, &info))?;
                    summary.failed += 1;

                    WorkerState::Idle
                }
                WorkerState::Terminated => break,
            };
        }

        info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            "No jobs left, worker finished"
        );

        Ok(summary)
    }

    /// Inspect or re-run one job without touching its bookkeeping
    #[instrument(skip(self), level = "info")]
    pub fn run_single(&self, pid: Pid, action: DebugAction) -> Result<(), WorkerError> {
        let job = self.store.get(pid)?;
        debug!(pid = pid, "Found the job to process");

        match action {
            DebugAction::PrintParams => {
                println!("{}", serde_json::to_string_pretty(&job.params)?);
            }
            DebugAction::RemoveOutputs => {
                self.processor.check_required_fields(&job.params)?;
                self.processor.remove_outputs(&job.params)?;
            }
            DebugAction::Run => self.process(&job)?,
        }

        debug!(pid = pid, "Finished processing the job");

        Ok(())
    }

    fn process(&self, job: &JobRecord) -> Result<(), ProcessingError> {
        self.processor.check_required_fields(&job.params)?;
        self.processor.do_processing(&job.params)
    }

    fn lock_contention(&self, failures: &mut u32, error: &LockError) -> Result<(), WorkerError> {
        *failures += 1;
        warn!(failures = *failures, "Failed to acquire the store lock: {error}");

        match self.store.lock().clean_stale() {
            Ok(0) => {}
            Ok(removed) => info!(removed = removed, "Removed stale lock files"),
            Err(error) => error!(error = ?error, "Failed to clean stale lock files"),
        }

        if *failures > self.settings.max_lock_failures {
            return Err(WorkerError::LockExhausted {
                failures: *failures,
            });
        }

        Ok(())
    }

    fn with_lock_retry(
        &self,
        failures: &mut u32,
        operation: impl Fn(&JobStore) -> Result<(), ConnectionError>,
    ) -> Result<(), WorkerError> {
        loop {
            match operation(&self.store) {
                Ok(()) => {
                    *failures = 0;

                    return Ok(());
                }
                Err(ConnectionError::Lock(error)) => self.lock_contention(failures, &error)?,
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// `{"error": <message>, "traceback": [<message of every source>]}`
pub fn error_info(error: &(dyn StdError + 'static)) -> Value {
    let mut traceback = Vec::new();
    let mut source = error.source();

    while let Some(cause) = source {
        traceback.push(cause.to_string());
        source = cause.source();
    }

    json!({
        "error": error.to_string(),
        "traceback": traceback,
    })
}
