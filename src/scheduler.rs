//! Batch Scheduler
//!
//! Fans one validation job out per file and reduces the outcomes as they
//! complete:
//! - **Jobs**: `tokio::spawn` tasks that wait on a [`Semaphore`] permit, then
//!   run the CPU-bound parse on the blocking pool with the permit moved in
//! - **Reducer**: a single task that pulls completions from a
//!   [`FuturesUnordered`], feeds the [`ResultAggregator`] and emits one
//!   progress event per completion
//! - **Faults**: panics, cancelled jobs and timeouts become faulty
//!   [`FileResult`]s for that file only
//!
//! The reducer is the only writer of aggregate state.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::error::FileFault;
use crate::progress::{BatchEvent, ProgressChannel, ProgressSender, ProgressUpdate};
use crate::validator::{FileRef, FileResult, FileValidator};

/// Upper bound on the default worker count
pub const MAX_DEFAULT_WORKERS: usize = 8;

/// Default progress channel capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// `min(2 × available parallelism, 8)`
pub fn default_workers() -> usize {
    (num_cpus::get() * 2).clamp(1, MAX_DEFAULT_WORKERS)
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Jobs allowed to parse at the same time
    pub workers: usize,
    /// Per-file limit; `None` never times out
    pub file_timeout: Option<Duration>,
    /// Events buffered before the reducer waits on the consumer
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            file_timeout: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// A per-file check the scheduler can run on the blocking pool
pub trait Validate: Send + Sync + 'static {
    fn validate(&self, file: &FileRef) -> FileResult;

    /// Declared tag order used for batch statistics
    fn required_tags(&self) -> &[String];
}

impl Validate for FileValidator {
    fn validate(&self, file: &FileRef) -> FileResult {
        FileValidator::validate(self, file)
    }

    fn required_tags(&self) -> &[String] {
        &self.schema().required_tags
    }
}

pub struct BatchScheduler {
    validator: Arc<dyn Validate>,
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(validator: impl Validate, config: SchedulerConfig) -> Self {
        Self {
            validator: Arc::new(validator),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start a batch and return its event stream.
    ///
    /// Must be called from within a Tokio runtime. Jobs keep running if the
    /// returned channel is dropped; only event delivery stops.
    pub fn run(&self, files: Vec<FileRef>) -> ProgressChannel {
        let (sender, channel) = ProgressChannel::bounded(self.config.channel_capacity);
        let total = files.len();
        let workers = self.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));

        info!(total, workers, timeout = ?self.config.file_timeout, "batch started");

        let jobs: FuturesUnordered<_> = files
            .into_iter()
            .map(|file| {
                let name = file.file_name();
                let handle = tokio::spawn(run_job(
                    file,
                    Arc::clone(&self.validator),
                    Arc::clone(&semaphore),
                    self.config.file_timeout,
                ));
                async move { (name, handle.await) }
            })
            .collect();

        let aggregator = ResultAggregator::with_capacity(self.validator.required_tags(), total);
        tokio::spawn(reduce(jobs, total, aggregator, sender));

        channel
    }
}

async fn run_job(
    file: FileRef,
    validator: Arc<dyn Validate>,
    semaphore: Arc<Semaphore>,
    file_timeout: Option<Duration>,
) -> Result<FileResult, FileFault> {
    let permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| FileFault::Worker("worker pool closed".to_string()))?;

    // The permit is released when parsing ends, even after a timeout
    let job = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        validator.validate(&file)
    });

    match file_timeout {
        None => job.await.map_err(join_fault),
        Some(limit) => match tokio::time::timeout(limit, job).await {
            Ok(joined) => joined.map_err(join_fault),
            Err(_) => Err(FileFault::TimedOut(limit)),
        },
    }
}

async fn reduce<F>(
    mut jobs: FuturesUnordered<F>,
    total: usize,
    mut aggregator: ResultAggregator,
    mut sender: ProgressSender,
) where
    F: Future<Output = (String, Result<Result<FileResult, FileFault>, JoinError>)>,
{
    while let Some((name, outcome)) = jobs.next().await {
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(fault)) => {
                warn!(file = %name, error = %fault, "job did not complete");
                FileResult::failed(name, &fault)
            }
            Err(join_error) => {
                let fault = join_fault(join_error);
                warn!(file = %name, error = %fault, "job task failed");
                FileResult::failed(name, &fault)
            }
        };

        let current_file = result.file_name().to_string();
        let error = result.parse_error().map(str::to_string);
        if let Err(e) = aggregator.accumulate(result) {
            error!(error = %e, "aggregator rejected a result");
            sender.send(BatchEvent::failed(e)).await;
            return;
        }

        let update = ProgressUpdate {
            processed: aggregator.processed(),
            total,
            current_file,
            faulty_count: aggregator.faulty_count(),
            error,
        };
        debug!(processed = update.processed, total, "progress");
        sender.send(BatchEvent::Progress(update)).await;
    }

    match aggregator.finalize() {
        Ok(results) => {
            info!(
                total = results.total(),
                faulty = results.faulty_count(),
                normal = results.normal_count(),
                "batch complete"
            );
            sender.send(BatchEvent::Complete(Arc::new(results))).await;
        }
        Err(e) => {
            error!(error = %e, "batch could not be finalized");
            sender.send(BatchEvent::failed(e)).await;
        }
    }
}

fn join_fault(e: JoinError) -> FileFault {
    if e.is_panic() {
        FileFault::Worker(format!("validation panicked: {}", panic_message(e.into_panic())))
    } else {
        FileFault::Worker("validation was cancelled".to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
