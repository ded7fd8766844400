//! Worker pool: competing consumers that drain named queues
//!
//! Each configured queue gets its own set of consumer tasks, so a slow queue
//! only throttles itself. A consumer loops:
//! 1. Dequeue from its queue (blocking up to the poll wait)
//! 2. Look up the handler registered for the job's task type
//! 3. Run it under the job's deadline
//! 4. On success: ack
//! 5. On failure or timeout: report to the broker, which retries or dead-letters

use crate::broker::{Broker, FailOutcome, Job};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a consumer blocks on an empty queue before checking for shutdown
const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(5);

/// Back-off after a broker error, to avoid tight error loops
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Processes jobs of one task type
///
/// Returning `Ok` acknowledges the job. Returning an error hands it back to
/// the broker; errors for which [`Error::is_retryable`] is false skip the
/// remaining retry budget. Handlers may run more than once for the same job.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Handlers keyed by task type
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, replacing any previous one
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn Handler>) {
        let task_type = task_type.into();
        debug!("Registered handler for task type '{}'", task_type);
        self.handlers.insert(task_type, handler);
    }

    #[must_use]
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }
}

/// Pool of consumers over one broker
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    queues: Vec<(String, usize)>,
    poll_wait: Duration,
}

impl WorkerPool {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, registry: HandlerRegistry) -> Self {
        Self {
            broker,
            registry: Arc::new(registry),
            queues: Vec::new(),
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }

    /// Consume `queue` with `concurrency` simultaneous in-flight jobs
    #[must_use]
    pub fn queue(mut self, name: impl Into<String>, concurrency: usize) -> Self {
        self.queues.push((name.into(), concurrency.max(1)));
        self
    }

    #[must_use]
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    /// Run all consumers until `shutdown` is cancelled
    ///
    /// In-flight jobs run to completion before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if no queue was configured.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.queues.is_empty() {
            return Err(Error::Config("worker pool has no queues".to_string()));
        }

        let mut consumers = JoinSet::new();
        for (queue, concurrency) in &self.queues {
            info!("Starting {} consumer(s) on queue '{}'", concurrency, queue);
            for _ in 0..*concurrency {
                consumers.spawn(consume(
                    Arc::clone(&self.broker),
                    Arc::clone(&self.registry),
                    queue.clone(),
                    self.poll_wait,
                    shutdown.clone(),
                ));
            }
        }

        while let Some(joined) = consumers.join_next().await {
            if let Err(e) = joined {
                error!("Consumer task panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

async fn consume(
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    queue: String,
    poll_wait: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let dequeued = tokio::select! {
            () = shutdown.cancelled() => return,
            dequeued = broker.dequeue(&queue, poll_wait) => dequeued,
        };

        match dequeued {
            Ok(Some(job)) => {
                if let Err(e) = process_job(broker.as_ref(), &registry, job).await {
                    error!(queue = %queue, "Failed to settle job: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(queue = %queue, "Error dequeuing: {}", e);
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

/// Run one claimed job through its handler and settle it with the broker
///
/// # Errors
///
/// Returns an error only if the broker could not record the outcome; the
/// job is then redelivered once its lease expires.
pub async fn process_job(broker: &dyn Broker, registry: &HandlerRegistry, job: Job) -> Result<()> {
    debug!(
        job_id = %job.id,
        queue = %job.queue,
        task_type = %job.task_type,
        attempt = job.attempt,
        "Processing job"
    );

    let result = match registry.get(&job.task_type) {
        Some(handler) => match timeout(job.timeout, handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        },
        None => Err(Error::HandlerNotFound(job.task_type.clone())),
    };

    match result {
        Ok(()) => match broker.ack(&job).await {
            Ok(()) => {
                debug!(job_id = %job.id, queue = %job.queue, "Job completed");
                Ok(())
            }
            Err(Error::JobNotFound(_)) => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    "Job finished after its lease expired; it will run again"
                );
                Ok(())
            }
            Err(e) => Err(e),
        },
        Err(e) => {
            let outcome = match broker.fail(&job, &e.to_string(), e.is_retryable()).await {
                Ok(outcome) => outcome,
                Err(Error::JobNotFound(_)) => {
                    warn!(job_id = %job.id, queue = %job.queue, "Lease lost before failure was recorded");
                    return Ok(());
                }
                Err(settle) => return Err(settle),
            };
            match outcome {
                FailOutcome::Retry { attempt, retry_in } => warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    task_type = %job.task_type,
                    "Job failed, retrying ({}/{}) in {:?}: {}",
                    attempt,
                    job.max_attempts,
                    retry_in,
                    e
                ),
                FailOutcome::DeadLettered => error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    task_type = %job.task_type,
                    "Job failed permanently after {} attempt(s): {}",
                    job.attempt,
                    e
                ),
            }
            Ok(())
        }
    }
}
