//! Job queue broker
//!
//! A broker holds named queues of opaque jobs and hands them to competing
//! consumers with at-least-once semantics:
//! - a claimed job is leased to one consumer for its timeout
//! - `ack` removes it, `fail` schedules a retry after a backoff window
//! - a job that exhausts its attempts, or fails non-retryably, is dead-lettered
//! - a lease that expires without ack/fail counts as a failed attempt
//!
//! No ordering is guaranteed between jobs of the same queue.

mod db;
pub(crate) mod remote;

pub use db::RedbBroker;
pub use remote::RespBroker;

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default retry budget per job
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

/// Default per-job deadline
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque job identifier assigned by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    /// Generate a fresh random identifier
    ///
    /// # Errors
    ///
    /// Returns an error if the system random source fails.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 16];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| Error::Storage("Failed to generate job id".to_string()))?;
        Ok(Self(bytes.iter().map(|b| format!("{b:02x}")).collect()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job claimed from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobHandle,
    pub queue: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    /// 1-based delivery count, including this one
    pub attempt: u32,
    pub max_attempts: u32,
    /// Deadline the consumer must finish within
    pub timeout: Duration,
}

/// Per-job enqueue options
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Keep the job invisible for this long after enqueue
    pub delay: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_JOB_TIMEOUT,
            delay: Duration::ZERO,
        }
    }
}

/// Exponential backoff between delivery attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before redelivering a job that just failed its `attempt`-th delivery
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
        }
    }
}

/// What happened to a job after a failed delivery
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Redelivered after `retry_in`
    Retry { attempt: u32, retry_in: Duration },
    /// Moved to the dead-letter set; not retried automatically
    DeadLettered,
}

/// A job that exhausted its retry budget or failed permanently
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: JobHandle,
    pub queue: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable, at-least-once job queue shared by producers and consumers
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a job to `queue`
    ///
    /// # Errors
    ///
    /// Returns an error if the queue name is invalid or the broker is unavailable.
    async fn enqueue(
        &self,
        queue: &str,
        task_type: &str,
        payload: &[u8],
        options: &EnqueueOptions,
    ) -> Result<JobHandle>;

    /// Claim the next visible job from `queue`, waiting up to `wait` for one
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unavailable.
    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<Job>>;

    /// Acknowledge a successfully processed delivery
    ///
    /// # Errors
    ///
    /// Returns `Error::JobNotFound` if the delivery is no longer leased to the
    /// caller (lease expired and the job was reclaimed).
    async fn ack(&self, job: &Job) -> Result<()>;

    /// Report a failed delivery
    ///
    /// # Errors
    ///
    /// Returns `Error::JobNotFound` if the delivery is no longer leased to the caller.
    async fn fail(&self, job: &Job, reason: &str, retryable: bool) -> Result<FailOutcome>;

    /// List dead-lettered jobs of `queue`, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unavailable.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Take or renew the named lease for `holder`
    ///
    /// Returns `false` if another holder owns an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unavailable.
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Drop the named lease if `holder` owns it
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unavailable.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// Check a queue name against the characters the broker index allows
///
/// # Errors
///
/// Returns `Error::InvalidArguments` for empty names or names with other characters.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArguments(format!("invalid queue name '{name}'")))
    }
}
