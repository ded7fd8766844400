//! Durable broker backed by redb embedded storage
//!
//! Every state transition of a job (enqueue, claim, ack, retry, dead-letter,
//! lease reclaim) happens in a single write transaction, so a crash never
//! leaves a job in two states or in none.

use super::{
    validate_queue_name, Broker, DeadLetter, EnqueueOptions, FailOutcome, Job, JobHandle,
    RetryPolicy,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database as RedbDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type IndexDefinition = TableDefinition<'static, &'static str, &'static str>;

/// Job metadata, JSON-encoded, keyed by job id
const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Job payloads, keyed by job id
const PAYLOADS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("payloads");

/// Visibility index
/// Key: "{queue}:{visible_at_ms:020}:{id}", Value: job id
const PENDING_TABLE: IndexDefinition = TableDefinition::new("pending");

/// Lease index for claimed jobs
/// Key: "{deadline_ms:020}:{id}", Value: job id
const ACTIVE_TABLE: IndexDefinition = TableDefinition::new("active");

/// Dead-letter index
/// Key: "{queue}:{failed_at_ms:020}:{id}", Value: job id
const DEAD_TABLE: IndexDefinition = TableDefinition::new("dead");

/// Named leases, JSON-encoded
const LEASES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Extra lease time beyond the job timeout, so the consumer's own deadline
/// fires before the broker reclaims the job
const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(10);

/// Shortest sleep between claim attempts while waiting on a delayed job
const MIN_WAKEUP: Duration = Duration::from_millis(5);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
enum JobState {
    Pending,
    Active,
    Dead,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct JobRecord {
    id: String,
    queue: String,
    task_type: String,
    state: JobState,
    /// Deliveries so far
    attempts: u32,
    max_attempts: u32,
    timeout_ms: u64,
    /// Key of the job's entry in the pending, active or dead index
    index_key: String,
    enqueued_at_ms: u64,
    last_error: Option<String>,
    failed_at_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug)]
struct LeaseRecord {
    holder: String,
    expires_at_ms: u64,
}

/// Broker over a local redb database file
///
/// Safe to share across tasks behind an `Arc`; redb serialises writers, so
/// competing consumers never claim the same job twice.
pub struct RedbBroker {
    db: RedbDatabase,
    retry_policy: RetryPolicy,
    lease_grace: Duration,
    /// Wakes consumers blocked in `dequeue` when a queue receives work
    queue_notifiers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl RedbBroker {
    /// Open or create a broker database at the given path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path is invalid
    /// - Permission denied
    /// - Database file is corrupted or locked by another process
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening broker database at: {}", path.display());

        let db = RedbDatabase::create(path).map_err(storage("Failed to open database"))?;

        let txn = db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;
        {
            txn.open_table(JOBS_TABLE)
                .map_err(storage("Failed to open jobs table"))?;
            txn.open_table(PAYLOADS_TABLE)
                .map_err(storage("Failed to open payloads table"))?;
            txn.open_table(PENDING_TABLE)
                .map_err(storage("Failed to open pending table"))?;
            txn.open_table(ACTIVE_TABLE)
                .map_err(storage("Failed to open active table"))?;
            txn.open_table(DEAD_TABLE)
                .map_err(storage("Failed to open dead table"))?;
            txn.open_table(LEASES_TABLE)
                .map_err(storage("Failed to open leases table"))?;
        }
        txn.commit()
            .map_err(storage("Failed to commit initialization"))?;

        Ok(Self {
            db,
            retry_policy: RetryPolicy::default(),
            lease_grace: DEFAULT_LEASE_GRACE,
            queue_notifiers: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    /// Number of jobs waiting in `queue`, including delayed retries
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub fn pending_len(&self, queue: &str) -> Result<usize> {
        let prefix = format!("{queue}:");
        let end = format!("{queue};");
        self.count_index(PENDING_TABLE, &prefix, &end)
    }

    /// Number of jobs currently leased to consumers, across all queues
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub fn active_len(&self) -> Result<usize> {
        self.count_index(ACTIVE_TABLE, "", ";")
    }

    fn count_index(&self, def: IndexDefinition, start: &str, end: &str) -> Result<usize> {
        let txn = self
            .db
            .begin_read()
            .map_err(storage("Failed to begin read transaction"))?;
        let table = txn
            .open_table(def)
            .map_err(storage("Failed to open index table"))?;
        let mut count = 0;
        for entry in table
            .range(start..end)
            .map_err(storage("Failed to scan index"))?
        {
            entry.map_err(storage("Failed to read index entry"))?;
            count += 1;
        }
        Ok(count)
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        let mut notifiers = match self.queue_notifiers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        notifiers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify(&self, queue: &str) {
        let notifiers = match self.queue_notifiers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(notify) = notifiers.get(queue) {
            notify.notify_waiters();
        }
    }

    /// Reclaim expired leases, then claim the next visible job of `queue`
    ///
    /// Returns the claimed job and the queues that got reclaimed jobs back.
    fn claim(&self, queue: &str) -> Result<(Option<Job>, Vec<String>)> {
        let now = now_ms();
        let txn = self
            .db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;

        let requeued = self.reclaim_expired(&txn, now)?;
        let job = self.claim_next(&txn, queue, now)?;

        txn.commit().map_err(storage("Failed to commit claim"))?;
        Ok((job, requeued))
    }

    fn reclaim_expired(&self, txn: &WriteTransaction, now: u64) -> Result<Vec<String>> {
        let expired = {
            let table = txn
                .open_table(ACTIVE_TABLE)
                .map_err(storage("Failed to open active table"))?;
            let upper = format!("{now:020};");
            let mut found = Vec::new();
            for entry in table
                .range(..upper.as_str())
                .map_err(storage("Failed to scan active table"))?
            {
                let (_, id) = entry.map_err(storage("Failed to read active entry"))?;
                found.push(id.value().to_string());
            }
            found
        };

        let mut requeued = Vec::new();
        for id in expired {
            let Some(record) = load_record(txn, &id)? else {
                continue;
            };
            if record.state != JobState::Active {
                continue;
            }
            warn!(
                job_id = %id,
                queue = %record.queue,
                attempt = record.attempts,
                "Lease expired without ack, reclaiming job"
            );
            let queue = record.queue.clone();
            if let FailOutcome::Retry { .. } =
                self.settle_failure(txn, record, "lease expired", true, now)?
            {
                requeued.push(queue);
            }
        }
        Ok(requeued)
    }

    fn claim_next(&self, txn: &WriteTransaction, queue: &str, now: u64) -> Result<Option<Job>> {
        let prefix = format!("{queue}:");
        let upper = format!("{prefix}{now:020};");

        loop {
            let next = {
                let table = txn
                    .open_table(PENDING_TABLE)
                    .map_err(storage("Failed to open pending table"))?;
                let mut range = table
                    .range(prefix.as_str()..upper.as_str())
                    .map_err(storage("Failed to scan pending table"))?;
                let mut found = None;
                if let Some(entry) = range.next() {
                    let (key, id) = entry.map_err(storage("Failed to read pending entry"))?;
                    found = Some((key.value().to_string(), id.value().to_string()));
                }
                found
            };

            let Some((key, id)) = next else {
                return Ok(None);
            };
            index_remove(txn, PENDING_TABLE, &key)?;

            let Some(mut record) = load_record(txn, &id)? else {
                warn!(job_id = %id, "Dropping dangling pending entry");
                continue;
            };

            record.attempts += 1;
            record.state = JobState::Active;
            let deadline = now
                .saturating_add(record.timeout_ms)
                .saturating_add(duration_ms(self.lease_grace));
            record.index_key = active_key(deadline, &id);
            index_insert(txn, ACTIVE_TABLE, &record.index_key, &id)?;
            save_record(txn, &record)?;

            let payload = load_payload(txn, &id)?.unwrap_or_default();

            return Ok(Some(Job {
                id: JobHandle::from(record.id),
                queue: record.queue,
                task_type: record.task_type,
                payload,
                attempt: record.attempts,
                max_attempts: record.max_attempts,
                timeout: Duration::from_millis(record.timeout_ms),
            }));
        }
    }

    /// Move an active job to retry or dead-letter
    fn settle_failure(
        &self,
        txn: &WriteTransaction,
        mut record: JobRecord,
        reason: &str,
        retryable: bool,
        now: u64,
    ) -> Result<FailOutcome> {
        index_remove(txn, ACTIVE_TABLE, &record.index_key)?;
        record.last_error = Some(reason.to_string());

        if retryable && record.attempts < record.max_attempts {
            let retry_in = self.retry_policy.delay_for(record.attempts);
            let visible_at = now.saturating_add(duration_ms(retry_in));
            record.state = JobState::Pending;
            record.index_key = pending_key(&record.queue, visible_at, &record.id);
            index_insert(txn, PENDING_TABLE, &record.index_key, &record.id)?;
            save_record(txn, &record)?;

            debug!(
                job_id = %record.id,
                queue = %record.queue,
                "Job scheduled for retry {}/{} in {:?}",
                record.attempts,
                record.max_attempts,
                retry_in
            );
            Ok(FailOutcome::Retry {
                attempt: record.attempts,
                retry_in,
            })
        } else {
            record.state = JobState::Dead;
            record.failed_at_ms = Some(now);
            record.index_key = dead_key(&record.queue, now, &record.id);
            index_insert(txn, DEAD_TABLE, &record.index_key, &record.id)?;
            save_record(txn, &record)?;

            error!(
                job_id = %record.id,
                queue = %record.queue,
                task_type = %record.task_type,
                "Job moved to dead-letter after {} attempt(s): {}",
                record.attempts,
                reason
            );
            Ok(FailOutcome::DeadLettered)
        }
    }

    /// Load the record behind a delivery, if the caller still holds its lease
    fn leased_record(&self, txn: &WriteTransaction, job: &Job) -> Result<JobRecord> {
        match load_record(txn, job.id.as_str())? {
            Some(record) if record.state == JobState::Active && record.attempts == job.attempt => {
                Ok(record)
            }
            _ => Err(Error::JobNotFound(job.id.to_string())),
        }
    }

    /// Earliest moment something may become claimable: a delayed job turning
    /// visible in `queue`, or any lease expiring
    fn next_wakeup(&self, queue: &str) -> Result<Option<u64>> {
        let txn = self
            .db
            .begin_read()
            .map_err(storage("Failed to begin read transaction"))?;

        let prefix = format!("{queue}:");
        let end = format!("{queue};");
        let pending = txn
            .open_table(PENDING_TABLE)
            .map_err(storage("Failed to open pending table"))?;
        let mut next_visible = None;
        if let Some(entry) = pending
            .range(prefix.as_str()..end.as_str())
            .map_err(storage("Failed to scan pending table"))?
            .next()
        {
            let (key, _) = entry.map_err(storage("Failed to read pending entry"))?;
            next_visible = parse_stamp(&key.value()[prefix.len()..]);
        }

        let active = txn
            .open_table(ACTIVE_TABLE)
            .map_err(storage("Failed to open active table"))?;
        let mut next_expiry = None;
        if let Some(entry) = active
            .iter()
            .map_err(storage("Failed to scan active table"))?
            .next()
        {
            let (key, _) = entry.map_err(storage("Failed to read active entry"))?;
            next_expiry = parse_stamp(key.value());
        }

        Ok(match (next_visible, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }
}

#[async_trait]
impl Broker for RedbBroker {
    async fn enqueue(
        &self,
        queue: &str,
        task_type: &str,
        payload: &[u8],
        options: &EnqueueOptions,
    ) -> Result<JobHandle> {
        validate_queue_name(queue)?;
        if task_type.is_empty() {
            return Err(Error::InvalidArguments("task type cannot be empty".to_string()));
        }
        if options.max_attempts == 0 {
            return Err(Error::InvalidArguments(
                "max attempts must be at least 1".to_string(),
            ));
        }
        // The lease is sized from the timeout; a zero lease would be reclaimed mid-run
        if options.timeout.is_zero() {
            return Err(Error::InvalidArguments(
                "job timeout must be positive".to_string(),
            ));
        }

        let id = JobHandle::generate()?;
        let now = now_ms();
        let visible_at = now.saturating_add(duration_ms(options.delay));
        let record = JobRecord {
            id: id.to_string(),
            queue: queue.to_string(),
            task_type: task_type.to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_attempts: options.max_attempts,
            timeout_ms: duration_ms(options.timeout),
            index_key: pending_key(queue, visible_at, id.as_str()),
            enqueued_at_ms: now,
            last_error: None,
            failed_at_ms: None,
        };

        let txn = self
            .db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;
        save_record(&txn, &record)?;
        {
            let mut table = txn
                .open_table(PAYLOADS_TABLE)
                .map_err(storage("Failed to open payloads table"))?;
            table
                .insert(id.as_str(), payload)
                .map_err(storage("Failed to store payload"))?;
        }
        index_insert(&txn, PENDING_TABLE, &record.index_key, id.as_str())?;
        txn.commit().map_err(storage("Failed to commit enqueue"))?;

        self.notify(queue);

        debug!(
            job_id = %id,
            queue,
            task_type,
            "ENQUEUE {} bytes",
            payload.len()
        );
        Ok(id)
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<Job>> {
        validate_queue_name(queue)?;
        let deadline = Instant::now() + wait;
        let notifier = self.notifier(queue);

        loop {
            // Register interest before checking, so an enqueue racing with
            // the claim below still wakes us.
            let notified = notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (job, requeued) = self.claim(queue)?;
            for other in &requeued {
                self.notify(other);
            }

            if let Some(job) = job {
                debug!(
                    job_id = %job.id,
                    queue,
                    attempt = job.attempt,
                    "DEQUEUE {} bytes",
                    job.payload.len()
                );
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            if let Some(at) = self.next_wakeup(queue)? {
                let until = Duration::from_millis(at.saturating_sub(now_ms()));
                sleep_for = sleep_for.min(until.max(MIN_WAKEUP));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;

        let record = self.leased_record(&txn, job)?;
        index_remove(&txn, ACTIVE_TABLE, &record.index_key)?;
        {
            let mut jobs = txn
                .open_table(JOBS_TABLE)
                .map_err(storage("Failed to open jobs table"))?;
            jobs.remove(record.id.as_str())
                .map_err(storage("Failed to remove job"))?;
        }
        {
            let mut payloads = txn
                .open_table(PAYLOADS_TABLE)
                .map_err(storage("Failed to open payloads table"))?;
            payloads
                .remove(record.id.as_str())
                .map_err(storage("Failed to remove payload"))?;
        }
        txn.commit().map_err(storage("Failed to commit ack"))?;

        debug!(job_id = %job.id, queue = %record.queue, "ACK");
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str, retryable: bool) -> Result<FailOutcome> {
        let txn = self
            .db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;

        let record = self.leased_record(&txn, job)?;
        let queue = record.queue.clone();
        let outcome = self.settle_failure(&txn, record, reason, retryable, now_ms())?;
        txn.commit().map_err(storage("Failed to commit failure"))?;

        if matches!(outcome, FailOutcome::Retry { .. }) {
            self.notify(&queue);
        }
        Ok(outcome)
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        validate_queue_name(queue)?;
        let txn = self
            .db
            .begin_read()
            .map_err(storage("Failed to begin read transaction"))?;

        let dead = txn
            .open_table(DEAD_TABLE)
            .map_err(storage("Failed to open dead table"))?;
        let jobs = txn
            .open_table(JOBS_TABLE)
            .map_err(storage("Failed to open jobs table"))?;
        let payloads = txn
            .open_table(PAYLOADS_TABLE)
            .map_err(storage("Failed to open payloads table"))?;

        let prefix = format!("{queue}:");
        let end = format!("{queue};");
        let mut letters = Vec::new();
        for entry in dead
            .range(prefix.as_str()..end.as_str())
            .map_err(storage("Failed to scan dead table"))?
            .take(limit)
        {
            let (_, id) = entry.map_err(storage("Failed to read dead entry"))?;
            let id = id.value().to_string();

            let Some(bytes) = jobs
                .get(id.as_str())
                .map_err(storage("Failed to read job"))?
                .map(|v| v.value().to_vec())
            else {
                continue;
            };
            let record = decode_record(&id, &bytes)?;
            let payload = payloads
                .get(id.as_str())
                .map_err(storage("Failed to read payload"))?
                .map(|v| v.value().to_vec())
                .unwrap_or_default();

            let failed_at_ms = record.failed_at_ms.unwrap_or(record.enqueued_at_ms);
            letters.push(DeadLetter {
                id: JobHandle::from(record.id),
                queue: record.queue,
                task_type: record.task_type,
                payload,
                attempts: record.attempts,
                last_error: record.last_error.unwrap_or_default(),
                failed_at: millis_to_datetime(failed_at_ms),
            });
        }
        Ok(letters)
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let txn = self
            .db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;

        let acquired = {
            let mut table = txn
                .open_table(LEASES_TABLE)
                .map_err(storage("Failed to open leases table"))?;
            let current = table
                .get(name)
                .map_err(storage("Failed to read lease"))?
                .map(|v| v.value().to_vec());
            let current: Option<LeaseRecord> = match current {
                Some(bytes) => serde_json::from_slice(&bytes).ok(),
                None => None,
            };

            let free = match &current {
                Some(lease) => lease.holder == holder || lease.expires_at_ms <= now,
                None => true,
            };
            if free {
                let lease = LeaseRecord {
                    holder: holder.to_string(),
                    expires_at_ms: now.saturating_add(duration_ms(ttl)),
                };
                let bytes = serde_json::to_vec(&lease)
                    .map_err(|e| Error::Storage(format!("Failed to encode lease: {e}")))?;
                table
                    .insert(name, bytes.as_slice())
                    .map_err(storage("Failed to write lease"))?;
            }
            free
        };
        txn.commit().map_err(storage("Failed to commit lease"))?;

        debug!("LEASE {} for {} -> {}", name, holder, acquired);
        Ok(acquired)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(storage("Failed to begin write transaction"))?;
        {
            let mut table = txn
                .open_table(LEASES_TABLE)
                .map_err(storage("Failed to open leases table"))?;
            let current = table
                .get(name)
                .map_err(storage("Failed to read lease"))?
                .map(|v| v.value().to_vec());
            let owned = current
                .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok())
                .is_some_and(|lease| lease.holder == holder);
            if owned {
                table
                    .remove(name)
                    .map_err(storage("Failed to remove lease"))?;
            }
        }
        txn.commit().map_err(storage("Failed to commit lease release"))?;
        Ok(())
    }
}

fn storage<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Storage(format!("{context}: {e}"))
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

fn pending_key(queue: &str, visible_at_ms: u64, id: &str) -> String {
    format!("{queue}:{visible_at_ms:020}:{id}")
}

fn active_key(deadline_ms: u64, id: &str) -> String {
    format!("{deadline_ms:020}:{id}")
}

fn dead_key(queue: &str, failed_at_ms: u64, id: &str) -> String {
    format!("{queue}:{failed_at_ms:020}:{id}")
}

/// Read the zero-padded millisecond stamp at the start of an index key suffix
fn parse_stamp(suffix: &str) -> Option<u64> {
    suffix.get(..20).and_then(|s| s.parse().ok())
}

fn decode_record(id: &str, bytes: &[u8]) -> Result<JobRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Storage(format!("Corrupt job record {id}: {e}")))
}

fn load_record(txn: &WriteTransaction, id: &str) -> Result<Option<JobRecord>> {
    let table = txn
        .open_table(JOBS_TABLE)
        .map_err(storage("Failed to open jobs table"))?;
    let bytes = table
        .get(id)
        .map_err(storage("Failed to read job"))?
        .map(|v| v.value().to_vec());
    bytes.map(|b| decode_record(id, &b)).transpose()
}

fn save_record(txn: &WriteTransaction, record: &JobRecord) -> Result<()> {
    let bytes = serde_json::to_vec(record)
        .map_err(|e| Error::Storage(format!("Failed to encode job record: {e}")))?;
    let mut table = txn
        .open_table(JOBS_TABLE)
        .map_err(storage("Failed to open jobs table"))?;
    table
        .insert(record.id.as_str(), bytes.as_slice())
        .map_err(storage("Failed to write job"))?;
    Ok(())
}

fn load_payload(txn: &WriteTransaction, id: &str) -> Result<Option<Vec<u8>>> {
    let table = txn
        .open_table(PAYLOADS_TABLE)
        .map_err(storage("Failed to open payloads table"))?;
    let payload = table
        .get(id)
        .map_err(storage("Failed to read payload"))?
        .map(|v| v.value().to_vec());
    Ok(payload)
}

fn index_insert(txn: &WriteTransaction, def: IndexDefinition, key: &str, id: &str) -> Result<()> {
    let mut table = txn
        .open_table(def)
        .map_err(storage("Failed to open index table"))?;
    table
        .insert(key, id)
        .map_err(storage("Failed to insert index entry"))?;
    Ok(())
}

fn index_remove(txn: &WriteTransaction, def: IndexDefinition, key: &str) -> Result<()> {
    let mut table = txn
        .open_table(def)
        .map_err(storage("Failed to open index table"))?;
    table
        .remove(key)
        .map_err(storage("Failed to remove index entry"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_broker() -> (RedbBroker, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let broker = RedbBroker::open(&db_path)
            .unwrap()
            .with_retry_policy(RetryPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            })
            .with_lease_grace(Duration::ZERO);
        (broker, temp_dir)
    }

    fn options(max_attempts: u32) -> EnqueueOptions {
        EnqueueOptions {
            max_attempts,
            ..EnqueueOptions::default()
        }
    }

    #[test]
    fn test_broker_open() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.redb");
        assert!(RedbBroker::open(&db_path).is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue() {
        let (broker, _temp) = test_broker();

        let id = broker
            .enqueue("agents", "agent:run", b"{\"agent_id\":1}", &options(3))
            .await
            .unwrap();
        assert_eq!(broker.pending_len("agents").unwrap(), 1);

        let job = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.queue, "agents");
        assert_eq!(job.task_type, "agent:run");
        assert_eq!(job.payload, b"{\"agent_id\":1}");
        assert_eq!(job.attempt, 1);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(broker.pending_len("agents").unwrap(), 0);
        assert_eq!(broker.active_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_input() {
        let (broker, _temp) = test_broker();

        let bad_queue = broker
            .enqueue("bad queue", "agent:run", b"", &options(1))
            .await;
        assert!(matches!(bad_queue, Err(Error::InvalidArguments(_))));

        let no_type = broker.enqueue("agents", "", b"", &options(1)).await;
        assert!(matches!(no_type, Err(Error::InvalidArguments(_))));

        let no_attempts = broker
            .enqueue("agents", "agent:run", b"", &options(0))
            .await;
        assert!(matches!(no_attempts, Err(Error::InvalidArguments(_))));

        let no_timeout = EnqueueOptions {
            timeout: Duration::ZERO,
            ..options(1)
        };
        let no_timeout = broker.enqueue("agents", "agent:run", b"", &no_timeout).await;
        assert!(matches!(no_timeout, Err(Error::InvalidArguments(_))));
        assert_eq!(broker.pending_len("agents").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_timeout() {
        let (broker, _temp) = test_broker();

        let start = std::time::Instant::now();
        let job = broker
            .dequeue("agents", Duration::from_millis(300))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(job.is_none());
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let (broker, _temp) = test_broker();
        let broker = Arc::new(broker);

        let producer = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            producer
                .enqueue("events", "events:collection", b"late", &options(1))
                .await
                .unwrap();
        });

        let start = std::time::Instant::now();
        let job = broker
            .dequeue("events", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.payload, b"late");
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let (broker, _temp) = test_broker();

        broker
            .enqueue("events", "events:collection", b"e", &options(1))
            .await
            .unwrap();

        assert!(broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        assert!(broker
            .dequeue("events", Duration::ZERO)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_ack_removes_job() {
        let (broker, _temp) = test_broker();

        broker
            .enqueue("agents", "agent:run", b"x", &options(3))
            .await
            .unwrap();
        let job = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        broker.ack(&job).await.unwrap();
        assert_eq!(broker.active_len().unwrap(), 0);
        assert_eq!(broker.pending_len("agents").unwrap(), 0);

        // Second ack of the same delivery is stale
        assert!(matches!(broker.ack(&job).await, Err(Error::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_retryable_failure_redelivers() {
        let (broker, _temp) = test_broker();

        broker
            .enqueue("agents", "agent:run", b"x", &options(3))
            .await
            .unwrap();
        let first = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let outcome = broker.fail(&first, "runner exploded", true).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retry {
                attempt: 1,
                retry_in: Duration::ZERO
            }
        );

        let second = broker
            .dequeue("agents", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let temp_dir = TempDir::new().unwrap();
        let broker = RedbBroker::open(temp_dir.path().join("test.redb"))
            .unwrap()
            .with_retry_policy(RetryPolicy {
                base_delay: Duration::from_millis(400),
                max_delay: Duration::from_secs(1),
            });

        broker
            .enqueue("agents", "agent:run", b"x", &options(3))
            .await
            .unwrap();
        let job = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.fail(&job, "transient", true).await.unwrap();

        // Invisible during the backoff window
        assert!(broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        assert_eq!(broker.pending_len("agents").unwrap(), 1);

        let start = std::time::Instant::now();
        let retried = broker
            .dequeue("agents", Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempt, 2);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let (broker, _temp) = test_broker();

        broker
            .enqueue("agents", "agent:run", b"payload", &options(2))
            .await
            .unwrap();

        let first = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.fail(&first, "boom 1", true).await.unwrap();

        let second = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let outcome = broker.fail(&second, "boom 2", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);

        assert!(broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        let dead = broker.dead_letters("agents", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, first.id);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].last_error, "boom 2");
        assert_eq!(dead[0].payload, b"payload");
        assert_eq!(dead[0].task_type, "agent:run");
    }

    #[tokio::test]
    async fn test_non_retryable_failure_skips_retry_budget() {
        let (broker, _temp) = test_broker();

        broker
            .enqueue("events", "events:collection", b"not json", &options(25))
            .await
            .unwrap();
        let job = broker
            .dequeue("events", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let outcome = broker.fail(&job, "decode error", false).await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);

        let dead = broker.dead_letters("events", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert!(broker.dead_letters("agents", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (broker, _temp) = test_broker();

        let opts = EnqueueOptions {
            max_attempts: 3,
            timeout: Duration::from_millis(50),
            delay: Duration::ZERO,
        };
        broker
            .enqueue("agents", "agent:run", b"x", &opts)
            .await
            .unwrap();

        let abandoned = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let redelivered = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.id, abandoned.id);
        assert_eq!(redelivered.attempt, 2);

        // The first consumer lost its lease
        assert!(matches!(
            broker.ack(&abandoned).await,
            Err(Error::JobNotFound(_))
        ));
        broker.ack(&redelivered).await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_job_is_invisible_until_due() {
        let (broker, _temp) = test_broker();

        let opts = EnqueueOptions {
            delay: Duration::from_millis(300),
            ..EnqueueOptions::default()
        };
        broker
            .enqueue("agents", "agent:run", b"later", &opts)
            .await
            .unwrap();

        assert!(broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        let job = broker
            .dequeue("agents", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        {
            let broker = RedbBroker::open(&db_path).unwrap();
            broker
                .enqueue("agents", "agent:run", b"durable", &options(3))
                .await
                .unwrap();
        }

        let broker = RedbBroker::open(&db_path).unwrap();
        let job = broker
            .dequeue("agents", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload, b"durable");
    }

    #[tokio::test]
    async fn test_lease_contention_and_expiry() {
        let (broker, _temp) = test_broker();
        let ttl = Duration::from_millis(200);

        assert!(broker.acquire_lease("scheduler", "a", ttl).await.unwrap());
        assert!(!broker.acquire_lease("scheduler", "b", ttl).await.unwrap());
        // Renewal by the holder succeeds
        assert!(broker.acquire_lease("scheduler", "a", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(broker.acquire_lease("scheduler", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_release_only_by_holder() {
        let (broker, _temp) = test_broker();
        let ttl = Duration::from_secs(30);

        assert!(broker.acquire_lease("scheduler", "a", ttl).await.unwrap());
        broker.release_lease("scheduler", "b").await.unwrap();
        assert!(!broker.acquire_lease("scheduler", "b", ttl).await.unwrap());

        broker.release_lease("scheduler", "a").await.unwrap();
        assert!(broker.acquire_lease("scheduler", "b", ttl).await.unwrap());
    }
}
