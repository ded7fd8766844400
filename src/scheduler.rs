//! Cron scheduler: enqueues agent jobs straight onto the `agents` queue
//!
//! Cron jobs bypass the dispatcher and the subscription resolver. Two live
//! schedulers would fire every job twice, so a scheduler holds the broker
//! lease [`SCHEDULER_LEASE`] for as long as it runs and refuses to start
//! while another instance holds it.

use crate::agents::{Agent, CronAgentSource};
use crate::broker::{Broker, EnqueueOptions, JobHandle};
use crate::error::{Error, Result};
use crate::jobs::{enqueue_agent_job, AgentJob, TriggerType};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the singleton lease
pub const SCHEDULER_LEASE: &str = "scheduler";

/// Lease lifetime; renewed every tick
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Longest sleep between ticks
const MAX_TICK: Duration = Duration::from_secs(1);

const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Parse a cron expression
///
/// Five-field expressions (minute granularity) get a `0` seconds field
/// prepended; six and seven-field expressions are used as written.
///
/// # Errors
///
/// Returns `Error::InvalidArguments` if the expression does not parse.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidArguments(format!("invalid cron expression '{expression}': {e}")))
}

struct Entry {
    agent: Agent,
    expression: String,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    broker: Arc<dyn Broker>,
    source: Arc<dyn CronAgentSource>,
    job_options: EnqueueOptions,
    reload_interval: Duration,
    lease_ttl: Duration,
    holder: String,
    entries: HashMap<u64, Entry>,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>, source: Arc<dyn CronAgentSource>) -> Self {
        let holder = JobHandle::generate()
            .map(|h| format!("scheduler-{}-{h}", std::process::id()))
            .unwrap_or_else(|_| format!("scheduler-{}", std::process::id()));
        Self {
            broker,
            source,
            job_options: EnqueueOptions::default(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
            holder,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_job_options(mut self, options: EnqueueOptions) -> Self {
        self.job_options = options;
        self
    }

    #[must_use]
    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = interval;
        self
    }

    /// Lifetime of the singleton lease
    ///
    /// If renewals keep failing, the scheduler stops once half of it has
    /// passed since the last successful renewal.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Identity this instance uses for the singleton lease
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Next fire time of an agent, if it is scheduled
    #[must_use]
    pub fn next_fire(&self, agent_id: u64) -> Option<DateTime<Utc>> {
        self.entries.get(&agent_id).and_then(|e| e.next)
    }

    /// Number of agents currently scheduled
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-read cron agents and rebuild the schedule as of `now`
    ///
    /// Agents whose expression did not change keep their pending fire time.
    /// Agents with an unparsable expression are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent source fails; the previous schedule is kept.
    pub async fn reload(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let agents = self.source.cron_agents().await?;

        let mut entries = HashMap::with_capacity(agents.len());
        for agent in agents {
            let Some(expression) = agent.cron_expression.clone() else {
                continue;
            };

            if let Some(mut existing) = self.entries.remove(&agent.id) {
                if existing.expression == expression {
                    existing.agent = agent;
                    entries.insert(existing.agent.id, existing);
                    continue;
                }
            }

            let schedule = match parse_cron(&expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(agent_id = agent.id, "Skipping cron agent: {}", e);
                    continue;
                }
            };
            let next = schedule.after(&now).next();
            if next.is_none() {
                warn!(agent_id = agent.id, "Cron expression '{}' never fires", expression);
            }
            debug!(agent_id = agent.id, "Scheduled '{}', next fire at {:?}", expression, next);
            entries.insert(
                agent.id,
                Entry {
                    agent,
                    expression,
                    schedule,
                    next,
                },
            );
        }

        for removed in self.entries.keys() {
            debug!(agent_id = removed, "Agent no longer scheduled");
        }
        self.entries = entries;

        info!("Loaded {} cron agent(s)", self.entries.len());
        Ok(self.entries.len())
    }

    /// Enqueue a job for every agent due at `now`
    ///
    /// Several missed fire times collapse into a single job. A job that fails
    /// to enqueue stays due and is retried on the next tick.
    ///
    /// Returns the number of jobs enqueued.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for entry in self.entries.values_mut() {
            let Some(due) = entry.next else { continue };
            if due > now {
                continue;
            }

            let job = cron_job(&entry.agent, &entry.expression);
            match enqueue_agent_job(self.broker.as_ref(), &job, &self.job_options).await {
                Ok(id) => {
                    fired += 1;
                    entry.next = entry.schedule.after(&now).next();
                    debug!(
                        job_id = %id,
                        agent_id = entry.agent.id,
                        "Cron fired for {}, next at {:?}",
                        due,
                        entry.next
                    );
                }
                Err(e) => {
                    error!(agent_id = entry.agent.id, "Cron job not enqueued, will retry: {}", e);
                }
            }
        }
        fired
    }

    /// Run until `shutdown` is cancelled or the singleton lease is lost
    ///
    /// # Errors
    ///
    /// - `Error::LeaseHeld` if another scheduler holds the lease at startup,
    ///   takes it over while running, or the lease could not be renewed for
    ///   half its lifetime
    /// - broker errors while acquiring the lease
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if !self
            .broker
            .acquire_lease(SCHEDULER_LEASE, &self.holder, self.lease_ttl)
            .await?
        {
            return Err(Error::LeaseHeld(SCHEDULER_LEASE.to_string()));
        }
        let mut last_renewed = tokio::time::Instant::now();
        info!(holder = %self.holder, "Scheduler started");

        if let Err(e) = self.reload(Utc::now()).await {
            error!("Failed to load cron agents: {}", e);
        }
        let mut last_reload = tokio::time::Instant::now();

        let result = loop {
            let now = Utc::now();
            let until_next = self
                .entries
                .values()
                .filter_map(|e| e.next)
                .min()
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or(MAX_TICK);

            tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                () = tokio::time::sleep(until_next.min(MAX_TICK).min(self.lease_ttl / 4)) => {}
            }

            match self
                .broker
                .acquire_lease(SCHEDULER_LEASE, &self.holder, self.lease_ttl)
                .await
            {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    error!("Scheduler lease taken over by another instance, stopping");
                    break Err(Error::LeaseHeld(SCHEDULER_LEASE.to_string()));
                }
                Err(e) if last_renewed.elapsed() < self.lease_ttl / 2 => {
                    warn!("Failed to renew scheduler lease: {}", e);
                }
                Err(e) => {
                    error!(
                        "Scheduler lease not renewed for {:?}, stopping before it expires: {}",
                        last_renewed.elapsed(),
                        e
                    );
                    break Err(Error::LeaseHeld(SCHEDULER_LEASE.to_string()));
                }
            }

            if last_reload.elapsed() >= self.reload_interval {
                last_reload = tokio::time::Instant::now();
                if let Err(e) = self.reload(Utc::now()).await {
                    error!("Failed to reload cron agents: {}", e);
                }
            }

            self.tick(Utc::now()).await;
        };

        if let Err(e) = self
            .broker
            .release_lease(SCHEDULER_LEASE, &self.holder)
            .await
        {
            warn!("Failed to release scheduler lease: {}", e);
        }
        info!("Scheduler stopped");
        result
    }
}

fn cron_job(agent: &Agent, expression: &str) -> AgentJob {
    let initial_input = agent.initial_input.clone().unwrap_or_else(|| {
        format!("Scheduled run triggered by cron expression '{expression}'. Please execute your task.")
    });
    AgentJob::new(
        agent.id,
        TriggerType::Cron,
        initial_input,
        agent.default_trigger_data.clone(),
    )
}
