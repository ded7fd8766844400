//! Agent jobs and the `agents` queue
//!
//! An agent job is self-contained: everything the runner needs is embedded
//! in `initial_input` and `trigger_data` when the job is created, so later
//! edits to the agent never race with jobs already in flight.

use crate::broker::{Broker, EnqueueOptions, JobHandle};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info};

/// Queue carrying agent jobs
pub const AGENTS_QUEUE: &str = "agents";

/// Task type of an agent job
pub const TASK_TYPE_AGENT_RUN: &str = "agent:run";

/// What caused an agent job to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    CollectionEvent,
    Cron,
    Webhook,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerType::CollectionEvent => "collection_event",
            TriggerType::Cron => "cron",
            TriggerType::Webhook => "webhook",
        })
    }
}

/// Work item for one agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJob {
    pub agent_id: u64,
    pub trigger_type: TriggerType,
    /// Human-readable summary of why the agent was triggered
    pub initial_input: String,
    #[serde(default)]
    pub trigger_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl AgentJob {
    #[must_use]
    pub fn new(
        agent_id: u64,
        trigger_type: TriggerType,
        initial_input: impl Into<String>,
        trigger_data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            agent_id,
            trigger_type,
            initial_input: initial_input.into(),
            trigger_data,
            created_at: Some(Utc::now()),
        }
    }

    /// # Errors
    ///
    /// Returns `Error::Decode` if the bytes are not a valid agent job.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Decode(format!("invalid agent job: {e}")))
    }

    /// # Errors
    ///
    /// Returns `Error::Decode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Decode(format!("unencodable agent job: {e}")))
    }
}

/// Enqueue an agent job onto the `agents` queue
///
/// Single entry point for every trigger (event fan-out, cron, webhook).
///
/// # Errors
///
/// Returns `Error::Enqueue` if the broker rejects the job.
pub async fn enqueue_agent_job(
    broker: &dyn Broker,
    job: &AgentJob,
    options: &EnqueueOptions,
) -> Result<JobHandle> {
    let payload = job.encode()?;

    let id = broker
        .enqueue(AGENTS_QUEUE, TASK_TYPE_AGENT_RUN, &payload, options)
        .await
        .map_err(|e| {
            error!(agent_id = job.agent_id, "Failed to enqueue agent job: {}", e);
            Error::Enqueue(e.to_string())
        })?;

    info!(
        job_id = %id,
        agent_id = job.agent_id,
        trigger = %job.trigger_type,
        "Enqueued agent job"
    );
    Ok(id)
}

/// Build the job for an agent triggered by a webhook call
///
/// The request body becomes the trigger data and is embedded, pretty-printed,
/// in the prompt.
///
/// # Errors
///
/// Returns `Error::Decode` if the body cannot be serialized.
pub fn webhook_job(
    agent_id: u64,
    body: serde_json::Map<String, serde_json::Value>,
) -> Result<AgentJob> {
    let pretty = serde_json::to_string_pretty(&body)
        .map_err(|e| Error::Decode(format!("unencodable webhook body: {e}")))?;
    let initial_input = format!(
        "A webhook was triggered with the following data. Please process it according to your instructions.\n\nData:\n{pretty}"
    );
    Ok(AgentJob::new(agent_id, TriggerType::Webhook, initial_input, body))
}

/// Enqueue a webhook-triggered run of `agent_id`
///
/// # Errors
///
/// Returns `Error::Enqueue` if the broker rejects the job.
pub async fn enqueue_webhook_job(
    broker: &dyn Broker,
    agent_id: u64,
    body: serde_json::Map<String, serde_json::Value>,
    options: &EnqueueOptions,
) -> Result<JobHandle> {
    let job = webhook_job(agent_id, body)?;
    enqueue_agent_job(broker, &job, options).await
}
