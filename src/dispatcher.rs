//! Event dispatcher: fans a content-change event out into one job per
//! subscribed agent
//!
//! Redelivering the same event enqueues the jobs again. There is no
//! deduplication across deliveries; agent runs must tolerate repeats.

use crate::agents::SubscriptionResolver;
use crate::broker::{Broker, EnqueueOptions, Job};
use crate::error::{Error, Result};
use crate::events::CollectionEvent;
use crate::jobs::{enqueue_agent_job, AgentJob, TriggerType};
use crate::workers::Handler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one dispatch did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Agents subscribed to the event
    pub matched: usize,
    /// Jobs enqueued for them
    pub enqueued: usize,
    /// Agents whose job could not be enqueued
    pub failed: usize,
}

pub struct EventDispatcher {
    broker: Arc<dyn Broker>,
    resolver: Arc<dyn SubscriptionResolver>,
    job_options: EnqueueOptions,
}

impl EventDispatcher {
    pub fn new(broker: Arc<dyn Broker>, resolver: Arc<dyn SubscriptionResolver>) -> Self {
        Self {
            broker,
            resolver,
            job_options: EnqueueOptions::default(),
        }
    }

    /// Options applied to every agent job this dispatcher enqueues
    #[must_use]
    pub fn with_job_options(mut self, options: EnqueueOptions) -> Self {
        self.job_options = options;
        self
    }

    /// Decode one delivered event and enqueue a job per subscribed agent
    ///
    /// A failed enqueue for one agent is logged and counted, and the
    /// remaining agents are still processed.
    ///
    /// # Errors
    ///
    /// - `Error::Decode` if `raw` is not a valid event (not retryable)
    /// - `Error::Resolver` if the subscription lookup fails (retryable)
    pub async fn dispatch(&self, raw: &[u8]) -> Result<DispatchReport> {
        let event = CollectionEvent::decode(raw)?;

        let agents = self
            .resolver
            .find_agents_by_event_trigger(&event.collection_name, event.event_type)
            .await
            .map_err(|e| match e {
                Error::Resolver(_) => e,
                other => Error::Resolver(other.to_string()),
            })?;

        let mut report = DispatchReport {
            matched: agents.len(),
            ..DispatchReport::default()
        };
        if agents.is_empty() {
            debug!(
                event_type = %event.event_type,
                collection = %event.collection_name,
                "No agents subscribed to event"
            );
            return Ok(report);
        }

        let initial_input = describe_event(&event);
        for agent in &agents {
            let job = AgentJob::new(
                agent.id,
                TriggerType::CollectionEvent,
                initial_input.clone(),
                event.item_data.clone(),
            );
            match enqueue_agent_job(self.broker.as_ref(), &job, &self.job_options).await {
                Ok(_) => report.enqueued += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        agent_id = agent.id,
                        event_type = %event.event_type,
                        collection = %event.collection_name,
                        "Skipping agent, job not enqueued: {}",
                        e
                    );
                }
            }
        }

        if report.failed > 0 {
            warn!(
                "Dispatched event {} on '{}' item {} to {}/{} agent(s)",
                event.event_type, event.collection_name, event.item_id, report.enqueued, report.matched
            );
        } else {
            info!(
                "Dispatched event {} on '{}' item {} to {} agent(s)",
                event.event_type, event.collection_name, event.item_id, report.enqueued
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl Handler for EventDispatcher {
    async fn handle(&self, job: &Job) -> Result<()> {
        self.dispatch(&job.payload).await.map(|_| ())
    }
}

/// Prompt given to agents triggered by a content event
#[must_use]
pub fn describe_event(event: &CollectionEvent) -> String {
    format!(
        "An event '{}' occurred for item {} in collection '{}'. Please process the provided data.",
        event.event_type, event.item_id, event.collection_name
    )
}
