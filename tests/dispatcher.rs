//! Event fan-out through the dispatcher

use agent_dispatch::agents::{Agent, Subscription, SubscriptionResolver};
use agent_dispatch::broker::{
    Broker, DeadLetter, EnqueueOptions, FailOutcome, Job, JobHandle, RedbBroker, RetryPolicy,
};
use agent_dispatch::dispatcher::{DispatchReport, EventDispatcher};
use agent_dispatch::events::{
    enqueue_collection_event, CollectionEvent, EventType, EVENTS_QUEUE, TASK_TYPE_COLLECTION_EVENT,
};
use agent_dispatch::jobs::{AgentJob, TriggerType, AGENTS_QUEUE, TASK_TYPE_AGENT_RUN};
use agent_dispatch::workers::process_job;
use agent_dispatch::{Error, HandlerRegistry, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Broker that records enqueues and can refuse jobs for chosen agents
#[derive(Default)]
struct RecordingBroker {
    enqueued: Mutex<Vec<(String, String, Vec<u8>)>>,
    reject_agents: Vec<u64>,
}

impl RecordingBroker {
    fn rejecting(agent_ids: &[u64]) -> Self {
        Self {
            reject_agents: agent_ids.to_vec(),
            ..Self::default()
        }
    }

    fn jobs(&self) -> Vec<AgentJob> {
        self.enqueued
            .lock()
            .unwrap()
            .iter()
            .map(|(queue, task_type, payload)| {
                assert_eq!(queue, AGENTS_QUEUE);
                assert_eq!(task_type, TASK_TYPE_AGENT_RUN);
                AgentJob::decode(payload).unwrap()
            })
            .collect()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn enqueue(
        &self,
        queue: &str,
        task_type: &str,
        payload: &[u8],
        _options: &EnqueueOptions,
    ) -> Result<JobHandle> {
        let job = AgentJob::decode(payload)?;
        if self.reject_agents.contains(&job.agent_id) {
            return Err(Error::Storage("broker hiccup".to_string()));
        }
        let mut enqueued = self.enqueued.lock().unwrap();
        enqueued.push((queue.to_string(), task_type.to_string(), payload.to_vec()));
        Ok(JobHandle::from(format!("job-{}", enqueued.len())))
    }

    async fn dequeue(&self, _queue: &str, _wait: Duration) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn ack(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _job: &Job, _reason: &str, _retryable: bool) -> Result<FailOutcome> {
        Ok(FailOutcome::DeadLettered)
    }

    async fn dead_letters(&self, _queue: &str, _limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(Vec::new())
    }

    async fn acquire_lease(&self, _name: &str, _holder: &str, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn release_lease(&self, _name: &str, _holder: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory subscription table
struct StaticResolver {
    agents: Vec<Agent>,
    calls: AtomicUsize,
    unavailable: bool,
}

impl StaticResolver {
    fn new(agents: Vec<Agent>) -> Self {
        Self {
            agents,
            calls: AtomicUsize::new(0),
            unavailable: false,
        }
    }

    fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl SubscriptionResolver for StaticResolver {
    async fn find_agents_by_event_trigger(
        &self,
        collection_name: &str,
        event_type: EventType,
    ) -> Result<Vec<Agent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(Error::Resolver("agent store unavailable".to_string()));
        }
        Ok(self
            .agents
            .iter()
            .filter(|a| a.subscribes_to(collection_name, event_type))
            .cloned()
            .collect())
    }
}

fn subscriber(id: u64, collection_name: &str, event_type: EventType) -> Agent {
    Agent {
        id,
        name: format!("agent-{id}"),
        trigger_type: TriggerType::CollectionEvent,
        subscriptions: vec![Subscription {
            collection_name: collection_name.to_string(),
            event_type,
        }],
        cron_expression: None,
        initial_input: None,
        default_trigger_data: serde_json::Map::new(),
    }
}

const ARTICLE_CREATED: &[u8] = br#"{"event_type":"item_created","collection_name":"articles","item_id":42,"item_data":{"title":"Hello"}}"#;

fn dispatcher(broker: Arc<RecordingBroker>, resolver: Arc<StaticResolver>) -> EventDispatcher {
    EventDispatcher::new(broker, resolver)
}

#[tokio::test]
async fn test_event_fans_out_one_job_per_subscribed_agent() {
    let broker = Arc::new(RecordingBroker::default());
    let resolver = Arc::new(StaticResolver::new(vec![
        subscriber(1, "articles", EventType::ItemCreated),
        subscriber(2, "articles", EventType::ItemCreated),
        subscriber(3, "articles", EventType::ItemDeleted),
        subscriber(4, "pages", EventType::ItemCreated),
    ]));

    let report = dispatcher(broker.clone(), resolver)
        .dispatch(ARTICLE_CREATED)
        .await
        .unwrap();
    assert_eq!(
        report,
        DispatchReport {
            matched: 2,
            enqueued: 2,
            failed: 0
        }
    );

    let jobs = broker.jobs();
    assert_eq!(jobs.len(), 2);
    for (job, agent_id) in jobs.iter().zip([1, 2]) {
        assert_eq!(job.agent_id, agent_id);
        assert_eq!(job.trigger_type, TriggerType::CollectionEvent);
        assert_eq!(
            job.initial_input,
            "An event 'item_created' occurred for item 42 in collection 'articles'. Please process the provided data."
        );
        assert_eq!(serde_json::Value::Object(job.trigger_data.clone()), json!({"title": "Hello"}));
        assert!(job.created_at.is_some());
    }
}

#[tokio::test]
async fn test_event_without_subscribers_is_a_no_op() {
    let broker = Arc::new(RecordingBroker::default());
    let resolver = Arc::new(StaticResolver::new(vec![subscriber(
        1,
        "pages",
        EventType::ItemUpdated,
    )]));

    let report = dispatcher(broker.clone(), resolver.clone())
        .dispatch(ARTICLE_CREATED)
        .await
        .unwrap();

    assert_eq!(report, DispatchReport::default());
    assert!(broker.jobs().is_empty());
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_redelivered_event_is_dispatched_again() {
    let broker = Arc::new(RecordingBroker::default());
    let resolver = Arc::new(StaticResolver::new(vec![
        subscriber(1, "articles", EventType::ItemCreated),
        subscriber(2, "articles", EventType::ItemCreated),
    ]));
    let dispatcher = dispatcher(broker.clone(), resolver);

    dispatcher.dispatch(ARTICLE_CREATED).await.unwrap();
    dispatcher.dispatch(ARTICLE_CREATED).await.unwrap();

    // At-least-once: no deduplication across deliveries
    let agent_ids: Vec<u64> = broker.jobs().iter().map(|j| j.agent_id).collect();
    assert_eq!(agent_ids, vec![1, 2, 1, 2]);
}

#[tokio::test]
async fn test_malformed_event_is_decode_error_and_enqueues_nothing() {
    let broker = Arc::new(RecordingBroker::default());
    let resolver = Arc::new(StaticResolver::new(vec![subscriber(
        1,
        "articles",
        EventType::ItemCreated,
    )]));

    let err = dispatcher(broker.clone(), resolver.clone())
        .dispatch(b"{\"event_type\":\"item_created\"")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Decode(_)));
    assert!(!err.is_retryable());
    assert!(broker.jobs().is_empty());
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolver_failure_is_retryable() {
    let broker = Arc::new(RecordingBroker::default());

    let err = dispatcher(broker.clone(), Arc::new(StaticResolver::unavailable()))
        .dispatch(ARTICLE_CREATED)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Resolver(_)));
    assert!(err.is_retryable());
    assert!(broker.jobs().is_empty());
}

#[tokio::test]
async fn test_enqueue_failure_for_one_agent_does_not_block_the_others() {
    let broker = Arc::new(RecordingBroker::rejecting(&[2]));
    let resolver = Arc::new(StaticResolver::new(vec![
        subscriber(1, "articles", EventType::ItemCreated),
        subscriber(2, "articles", EventType::ItemCreated),
        subscriber(3, "articles", EventType::ItemCreated),
    ]));

    let report = dispatcher(broker.clone(), resolver)
        .dispatch(ARTICLE_CREATED)
        .await
        .unwrap();

    assert_eq!(
        report,
        DispatchReport {
            matched: 3,
            enqueued: 2,
            failed: 1
        }
    );
    let agent_ids: Vec<u64> = broker.jobs().iter().map(|j| j.agent_id).collect();
    assert_eq!(agent_ids, vec![1, 3]);
}

/// Through a real broker: events queue in, agents queue out
#[tokio::test]
async fn test_dispatcher_as_worker_handler() {
    let temp_dir = TempDir::new().unwrap();
    let broker = Arc::new(
        RedbBroker::open(temp_dir.path().join("test.redb"))
            .unwrap()
            .with_retry_policy(RetryPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            }),
    );
    let resolver = Arc::new(StaticResolver::new(vec![
        subscriber(1, "articles", EventType::ItemCreated),
        subscriber(2, "articles", EventType::ItemCreated),
    ]));

    let mut registry = HandlerRegistry::new();
    registry.register(
        TASK_TYPE_COLLECTION_EVENT,
        Arc::new(EventDispatcher::new(broker.clone(), resolver)),
    );

    let event = CollectionEvent::decode(ARTICLE_CREATED).unwrap();
    enqueue_collection_event(broker.as_ref(), &event, &EnqueueOptions::default())
        .await
        .unwrap();
    // Malformed events go straight to dead-letter
    broker
        .enqueue(
            EVENTS_QUEUE,
            TASK_TYPE_COLLECTION_EVENT,
            b"not json",
            &EnqueueOptions::default(),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let job = broker
            .dequeue(EVENTS_QUEUE, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        process_job(broker.as_ref(), &registry, job).await.unwrap();
    }

    assert_eq!(broker.pending_len(EVENTS_QUEUE).unwrap(), 0);
    assert_eq!(broker.pending_len(AGENTS_QUEUE).unwrap(), 2);

    let dead = broker.dead_letters(EVENTS_QUEUE, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].payload, b"not json");

    let mut agent_ids = Vec::new();
    while let Some(job) = broker.dequeue(AGENTS_QUEUE, Duration::ZERO).await.unwrap() {
        assert_eq!(job.task_type, TASK_TYPE_AGENT_RUN);
        agent_ids.push(AgentJob::decode(&job.payload).unwrap().agent_id);
        broker.ack(&job).await.unwrap();
    }
    agent_ids.sort_unstable();
    assert_eq!(agent_ids, vec![1, 2]);
}
