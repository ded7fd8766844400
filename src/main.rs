//! agent-dispatch - runs the broker, dispatcher, worker and scheduler roles
//!
//! Roles share work only through the broker. Run `broker` once and point the
//! other roles at it with `AGENT_DISPATCH_BROKER_ADDR`, or run `all` to host
//! every role in a single process over the local database.

use agent_dispatch::agents::FileAgentDirectory;
use agent_dispatch::events::{
    enqueue_collection_event, CollectionEvent, EVENTS_QUEUE, TASK_TYPE_COLLECTION_EVENT,
};
use agent_dispatch::jobs::{enqueue_webhook_job, AGENTS_QUEUE, TASK_TYPE_AGENT_RUN};
use agent_dispatch::runner::{AgentJobHandler, AgentRunner, CommandRunner, LogRunner};
use agent_dispatch::{
    Broker, Config, Error, EventDispatcher, HandlerRegistry, RedbBroker, RespBroker, Result,
    Scheduler, Server, WorkerPool,
};
use clap::{Parser, Subcommand};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "agent-dispatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the local broker database to other processes.
    Broker,
    /// Fan content events out into agent jobs.
    Dispatcher,
    /// Execute agent jobs.
    Worker,
    /// Enqueue agent jobs on their cron schedules. Only one may run at a time.
    Scheduler,
    /// Run every role in this process over the local database.
    All,
    /// Publish a content event, given as JSON.
    EnqueueEvent { json: String },
    /// Trigger an agent with a webhook body, given as a JSON object.
    EnqueueWebhook { agent_id: u64, json: String },
    /// List dead-lettered jobs of a queue.
    DeadLetters {
        queue: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(e) = run(cli.command, config).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Broker => {
            let broker = Arc::new(open_local(&config)?);
            let shutdown = shutdown_on_ctrl_c();
            serve(&config, broker, shutdown).await
        }
        Command::Dispatcher => {
            let broker = open_broker(&config)?;
            dispatcher_pool(&config, broker).run(shutdown_on_ctrl_c()).await
        }
        Command::Worker => {
            let broker = open_broker(&config)?;
            worker_pool(&config, broker)?.run(shutdown_on_ctrl_c()).await
        }
        Command::Scheduler => {
            let broker = open_broker(&config)?;
            scheduler(&config, broker).run(shutdown_on_ctrl_c()).await
        }
        Command::All => run_all(&config).await,
        Command::EnqueueEvent { json } => {
            let event = CollectionEvent::decode(json.as_bytes())?;
            let broker = open_broker(&config)?;
            let id =
                enqueue_collection_event(broker.as_ref(), &event, &config.enqueue_options()).await?;
            println!("{id}");
            Ok(())
        }
        Command::EnqueueWebhook { agent_id, json } => {
            let body = match serde_json::from_str(&json) {
                Ok(serde_json::Value::Object(body)) => body,
                Ok(_) => return Err(Error::Decode("webhook body must be a JSON object".to_string())),
                Err(e) => return Err(Error::Decode(format!("invalid webhook body: {e}"))),
            };
            let directory = FileAgentDirectory::new(&config.agents_file);
            if directory.agent(agent_id).await?.is_none() {
                return Err(Error::InvalidArguments(format!("agent {agent_id} not found")));
            }
            let broker = open_broker(&config)?;
            let id =
                enqueue_webhook_job(broker.as_ref(), agent_id, body, &config.enqueue_options())
                    .await?;
            println!("{id}");
            Ok(())
        }
        Command::DeadLetters { queue, limit } => {
            let broker = open_broker(&config)?;
            for letter in broker.dead_letters(&queue, limit).await? {
                println!(
                    "{}\t{}\t{}\tattempts={}\t{}\t{}",
                    letter.failed_at.to_rfc3339(),
                    letter.id,
                    letter.task_type,
                    letter.attempts,
                    letter.last_error,
                    String::from_utf8_lossy(&letter.payload)
                );
            }
            Ok(())
        }
    }
}

async fn run_all(config: &Config) -> Result<()> {
    let local = Arc::new(open_local(config)?);
    let broker: Arc<dyn Broker> = local.clone();
    let shutdown = shutdown_on_ctrl_c();

    info!("Starting agent-dispatch v{} with all roles", env!("CARGO_PKG_VERSION"));

    let server = serve(config, local, shutdown.clone());
    let dispatchers = dispatcher_pool(config, Arc::clone(&broker)).run(shutdown.clone());
    let workers = worker_pool(config, Arc::clone(&broker))?.run(shutdown.clone());
    let scheduling = scheduler(config, broker).run(shutdown.clone());

    // Any role failing brings the others down
    let stop_all = shutdown.clone();
    let guarded = |role: &'static str, result: Result<()>| {
        if let Err(e) = &result {
            error!("{} stopped: {}", role, e);
            stop_all.cancel();
        }
        result
    };
    let (a, b, c, d) = tokio::join!(
        async { guarded("broker server", server.await) },
        async { guarded("dispatcher", dispatchers.await) },
        async { guarded("worker", workers.await) },
        async { guarded("scheduler", scheduling.await) },
    );
    a.and(b).and(c).and(d)
}

fn open_local(config: &Config) -> Result<RedbBroker> {
    Ok(RedbBroker::open(&config.db_path)?.with_retry_policy(config.retry_policy()))
}

fn open_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    match &config.broker_addr {
        Some(addr) => {
            let key = config.session_key.clone().ok_or_else(|| {
                Error::Config(
                    "AGENT_DISPATCH_SESSION_KEY is required with AGENT_DISPATCH_BROKER_ADDR"
                        .to_string(),
                )
            })?;
            Ok(Arc::new(RespBroker::new(addr.clone(), key)))
        }
        None => Ok(Arc::new(open_local(config)?)),
    }
}

async fn serve(config: &Config, broker: Arc<RedbBroker>, shutdown: CancellationToken) -> Result<()> {
    let session_key = match &config.session_key {
        Some(key) => key.clone(),
        None => {
            warn!("AGENT_DISPATCH_SESSION_KEY not set, generated a random key; remote roles cannot connect");
            generate_session_key()?
        }
    };
    let server = Server::new(&config.bind_addr, broker, session_key).await?;
    server.run(shutdown).await
}

fn dispatcher_pool(config: &Config, broker: Arc<dyn Broker>) -> WorkerPool {
    let dispatcher = EventDispatcher::new(
        Arc::clone(&broker),
        Arc::new(FileAgentDirectory::new(&config.agents_file)),
    )
    .with_job_options(config.enqueue_options());

    let mut registry = HandlerRegistry::new();
    registry.register(TASK_TYPE_COLLECTION_EVENT, Arc::new(dispatcher));
    WorkerPool::new(broker, registry).queue(EVENTS_QUEUE, config.events_concurrency)
}

fn worker_pool(config: &Config, broker: Arc<dyn Broker>) -> Result<WorkerPool> {
    let runner: Arc<dyn AgentRunner> = match &config.runner_command {
        Some(line) => Arc::new(CommandRunner::from_command_line(line)?),
        None => {
            info!("No runner command configured, agent jobs will only be logged");
            Arc::new(LogRunner)
        }
    };

    let mut registry = HandlerRegistry::new();
    registry.register(TASK_TYPE_AGENT_RUN, Arc::new(AgentJobHandler::new(runner)));
    Ok(WorkerPool::new(broker, registry).queue(AGENTS_QUEUE, config.agents_concurrency))
}

fn scheduler(config: &Config, broker: Arc<dyn Broker>) -> Scheduler {
    Scheduler::new(broker, Arc::new(FileAgentDirectory::new(&config.agents_file)))
        .with_job_options(config.enqueue_options())
        .with_reload_interval(config.scheduler_reload)
}

/// Cancel the returned token on ctrl-c
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        trigger.cancel();
    });
    token
}

/// Generate a cryptographically secure session key
///
/// # Errors
///
/// Returns an error if the secure random number generation fails.
fn generate_session_key() -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut key = [0u8; 32];
    rng.fill(&mut key)
        .map_err(|_| Error::Config("Failed to generate session key".to_string()))?;
    Ok(key.iter().map(|b| format!("{b:02x}")).collect::<String>().into_bytes())
}
