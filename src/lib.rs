//! agent-dispatch - event fan-out, cron scheduling and job execution for agents
//!
//! Content changes become events on the `events` queue; the dispatcher fans
//! each event out into one `agent:run` job per subscribed agent on the
//! `agents` queue; the scheduler adds cron-triggered jobs to the same queue;
//! worker pools drain both queues through a durable at-least-once broker.

pub mod agents;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod jobs;
pub mod resp;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod workers;

pub use broker::{Broker, RedbBroker, RespBroker};
pub use config::Config;
pub use dispatcher::EventDispatcher;
pub use error::{Error, Result};
pub use scheduler::Scheduler;
pub use server::Server;
pub use workers::{HandlerRegistry, WorkerPool};
