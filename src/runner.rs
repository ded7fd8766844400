//! Agent runners: the collaborators that actually execute an agent job
//!
//! The worker pool hands each `agent:run` job to [`AgentJobHandler`], which
//! decodes it and forwards it to an [`AgentRunner`].

use crate::broker::{Job, JobHandle};
use crate::error::{Error, Result};
use crate::jobs::AgentJob;
use crate::workers::Handler;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Most stderr bytes kept in a runner failure message
const MAX_STDERR_EXCERPT: usize = 512;

/// Delivery details passed to a runner alongside the job
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job_id: JobHandle,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Time the runner has before the job is failed
    pub timeout: Duration,
}

impl RunContext {
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            timeout: job.timeout,
        }
    }
}

/// Executes agent jobs
///
/// Jobs are delivered at least once; a runner may see the same job again
/// after a crash or timeout, possibly after partially executing it.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// # Errors
    ///
    /// Any error fails the delivery; it is retried unless non-retryable.
    async fn handle_agent_job(&self, ctx: &RunContext, job: AgentJob) -> Result<()>;
}

/// Worker handler for `agent:run` jobs
pub struct AgentJobHandler {
    runner: Arc<dyn AgentRunner>,
}

impl AgentJobHandler {
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Handler for AgentJobHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let agent_job = AgentJob::decode(&job.payload)?;
        let ctx = RunContext::from_job(job);

        info!(
            job_id = %job.id,
            agent_id = agent_job.agent_id,
            attempt = job.attempt,
            "Starting agent job execution"
        );
        let agent_id = agent_job.agent_id;
        self.runner.handle_agent_job(&ctx, agent_job).await?;
        info!(job_id = %job.id, agent_id, "Agent job completed successfully");
        Ok(())
    }
}

/// Runs an external program per job
///
/// The job is written to the program's stdin as JSON, and delivery details are
/// exported as `AGENT_DISPATCH_JOB_ID`, `AGENT_DISPATCH_AGENT_ID` and
/// `AGENT_DISPATCH_ATTEMPT`. A non-zero exit fails the job. The child is
/// killed if the job times out.
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a runner from a whitespace-separated command line
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the command line is empty.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("runner command is empty".to_string()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn handle_agent_job(&self, ctx: &RunContext, job: AgentJob) -> Result<()> {
        let input = job.encode()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("AGENT_DISPATCH_JOB_ID", ctx.job_id.as_str())
            .env("AGENT_DISPATCH_AGENT_ID", job.agent_id.to_string())
            .env("AGENT_DISPATCH_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Runner(format!("cannot start '{}': {e}", self.program)))?;

        // Feed stdin while stderr drains; the pipe closes when `stdin` drops
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                // The program is free to exit without reading its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| Error::Runner(format!("runner did not finish: {e}")))?;

        if output.status.success() {
            fed.map_err(|e| Error::Runner(format!("cannot write job to runner: {e}")))?;
            debug!(job_id = %ctx.job_id, agent_id = job.agent_id, "Runner exited cleanly");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(MAX_STDERR_EXCERPT).collect();
            Err(Error::Runner(format!(
                "'{}' exited with {}: {}",
                self.program, output.status, excerpt
            )))
        }
    }
}

/// Logs each job and reports success
pub struct LogRunner;

#[async_trait]
impl AgentRunner for LogRunner {
    async fn handle_agent_job(&self, ctx: &RunContext, job: AgentJob) -> Result<()> {
        info!(
            job_id = %ctx.job_id,
            agent_id = job.agent_id,
            trigger = %job.trigger_type,
            "Agent run: {}",
            job.initial_input
        );
        Ok(())
    }
}
