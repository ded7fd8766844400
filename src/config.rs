//! Environment-driven configuration
//!
//! Every setting is read from an `AGENT_DISPATCH_*` variable and has a default.

use crate::broker::{EnqueueOptions, RetryPolicy};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const PREFIX: &str = "AGENT_DISPATCH_";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub db_path: PathBuf,
    /// Remote broker server; when set, roles do not open the database
    pub broker_addr: Option<String>,
    pub bind_addr: String,
    pub session_key: Option<Vec<u8>>,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub job_timeout: Duration,
    pub events_concurrency: usize,
    pub agents_concurrency: usize,
    pub scheduler_reload: Duration,
    pub agents_file: PathBuf,
    pub runner_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: PathBuf::from("agent-dispatch.redb"),
            broker_addr: None,
            bind_addr: "127.0.0.1:6380".to_string(),
            session_key: None,
            max_attempts: 25,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(600),
            job_timeout: Duration::from_secs(300),
            events_concurrency: 5,
            agents_concurrency: 10,
            scheduler_reload: Duration::from_secs(60),
            agents_file: PathBuf::from("agents.json"),
            runner_command: None,
        }
    }
}

impl Config {
    /// Read configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first variable with an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a full variable name
    /// to its value
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first variable with an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            db_path: get("DB_PATH").map_or(defaults.db_path, PathBuf::from),
            broker_addr: get("BROKER_ADDR"),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            session_key: get("SESSION_KEY").map(String::into_bytes),
            max_attempts: parse(&get, "MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base: parse_secs(&get, "RETRY_BASE_SECS", defaults.retry_base)?,
            retry_max: parse_secs(&get, "RETRY_MAX_SECS", defaults.retry_max)?,
            job_timeout: parse_secs(&get, "JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            events_concurrency: parse(&get, "EVENTS_CONCURRENCY", defaults.events_concurrency)?,
            agents_concurrency: parse(&get, "AGENTS_CONCURRENCY", defaults.agents_concurrency)?,
            scheduler_reload: parse_secs(&get, "SCHEDULER_RELOAD_SECS", defaults.scheduler_reload)?,
            agents_file: get("AGENTS_FILE").map_or(defaults.agents_file, PathBuf::from),
            runner_command: get("RUNNER_COMMAND"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(format!("{PREFIX}MAX_ATTEMPTS must be at least 1")));
        }
        if self.events_concurrency == 0 || self.agents_concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.job_timeout.is_zero() {
            return Err(Error::Config(format!("{PREFIX}JOB_TIMEOUT_SECS must be positive")));
        }
        if self.retry_base > self.retry_max {
            return Err(Error::Config(format!(
                "{PREFIX}RETRY_BASE_SECS exceeds {PREFIX}RETRY_MAX_SECS"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base,
            max_delay: self.retry_max,
        }
    }

    /// Enqueue options for jobs produced by this process
    #[must_use]
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            max_attempts: self.max_attempts,
            timeout: self.job_timeout,
            delay: Duration::ZERO,
        }
    }
}

fn parse<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{PREFIX}{name}: invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn parse_secs<G>(get: &G, name: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, name, default.as_secs()).map(Duration::from_secs)
}
