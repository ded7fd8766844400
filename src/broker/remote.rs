//! Broker client for a remote broker server
//!
//! Lets dispatcher, scheduler and worker processes share one durable broker
//! over TCP. Commands and replies are RESP; see `server.rs` for the command set.

use super::{Broker, DeadLetter, EnqueueOptions, FailOutcome, Job, JobHandle};
use crate::error::{Error, Result};
use crate::resp::{RespParser, RespValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Idle connections kept for reuse
const MAX_IDLE_CONNECTIONS: usize = 16;

/// Broker reached over the RESP protocol
pub struct RespBroker {
    addr: String,
    session_key: Vec<u8>,
    idle: Mutex<Vec<Connection>>,
}

struct Connection {
    stream: TcpStream,
    parser: RespParser,
    buffer: Vec<u8>,
}

impl Connection {
    async fn open(addr: &str, session_key: &[u8]) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut conn = Self {
            stream,
            parser: RespParser::new(),
            buffer: vec![0u8; 8192],
        };

        let reply = conn
            .request(&RespValue::command([b"AUTH".as_slice(), session_key]))
            .await?;
        match reply {
            RespValue::SimpleString(ok) if ok == "OK" => {
                debug!("Authenticated with broker at {}", addr);
                Ok(conn)
            }
            RespValue::Error(msg) => Err(remote_error(msg)),
            other => Err(Error::Protocol(format!("Unexpected AUTH reply: {other:?}"))),
        }
    }

    async fn request(&mut self, command: &RespValue) -> Result<RespValue> {
        self.send(command).await?;
        self.receive().await
    }

    async fn send(&mut self, command: &RespValue) -> Result<()> {
        self.stream.write_all(&command.encode()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<RespValue> {
        loop {
            if let Some(reply) = self.parser.parse()? {
                return Ok(reply);
            }
            let n = self.stream.read(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.parser.feed(&self.buffer[..n])?;
        }
    }

    /// Whether an idle connection is still usable: open, with nothing unread
    fn is_idle_and_open(&self) -> bool {
        let mut unread = [0u8; 1];
        match self.stream.try_read(&mut unread) {
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            Ok(_) => false,
        }
    }
}

impl RespBroker {
    /// Create a client for the broker server at `addr`
    ///
    /// Connections are opened lazily and authenticated with `session_key`.
    pub fn new(addr: impl Into<String>, session_key: Vec<u8>) -> Self {
        let addr = addr.into();
        info!("Using remote broker at {}", addr);
        Self {
            addr,
            session_key,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Pop an idle connection, dropping any the server has closed
    fn take_idle(&self) -> Option<Connection> {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(conn) = idle.pop() {
            if conn.is_idle_and_open() {
                return Some(conn);
            }
            debug!("Dropping closed idle broker connection");
        }
        None
    }

    fn put_idle(&self, conn: Connection) {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    /// Send one command and return its reply, mapping error replies to `Error`
    ///
    /// A command is resent on a fresh connection only when writing it to a
    /// reused connection failed. Once it is written the server may have
    /// executed it, so a lost reply is returned as an error: resending
    /// `JOB.DEQUEUE` would claim a second job and strand the first until its
    /// lease expires.
    async fn call(&self, command: RespValue) -> Result<RespValue> {
        let (mut conn, reused) = match self.take_idle() {
            Some(conn) => (conn, true),
            None => (Connection::open(&self.addr, &self.session_key).await?, false),
        };

        match conn.send(&command).await {
            Ok(()) => {}
            Err(Error::Io(e)) if reused => {
                debug!("Idle broker connection went stale, reconnecting: {}", e);
                conn = Connection::open(&self.addr, &self.session_key).await?;
                conn.send(&command).await?;
            }
            Err(e) => return Err(e),
        }
        let reply = conn.receive().await?;
        self.put_idle(conn);

        match reply {
            RespValue::Error(msg) => Err(remote_error(msg)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Broker for RespBroker {
    async fn enqueue(
        &self,
        queue: &str,
        task_type: &str,
        payload: &[u8],
        options: &EnqueueOptions,
    ) -> Result<JobHandle> {
        let command = RespValue::Array(vec![
            RespValue::BulkString(b"JOB.ENQUEUE".to_vec()),
            RespValue::BulkString(queue.as_bytes().to_vec()),
            RespValue::BulkString(task_type.as_bytes().to_vec()),
            RespValue::BulkString(payload.to_vec()),
            RespValue::bulk_u64(u64::from(options.max_attempts)),
            RespValue::bulk_u64(millis(options.timeout)),
            RespValue::bulk_u64(millis(options.delay)),
        ]);
        let reply = self.call(command).await?;
        Ok(JobHandle::from(reply.as_string()?))
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<Job>> {
        let command = RespValue::Array(vec![
            RespValue::BulkString(b"JOB.DEQUEUE".to_vec()),
            RespValue::BulkString(queue.as_bytes().to_vec()),
            RespValue::bulk_u64(millis(wait)),
        ]);
        match self.call(command).await? {
            RespValue::NullBulkString => Ok(None),
            reply => job_from_resp(reply).map(Some),
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let command = RespValue::Array(vec![
            RespValue::BulkString(b"JOB.ACK".to_vec()),
            RespValue::BulkString(job.id.as_str().as_bytes().to_vec()),
            RespValue::bulk_u64(u64::from(job.attempt)),
        ]);
        self.call(command).await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str, retryable: bool) -> Result<FailOutcome> {
        let command = RespValue::Array(vec![
            RespValue::BulkString(b"JOB.FAIL".to_vec()),
            RespValue::BulkString(job.id.as_str().as_bytes().to_vec()),
            RespValue::bulk_u64(u64::from(job.attempt)),
            RespValue::bulk_u64(u64::from(retryable)),
            RespValue::BulkString(reason.as_bytes().to_vec()),
        ]);
        outcome_from_resp(self.call(command).await?)
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let command = RespValue::Array(vec![
            RespValue::BulkString(b"JOB.DEAD".to_vec()),
            RespValue::BulkString(queue.as_bytes().to_vec()),
            RespValue::bulk_u64(limit as u64),
        ]);
        match self.call(command).await? {
            RespValue::Array(items) => items.into_iter().map(dead_letter_from_resp).collect(),
            other => Err(Error::Protocol(format!("Unexpected JOB.DEAD reply: {other:?}"))),
        }
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let command = RespValue::Array(vec![
            RespValue::BulkString(b"LEASE.ACQUIRE".to_vec()),
            RespValue::BulkString(name.as_bytes().to_vec()),
            RespValue::BulkString(holder.as_bytes().to_vec()),
            RespValue::bulk_u64(millis(ttl)),
        ]);
        Ok(self.call(command).await?.as_u64()? == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        self.call(RespValue::command(["LEASE.RELEASE", name, holder]))
            .await?;
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn remote_error(msg: String) -> Error {
    if let Some(id) = msg.strip_prefix("NOTFOUND job ") {
        Error::JobNotFound(id.to_string())
    } else if msg.starts_with("ERR NOAUTH") {
        Error::NoAuth
    } else {
        Error::Remote(msg)
    }
}

fn take_fields<const N: usize>(value: RespValue, what: &str) -> Result<[RespValue; N]> {
    match value {
        RespValue::Array(items) => items
            .try_into()
            .map_err(|_| Error::Protocol(format!("Malformed {what} reply"))),
        other => Err(Error::Protocol(format!("Unexpected {what} reply: {other:?}"))),
    }
}

fn as_u32(value: &RespValue) -> Result<u32> {
    u32::try_from(value.as_u64()?).map_err(|_| Error::Protocol("Integer out of range".to_string()))
}

/// Encode a claimed job as a `JOB.DEQUEUE` reply
pub(crate) fn job_to_resp(job: Job) -> RespValue {
    RespValue::Array(vec![
        RespValue::BulkString(job.id.as_str().as_bytes().to_vec()),
        RespValue::BulkString(job.queue.into_bytes()),
        RespValue::BulkString(job.task_type.into_bytes()),
        RespValue::BulkString(job.payload),
        RespValue::bulk_u64(u64::from(job.attempt)),
        RespValue::bulk_u64(u64::from(job.max_attempts)),
        RespValue::bulk_u64(millis(job.timeout)),
    ])
}

fn job_from_resp(value: RespValue) -> Result<Job> {
    let [id, queue, task_type, payload, attempt, max_attempts, timeout] =
        take_fields::<7>(value, "JOB.DEQUEUE")?;
    Ok(Job {
        id: JobHandle::from(id.as_string()?),
        queue: queue.as_string()?,
        task_type: task_type.as_string()?,
        attempt: as_u32(&attempt)?,
        max_attempts: as_u32(&max_attempts)?,
        timeout: Duration::from_millis(timeout.as_u64()?),
        payload: payload.into_bytes()?,
    })
}

/// Encode a failure outcome as a `JOB.FAIL` reply
pub(crate) fn outcome_to_resp(outcome: &FailOutcome) -> RespValue {
    match outcome {
        FailOutcome::Retry { attempt, retry_in } => RespValue::Array(vec![
            RespValue::BulkString(b"RETRY".to_vec()),
            RespValue::bulk_u64(u64::from(*attempt)),
            RespValue::bulk_u64(millis(*retry_in)),
        ]),
        FailOutcome::DeadLettered => {
            RespValue::Array(vec![RespValue::BulkString(b"DEAD".to_vec())])
        }
    }
}

fn outcome_from_resp(value: RespValue) -> Result<FailOutcome> {
    let RespValue::Array(items) = value else {
        return Err(Error::Protocol("Unexpected JOB.FAIL reply".to_string()));
    };
    let kind = items.first().map(RespValue::as_string).transpose()?;
    match (kind.as_deref(), items.as_slice()) {
        (Some("DEAD"), [_]) => Ok(FailOutcome::DeadLettered),
        (Some("RETRY"), [_, attempt, retry_in]) => Ok(FailOutcome::Retry {
            attempt: as_u32(attempt)?,
            retry_in: Duration::from_millis(retry_in.as_u64()?),
        }),
        _ => Err(Error::Protocol("Malformed JOB.FAIL reply".to_string())),
    }
}

/// Encode a dead-lettered job as one element of a `JOB.DEAD` reply
pub(crate) fn dead_letter_to_resp(letter: DeadLetter) -> RespValue {
    RespValue::Array(vec![
        RespValue::BulkString(letter.id.as_str().as_bytes().to_vec()),
        RespValue::BulkString(letter.queue.into_bytes()),
        RespValue::BulkString(letter.task_type.into_bytes()),
        RespValue::BulkString(letter.payload),
        RespValue::bulk_u64(u64::from(letter.attempts)),
        RespValue::BulkString(letter.last_error.into_bytes()),
        RespValue::bulk_u64(u64::try_from(letter.failed_at.timestamp_millis()).unwrap_or(0)),
    ])
}

fn dead_letter_from_resp(value: RespValue) -> Result<DeadLetter> {
    let [id, queue, task_type, payload, attempts, last_error, failed_at] =
        take_fields::<7>(value, "JOB.DEAD")?;
    let failed_at_ms = i64::try_from(failed_at.as_u64()?)
        .map_err(|_| Error::Protocol("Timestamp out of range".to_string()))?;
    Ok(DeadLetter {
        id: JobHandle::from(id.as_string()?),
        queue: queue.as_string()?,
        task_type: task_type.as_string()?,
        attempts: as_u32(&attempts)?,
        last_error: last_error.as_string()?,
        failed_at: DateTime::<Utc>::from_timestamp_millis(failed_at_ms)
            .ok_or_else(|| Error::Protocol("Timestamp out of range".to_string()))?,
        payload: payload.into_bytes()?,
    })
}
