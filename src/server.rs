//! Broker server: exposes a local broker to other processes over RESP
//!
//! Every command except AUTH requires an authenticated connection.
//!
//! ```text
//! JOB.ENQUEUE queue task_type payload max_attempts timeout_ms delay_ms -> $id
//! JOB.DEQUEUE queue wait_ms         -> $-1 | *7 id queue task_type payload attempt max_attempts timeout_ms
//! JOB.ACK id attempt                -> +OK
//! JOB.FAIL id attempt retryable reason -> *3 RETRY attempt retry_in_ms | *1 DEAD
//! JOB.DEAD queue limit              -> *N of *7 id queue task_type payload attempts last_error failed_at_ms
//! LEASE.ACQUIRE name holder ttl_ms  -> :1 | :0
//! LEASE.RELEASE name holder         -> +OK
//! ```

use crate::broker::remote::{dead_letter_to_resp, job_to_resp, outcome_to_resp};
use crate::broker::{Broker, EnqueueOptions, Job, JobHandle};
use crate::error::{Error, Result};
use crate::resp::{RespParser, RespValue};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1000;

/// Idle read timeout for client connections
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest a single JOB.DEQUEUE may block
const MAX_DEQUEUE_WAIT: Duration = Duration::from_secs(30);

/// Most dead letters returned by one JOB.DEAD
const MAX_DEAD_LIMIT: usize = 1000;

/// Broker server
pub struct Server {
    listener: TcpListener,
    broker: Arc<dyn Broker>,
    session_key: Arc<Vec<u8>>,
    connections: Arc<Semaphore>,
}

impl Server {
    /// Create a new server bound to the given address
    ///
    /// # Arguments
    /// * `addr` - Address to bind to (e.g., "127.0.0.1:6380")
    /// * `broker` - Broker the commands are served from
    /// * `session_key` - Authentication key for clients
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(addr: &str, broker: Arc<dyn Broker>, session_key: Vec<u8>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Broker server listening on {}", addr);

        Ok(Self {
            listener,
            broker,
            session_key: Arc::new(session_key),
            connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Broker server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    // Security: Limit concurrent connections
                    let Ok(permit) = Arc::clone(&self.connections).try_acquire_owned() else {
                        warn!(
                            "Connection limit reached, rejecting connection from {}",
                            addr
                        );
                        drop(stream);
                        continue;
                    };

                    debug!(
                        "Accepted connection from {}, total: {}",
                        addr,
                        MAX_CONNECTIONS - self.connections.available_permits()
                    );

                    let broker = Arc::clone(&self.broker);
                    let session_key = Arc::clone(&self.session_key);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, broker, session_key).await {
                            debug!("Connection error from {}: {}", addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Get the local address the server is bound to
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be retrieved.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }
}

/// Handle a single client connection
async fn handle_connection(
    mut stream: TcpStream,
    broker: Arc<dyn Broker>,
    session_key: Arc<Vec<u8>>,
) -> Result<()> {
    let mut parser = RespParser::new();
    let mut authenticated = false;
    let mut buffer = vec![0u8; 8192];

    loop {
        // Security: Timeout idle reads to prevent slowloris attacks
        let n = match timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                debug!("Client disconnected");
                return Ok(());
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::from(e)),
            Err(_) => {
                debug!("Idle connection timed out");
                return Err(Error::Timeout);
            }
        };

        if let Err(e) = parser.feed(&buffer[..n]) {
            stream.write_all(e.to_resp_error().as_bytes()).await?;
            return Err(e);
        }

        loop {
            let value = match parser.parse() {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(e) => {
                    // The stream cannot be resynchronised after malformed input
                    stream.write_all(e.to_resp_error().as_bytes()).await?;
                    return Err(e);
                }
            };

            match handle_command(value, &mut authenticated, &session_key, broker.as_ref()).await {
                Ok(response) => stream.write_all(&response.encode()).await?,
                Err(e) => {
                    if matches!(e, Error::Storage(_)) {
                        error!("Broker command failed: {}", e);
                    }
                    stream.write_all(e.to_resp_error().as_bytes()).await?;
                }
            }
        }
    }
}

/// Handle a single RESP command
///
/// # Security
/// - Validates authentication state before executing commands
/// - Uses constant-time comparison for session keys
async fn handle_command(
    value: RespValue,
    authenticated: &mut bool,
    session_key: &[u8],
    broker: &dyn Broker,
) -> Result<RespValue> {
    let args = match value {
        RespValue::Array(args) if !args.is_empty() => args,
        _ => {
            return Err(Error::Protocol(
                "Expected array with at least one element".to_string(),
            ))
        }
    };

    let command = args[0].as_string()?.to_uppercase();
    if command == "AUTH" {
        return handle_auth(&args, authenticated, session_key);
    }
    if !*authenticated {
        return Err(Error::NoAuth);
    }

    match command.as_str() {
        "PING" => handle_ping(&args),
        "JOB.ENQUEUE" => handle_enqueue(&args, broker).await,
        "JOB.DEQUEUE" => handle_dequeue(&args, broker).await,
        "JOB.ACK" => handle_ack(&args, broker).await,
        "JOB.FAIL" => handle_fail(&args, broker).await,
        "JOB.DEAD" => handle_dead(&args, broker).await,
        "LEASE.ACQUIRE" => handle_lease_acquire(&args, broker).await,
        "LEASE.RELEASE" => handle_lease_release(&args, broker).await,
        _ => Err(Error::UnknownCommand(command)),
    }
}

/// Handle AUTH command
///
/// # Security
/// - Uses constant-time comparison to prevent timing attacks
/// - Validates key is not empty
/// - Requires exactly one argument
fn handle_auth(
    args: &[RespValue],
    authenticated: &mut bool,
    expected_key: &[u8],
) -> Result<RespValue> {
    if args.len() != 2 {
        return Err(Error::InvalidArguments(
            "AUTH requires exactly one argument".to_string(),
        ));
    }

    let RespValue::BulkString(provided_key) = &args[1] else {
        return Err(Error::InvalidArguments(
            "AUTH key must be a bulk string".to_string(),
        ));
    };

    if provided_key.is_empty() {
        return Err(Error::InvalidArguments(
            "AUTH key cannot be empty".to_string(),
        ));
    }

    // Pad to same length for constant-time comparison
    let max_len = provided_key.len().max(expected_key.len());
    let mut provided_padded = provided_key.clone();
    let mut expected_padded = expected_key.to_vec();
    provided_padded.resize(max_len, 0);
    expected_padded.resize(max_len, 0);

    let keys_match: bool = provided_padded.ct_eq(&expected_padded).into();
    if keys_match && provided_key.len() == expected_key.len() {
        *authenticated = true;
        debug!("Client authenticated successfully");
        Ok(RespValue::SimpleString("OK".to_string()))
    } else {
        warn!("Authentication failed: invalid key");
        Err(Error::InvalidArguments(
            "Invalid authentication key".to_string(),
        ))
    }
}

/// Handle PING command
///
/// - PING -> +PONG
/// - PING message -> echo
fn handle_ping(args: &[RespValue]) -> Result<RespValue> {
    match args.len() {
        1 => Ok(RespValue::SimpleString("PONG".to_string())),
        2 => match &args[1] {
            RespValue::BulkString(msg) => Ok(RespValue::BulkString(msg.clone())),
            _ => Err(Error::InvalidArguments(
                "PING message must be a bulk string".to_string(),
            )),
        },
        _ => Err(Error::InvalidArguments(
            "PING accepts 0 or 1 arguments".to_string(),
        )),
    }
}

fn expect_args(args: &[RespValue], count: usize, usage: &str) -> Result<()> {
    if args.len() == count + 1 {
        Ok(())
    } else {
        Err(Error::InvalidArguments(format!(
            "wrong number of arguments, usage: {usage}"
        )))
    }
}

fn arg_string(value: &RespValue, name: &str) -> Result<String> {
    value
        .as_string()
        .map_err(|_| Error::InvalidArguments(format!("{name} must be a UTF-8 string")))
}

fn arg_u64(value: &RespValue, name: &str) -> Result<u64> {
    value
        .as_u64()
        .map_err(|_| Error::InvalidArguments(format!("{name} must be a non-negative integer")))
}

fn arg_u32(value: &RespValue, name: &str) -> Result<u32> {
    u32::try_from(arg_u64(value, name)?)
        .map_err(|_| Error::InvalidArguments(format!("{name} is out of range")))
}

/// Reference to a leased delivery; the broker only needs id and attempt
fn delivery(args: &[RespValue]) -> Result<Job> {
    Ok(Job {
        id: JobHandle::from(arg_string(&args[1], "id")?),
        queue: String::new(),
        task_type: String::new(),
        payload: Vec::new(),
        attempt: arg_u32(&args[2], "attempt")?,
        max_attempts: 0,
        timeout: Duration::ZERO,
    })
}

async fn handle_enqueue(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(
        args,
        6,
        "JOB.ENQUEUE queue task_type payload max_attempts timeout_ms delay_ms",
    )?;
    let queue = arg_string(&args[1], "queue")?;
    let task_type = arg_string(&args[2], "task_type")?;
    let RespValue::BulkString(payload) = &args[3] else {
        return Err(Error::InvalidArguments(
            "payload must be a bulk string".to_string(),
        ));
    };
    let options = EnqueueOptions {
        max_attempts: arg_u32(&args[4], "max_attempts")?,
        timeout: Duration::from_millis(arg_u64(&args[5], "timeout_ms")?),
        delay: Duration::from_millis(arg_u64(&args[6], "delay_ms")?),
    };

    let id = broker.enqueue(&queue, &task_type, payload, &options).await?;
    Ok(RespValue::BulkString(id.to_string().into_bytes()))
}

async fn handle_dequeue(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(args, 2, "JOB.DEQUEUE queue wait_ms")?;
    let queue = arg_string(&args[1], "queue")?;
    let wait = Duration::from_millis(arg_u64(&args[2], "wait_ms")?).min(MAX_DEQUEUE_WAIT);

    match broker.dequeue(&queue, wait).await? {
        Some(job) => Ok(job_to_resp(job)),
        None => Ok(RespValue::NullBulkString),
    }
}

async fn handle_ack(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(args, 2, "JOB.ACK id attempt")?;
    broker.ack(&delivery(args)?).await?;
    Ok(RespValue::SimpleString("OK".to_string()))
}

async fn handle_fail(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(args, 4, "JOB.FAIL id attempt retryable reason")?;
    let job = delivery(args)?;
    let retryable = arg_u64(&args[3], "retryable")? != 0;
    let reason = arg_string(&args[4], "reason")?;

    let outcome = broker.fail(&job, &reason, retryable).await?;
    Ok(outcome_to_resp(&outcome))
}

async fn handle_dead(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(args, 2, "JOB.DEAD queue limit")?;
    let queue = arg_string(&args[1], "queue")?;
    let limit = usize::try_from(arg_u64(&args[2], "limit")?)
        .unwrap_or(MAX_DEAD_LIMIT)
        .min(MAX_DEAD_LIMIT);

    let letters = broker.dead_letters(&queue, limit).await?;
    Ok(RespValue::Array(
        letters.into_iter().map(dead_letter_to_resp).collect(),
    ))
}

async fn handle_lease_acquire(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(args, 3, "LEASE.ACQUIRE name holder ttl_ms")?;
    let name = arg_string(&args[1], "name")?;
    let holder = arg_string(&args[2], "holder")?;
    let ttl = Duration::from_millis(arg_u64(&args[3], "ttl_ms")?);

    let acquired = broker.acquire_lease(&name, &holder, ttl).await?;
    Ok(RespValue::Integer(i64::from(acquired)))
}

async fn handle_lease_release(args: &[RespValue], broker: &dyn Broker) -> Result<RespValue> {
    expect_args(args, 2, "LEASE.RELEASE name holder")?;
    let name = arg_string(&args[1], "name")?;
    let holder = arg_string(&args[2], "holder")?;

    broker.release_lease(&name, &holder).await?;
    Ok(RespValue::SimpleString("OK".to_string()))
}
