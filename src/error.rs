//! Error types for agent-dispatch

use thiserror::Error;

/// Result type alias for agent-dispatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while moving events and jobs through the queue
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP protocol parsing error
    #[error("RESP protocol error: {0}")]
    Protocol(String),

    /// Authentication error
    #[error("Authentication required")]
    NoAuth,

    /// Invalid command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Invalid arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Message too large
    #[error("Message exceeds maximum size limit")]
    MessageTooLarge,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout
    #[error("Operation timeout")]
    Timeout,

    /// Broker storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed event or job payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Subscription lookup failed
    #[error("Subscription lookup failed: {0}")]
    Resolver(String),

    /// Broker rejected a job
    #[error("Enqueue failed: {0}")]
    Enqueue(String),

    /// Agent execution failed
    #[error("Agent run failed: {0}")]
    Runner(String),

    /// No handler registered for a task type
    #[error("No handler registered for task type '{0}'")]
    HandlerNotFound(String),

    /// Job is not known to the broker (already acked, reclaimed or dead)
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A named lease is held by another live holder
    #[error("Lease '{0}' is held by another instance")]
    LeaseHeld(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error reply from a remote broker
    #[error("Remote broker error: {0}")]
    Remote(String),
}

impl Error {
    /// Whether a job failing with this error should be redelivered.
    ///
    /// Malformed input never becomes well-formed on retry, so decode failures
    /// go straight to dead-letter without consuming retry budget.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Decode(_))
    }

    /// Convert error to RESP error message
    #[must_use]
    pub fn to_resp_error(&self) -> String {
        match self {
            Error::NoAuth => "-ERR NOAUTH Authentication required\r\n".to_string(),
            Error::UnknownCommand(cmd) => format!("-ERR unknown command '{cmd}'\r\n"),
            Error::InvalidArguments(msg) => format!("-ERR {msg}\r\n"),
            Error::Protocol(msg) => format!("-ERR Protocol error: {msg}\r\n"),
            Error::MessageTooLarge => "-ERR Message too large\r\n".to_string(),
            Error::JobNotFound(id) => format!("-NOTFOUND job {id}\r\n"),
            Error::Storage(_) => "-ERR Storage unavailable\r\n".to_string(),
            _ => "-ERR Internal error\r\n".to_string(),
        }
    }
}
