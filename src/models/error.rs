//! Defines basic error and result types used throughout the crate.

use std::{error::Error, fmt};

use redis::RedisError;

/// Result type used throughout the crate.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error type used throughout the crate.
#[derive(Debug)]
pub enum QueueError {
    /// Error occurred during interaction with Redis.
    Redis(RedisError),

    /// Error occurred while trying to get a pooled connection to Redis.
    Pool(String),

    /// Adding a payload failed because the key already existed. Item ids are
    /// random, so this indicates a broken store rather than a caller mistake.
    DuplicateItem(String),

    /// Request was not valid due to current state of some resource(s),
    /// e.g. starting a second worker runloop on the same queue instance.
    Conflict(String),

    /// Payload (de)serialisation failed.
    Serde(String),

    /// Operation is intentionally not provided by this queue.
    Unsupported(&'static str),
}

impl QueueError {
    /// Construct a new QueueError::Conflict with given message.
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        QueueError::Conflict(msg.into())
    }
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        QueueError::Redis(err)
    }
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        QueueError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serde(err.to_string())
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueError::Redis(err) => err.fmt(f),
            QueueError::Pool(msg) => write!(f, "Failed to get Redis connection: {}", msg),
            QueueError::DuplicateItem(id) => {
                write!(f, "Payload for item '{}' already exists", id)
            }
            QueueError::Serde(msg) => write!(f, "Serialisation error: {}", msg),
            QueueError::Unsupported(what) => write!(f, "Not supported: {}", what),
            QueueError::Conflict(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for QueueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            QueueError::Redis(err) => Some(err),
            _ => None,
        }
    }
}
