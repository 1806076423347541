//! Defines custom `DateTime` type.

use std::fmt;

use redis::{self, FromRedisValue, RedisResult, ToRedisArgs};
use serde::Serialize;

use crate::models::Duration;

/// Thin wrapper around a `chrono::DateTime<Utc>` with functions for custom (de)serialisation.
///
/// Stored in Redis as a signed integer number of milliseconds since the Unix
/// epoch, so that lease and retry arithmetic keeps sub-second resolution.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize)]
pub struct DateTime(chrono::DateTime<chrono::Utc>);

impl DateTime {
    /// Get current UTC date/time.
    pub fn now() -> Self {
        DateTime(chrono::Utc::now())
    }

    /// The Unix epoch, used as the stand-in for a missing timestamp.
    pub fn epoch() -> Self {
        DateTime(chrono::DateTime::UNIX_EPOCH)
    }

    /// Construct from milliseconds since the Unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        chrono::DateTime::from_timestamp_millis(millis).map(DateTime)
    }

    /// Get this date/time as milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Get number of milliseconds since another given date/time.
    pub fn millis_since(&self, other: &DateTime) -> i64 {
        self.0.signed_duration_since(other.0).num_milliseconds()
    }

    /// Get the date/time a given duration after this one.
    pub fn after(&self, duration: &Duration) -> Self {
        DateTime(self.0 + chrono::Duration::milliseconds(duration.as_millis() as i64))
    }
}

impl FromRedisValue for DateTime {
    /// Parse a millisecond epoch timestamp from Redis.
    fn from_redis_value(v: &redis::Value) -> RedisResult<Self> {
        let millis: i64 = redis::from_redis_value(v)?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| (redis::ErrorKind::TypeError, "Invalid timestamp").into())
    }
}

impl ToRedisArgs for DateTime {
    /// Format this struct as a millisecond epoch timestamp for storage in Redis.
    fn write_redis_args<W: ?Sized + redis::RedisWrite>(&self, out: &mut W) {
        self.timestamp_millis().write_redis_args(out)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
