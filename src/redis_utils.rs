//! Miscellaneous Redis utilities and helper functions.

/// Helper macro to perform optimistic WATCH/MULTI transactions in Redis.
/// Based on the `redis::transaction` implementation, but usable with async
/// connections and without restricting the return type with `FromRedisValue`.
///
/// Takes a connection, the keys to watch, and a body expression that
/// evaluates to an `Option<T>`. A value of `Some(T)` means that the
/// transaction succeeded (or decided not to run), and that the loop should
/// terminate. A value of `None` means that a watched key was modified during
/// the transaction, and that the transaction should be retried.
#[macro_export]
macro_rules! transaction_async {
    ($conn:expr, $keys:expr, $body:expr) => {{
        loop {
            ::redis::cmd("WATCH")
                .arg($keys)
                .query_async::<_, ()>($conn)
                .await?;
            if let Some(result) = $body {
                // ensure no watch is left on the connection, regardless of whether a pipeline ran
                ::redis::cmd("UNWATCH").query_async::<_, ()>($conn).await?;
                break result;
            }
        }
    }};
}
