//! Watch error taxonomy.
//!
//! Every failure in the engine is a [`WatchError`]. The enum is `Clone`
//! because a single decode failure fans out to every watcher on the
//! channel, and `PartialEq` so callers can route on the distinguished
//! variants (connection loss vs. overflow vs. latency).

use thiserror::Error;

/// Errors surfaced by the listener, watchers, and the payload codec.
///
/// Errors reach subscribers in-band as `Error` events; operations such as
/// [`Listener::listen`](crate::Listener::listen) also return them directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The listener was closed before or during the operation.
    #[error("listener has been closed")]
    ListenerClosed,

    /// The notification connection dropped. All `LISTEN` subscriptions are
    /// gone on the database side; callers must rebuild from a fresh
    /// list+watch.
    #[error("lost connection to database")]
    ConnectionLost,

    /// The watcher's staging buffer filled up. The watcher has been
    /// ejected so the delivery loop never blocks on a slow consumer.
    #[error("watcher channel is full, aborting watch")]
    WatcherFull,

    /// A stored payload row was already garbage-collected (or the fetch
    /// failed), meaning the consumer is lagging behind the producer's
    /// retention bound.
    #[error("failed to read notification data from large_notifications table, watcher latency may be too high: {0}")]
    LatencyTooHigh(String),

    /// The notification payload did not have exactly seven fields.
    #[error("failed to parse notification payload, wrong number of parts: {0}")]
    MalformedPayload(usize),

    /// The operation field was not `INSERT`, `UPDATE`, or `DELETE`.
    #[error("failed to decode notification payload operation type: {0}")]
    BadOperation(String),

    /// The primary-key field was not valid base64.
    #[error("failed to decode notification payload key base64")]
    BadKey,

    /// The index-value field was not valid base64.
    #[error("failed to decode notification payload index value base64")]
    BadIndexValue,

    /// The inline payload field was not valid base64.
    #[error("failed to decode notification payload data base64")]
    BadPayloadData,

    /// The epoch-timestamp field could not be parsed.
    #[error("failed to decode notification payload timestamp: {0}")]
    BadTimestamp(String),

    /// The watch was canceled through its external cancellation token.
    #[error("watch canceled")]
    Canceled,

    /// `send_initial` raced with the watcher being closed.
    #[error("failed to send initial event, watcher has been closed")]
    WatcherClosed,

    /// A database command failed (`LISTEN`, `UNLISTEN`, or a query).
    /// Carried as a message because the underlying driver error is not
    /// clonable across watcher fan-out.
    #[error("database error: {0}")]
    Db(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinguished_messages() {
        assert_eq!(
            WatchError::ListenerClosed.to_string(),
            "listener has been closed"
        );
        assert_eq!(
            WatchError::ConnectionLost.to_string(),
            "lost connection to database"
        );
        assert_eq!(
            WatchError::WatcherFull.to_string(),
            "watcher channel is full, aborting watch"
        );
        assert_eq!(
            WatchError::MalformedPayload(3).to_string(),
            "failed to parse notification payload, wrong number of parts: 3"
        );
        assert_eq!(
            WatchError::BadOperation("TRUNCATE".into()).to_string(),
            "failed to decode notification payload operation type: TRUNCATE"
        );
        assert!(WatchError::LatencyTooHigh("row not found".into())
            .to_string()
            .contains("watcher latency may be too high"));
    }
}
