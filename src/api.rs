//! Public API surface: thin free functions over [`Connection`] (`connect`,
//! `disconnect`, `publish`/`timed_publish`, `subscribe`/`timed_subscribe`,
//! `unsubscribe`/`timed_unsubscribe`, `wait`, `strerror`,
//! `operation_type_name`). The timed/untimed split collapses to one call
//! taking a `Duration` — an untimed caller just passes a generously long
//! one, since every suspension point in this runtime already has a bound.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{ClientConfig, RuntimeConfig};
use crate::connection::{
    Completion, Connection, OperationHandle, OperationType, RestoredSubscription,
    SubscribeCallback,
};
use crate::error::{Error, Status};
use crate::pool::Pool;
use crate::protocol::QoS;
use crate::transport::Transport;

/// Flag requesting a blocking wait on an operation's completion semaphore.
pub use crate::connection::WAITABLE;
/// Flag marking a disconnect as cleanup-only: skip the wire DISCONNECT, just
/// tear down local state.
pub use crate::connection::CLEANUP_ONLY;

/// A never-expected-to-elapse bound for callers that want to block
/// indefinitely in practice. Still a real timeout so a wedged broker cannot
/// hang a caller forever.
pub const NO_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Opens a connection: establishes the transport-level session and performs
/// the CONNECT/CONNACK round trip.
pub async fn connect(
    transport: Box<dyn Transport>,
    config: ClientConfig,
    runtime_config: RuntimeConfig,
    pool: Arc<dyn Pool>,
    restored_subscriptions: Vec<RestoredSubscription>,
    timeout: Duration,
) -> Result<Connection, Error> {
    Connection::connect(
        transport,
        config,
        runtime_config,
        pool,
        restored_subscriptions,
        timeout,
    )
    .await
}

/// Disconnects `conn`. `cleanup_only` skips the wire DISCONNECT and just
/// tears down local state — the no-op-but-still-releases-resources path for
/// a connection already known to be dead.
pub async fn disconnect(conn: &Connection, cleanup_only: bool, timeout: Duration) -> Status {
    conn.disconnect(cleanup_only, timeout).await
}

/// Publishes `payload` to `topic`. QoS 0 must use `Completion::Fire`.
pub async fn publish(
    conn: &Connection,
    topic: impl Into<Arc<str>>,
    payload: impl Into<Bytes>,
    qos: QoS,
    retain: bool,
    completion: Completion,
) -> Result<OperationHandle, Error> {
    conn.publish(topic, payload, qos, retain, completion).await
}

/// Publishes and blocks up to `timeout` for the outcome. Builds the
/// operation as `Completion::Waitable` regardless of what the caller might
/// otherwise have chosen, since there would be nothing to wait on
/// otherwise.
pub async fn timed_publish(
    conn: &Connection,
    topic: impl Into<Arc<str>>,
    payload: impl Into<Bytes>,
    qos: QoS,
    retain: bool,
    timeout: Duration,
) -> Result<Status, Error> {
    let handle = conn
        .publish(topic, payload, qos, retain, Completion::Waitable)
        .await?;
    Ok(handle.wait(timeout).await)
}

/// Subscribes to `filter`, invoking `callback` for every matching inbound
/// PUBLISH until unsubscribed.
pub async fn subscribe(
    conn: &Connection,
    filter: impl Into<String>,
    qos: QoS,
    completion: Completion,
    callback: SubscribeCallback,
) -> Result<OperationHandle, Error> {
    conn.subscribe(filter, qos, completion, callback).await
}

pub async fn timed_subscribe(
    conn: &Connection,
    filter: impl Into<String>,
    qos: QoS,
    timeout: Duration,
    callback: SubscribeCallback,
) -> Result<Status, Error> {
    let handle = conn
        .subscribe(filter, qos, Completion::Waitable, callback)
        .await?;
    Ok(handle.wait(timeout).await)
}

pub async fn unsubscribe(
    conn: &Connection,
    filter: &str,
    completion: Completion,
) -> Result<OperationHandle, Error> {
    conn.unsubscribe(filter, completion).await
}

pub async fn timed_unsubscribe(
    conn: &Connection,
    filter: &str,
    timeout: Duration,
) -> Result<Status, Error> {
    let handle = conn.unsubscribe(filter, Completion::Waitable).await?;
    Ok(handle.wait(timeout).await)
}

/// Blocks on an operation's completion up to `timeout`. A non-waitable
/// handle returns its current status immediately.
pub async fn wait(handle: OperationHandle, timeout: Duration) -> Status {
    handle.wait(timeout).await
}

/// Human-readable name for a status, for logs and error messages.
pub fn strerror(status: Status) -> &'static str {
    status.as_str()
}

/// Human-readable name for an operation type, for logs and error messages.
pub fn operation_type_name(op_type: OperationType) -> &'static str {
    op_type.name()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strerror_matches_status_as_str() {
        assert_eq!(strerror(Status::Timeout), Status::Timeout.as_str());
    }

    #[test]
    fn operation_type_name_matches_enum_name() {
        assert_eq!(operation_type_name(OperationType::Subscribe), "SUBSCRIBE");
    }
}
