//! The connection handle: owns the transport, the subscription table, the
//! two operation lists, and dispatches the public request-issuing API.
//!
//! Mirrors `vibesrc-vibemq::broker::connection::mod::Connection`'s shape
//! (a cheaply-cloned handle around an `Arc<Inner>`, a send-path guarded by
//! its own lock, a `State` the run loop and callers both touch) with the
//! client/server roles reversed: this `Connection` drives a broker instead
//! of serving one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use tokio::io::split;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::allocator::BufferAllocator;
#[cfg(feature = "static-pool")]
use crate::allocator::FixedPoolAllocator;
#[cfg(not(feature = "static-pool"))]
use crate::allocator::HeapAllocator;
use crate::codec::Encoder;
use crate::config::{ClientConfig, RuntimeConfig};
use crate::connection::operation::{Completion, Operation, OperationType, RetryState};
use crate::connection::packet_id::PacketIdAllocator;
use crate::connection::serializer::SerializerOverrides;
use crate::connection::subscription::{SubscribeCallback, Subscription, SubscriptionTable};
use crate::error::{Error, Status};
use crate::pool::{boxed, Pool};
use crate::pool::JobHandle;
use crate::protocol::{Connect, Packet, QoS};
use crate::topic::validate_topic_filter;
use crate::transport::Transport;

/// A previously-known subscription restored on a session-present CONNACK
/// (`clean_session == false`). Gets no packet-id correlation: no SUBACK is
/// coming for it, it is simply re-armed as an already-active record. See
/// `DESIGN.md`'s "previous subscriptions" decision.
pub struct RestoredSubscription {
    pub topic_filter: String,
    pub qos: QoS,
    pub callback: SubscribeCallback,
}

pub(super) struct PendingState {
    pub(super) disconnected: bool,
    pub(super) pending_send: VecDeque<Arc<Operation>>,
    /// Keyed by packet id. CONNECT has none and is tracked by
    /// `pending_connect` instead; DISCONNECT and QoS 0 PUBLISH never enter
    /// this table at all (`OperationType::expects_ack` is false for them).
    pub(super) pending_response: HashMap<u16, Arc<Operation>>,
    pub(super) pending_connect: Option<Arc<Operation>>,
}

pub(super) struct ConnectionInner {
    pub(super) aws_mode: bool,
    pub(super) encoder: Encoder,
    /// Backs every outgoing packet buffer. Swapped for `FixedPoolAllocator`
    /// under the `static-pool` feature; the connection is otherwise unaware
    /// which strategy is in use.
    pub(super) allocator: Arc<dyn BufferAllocator>,
    pub(super) serializer_overrides: Option<Arc<dyn SerializerOverrides>>,
    /// The send turnstile: every transport write, whether an original send,
    /// a retry, a synthesized PUBACK, or a keep-alive PINGREQ, goes through
    /// this lock, realizing "process-send re-entrancy-safe via ... a
    /// non-recursive lock acquired only inside process-send."
    pub(super) write_half: AsyncMutex<tokio::io::WriteHalf<Box<dyn Transport>>>,
    pub(super) packet_ids: PacketIdAllocator,
    pub(super) keep_alive_ms: u32,
    pub(super) pingreq_packet: Bytes,
    pub(super) pingresp_seen: AtomicBool,
    pub(super) retry_ms_ceiling: u32,
    pub(super) response_wait: Duration,
    pub(super) retry_limit: u32,
    pub(super) retry_ms: u32,
    pub(super) pool: Arc<dyn Pool>,
    pub(super) keep_alive_job: SyncMutex<Option<JobHandle>>,
    /// Guards `disconnected` and both operation lists. Reference counting
    /// itself is realized by `Arc<ConnectionInner>` strong-count rather than
    /// a parallel hand-rolled counter — every task that holds the connection
    /// open (the keep-alive job, a retry timer, the receive loop) does so by
    /// holding a `Connection` clone, so `Arc` drop glue is what tears the
    /// connection down once nothing references it.
    pub(super) state: SyncMutex<PendingState>,
    /// Strictly below `state` in lock order.
    pub(super) subscriptions: SyncMutex<SubscriptionTable>,
}

/// A live MQTT connection. Cheap to clone; clones share the same
/// underlying state and transport.
#[derive(Clone)]
pub struct Connection {
    pub(super) inner: Arc<ConnectionInner>,
}

/// A handle to a request-issuing call's operation, returned whether or not
/// the caller asked to be notified. `status()` is a non-blocking peek;
/// `wait` blocks (with a timeout) only if the operation was built with
/// `Completion::Waitable`.
pub struct OperationHandle {
    op: Arc<Operation>,
    semaphore: Option<Arc<Semaphore>>,
    on_timeout: Option<Box<dyn FnOnce() + Send>>,
}

impl OperationHandle {
    pub fn status(&self) -> Status {
        self.op.status()
    }

    pub fn operation_type(&self) -> OperationType {
        self.op.op_type
    }

    /// Blocks on this operation's completion up to `timeout`. A non-waitable
    /// handle (built with `Completion::Fire` or `Completion::Callback`)
    /// returns its current status immediately without blocking.
    pub async fn wait(mut self, timeout: Duration) -> Status {
        let status = match self.semaphore.take() {
            Some(semaphore) => match tokio::time::timeout(timeout, semaphore.acquire()).await {
                Ok(Ok(permit)) => {
                    permit.forget();
                    self.op.status()
                }
                Ok(Err(_)) => self.op.status(),
                Err(_) => {
                    if let Some(cleanup) = self.on_timeout.take() {
                        cleanup();
                    }
                    Status::Timeout
                }
            },
            None => self.op.status(),
        };
        status
    }
}

fn closed_error() -> Error {
    Error::NetworkError(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "connection is disconnected",
    ))
}

impl Connection {
    /// Establishes a connection: validates `config`, opens the CONNECT
    /// round trip over `transport`, and (on success) arms keep-alive.
    /// Sends the CONNECT and, only on an accepted CONNACK, arms keep-alive.
    pub async fn connect(
        transport: Box<dyn Transport>,
        config: ClientConfig,
        runtime_config: RuntimeConfig,
        pool: Arc<dyn Pool>,
        restored_subscriptions: Vec<RestoredSubscription>,
        timeout: Duration,
    ) -> Result<Connection, Error> {
        tracing::debug!(client_id = %config.client_id, clean_session = config.clean_session, "connecting");

        if config.client_id.is_empty() {
            return Err(Error::BadParameter("client id must not be empty"));
        }
        if let Some(will) = &config.will {
            if will.payload.len() > 65_535 {
                return Err(Error::BadParameter(
                    "will payload exceeds 65535 bytes (will-only restriction)",
                ));
            }
        }
        if !config.clean_session {
            for restored in &restored_subscriptions {
                validate_topic_filter(&restored.topic_filter).map_err(Error::BadParameter)?;
            }
        }

        super::operation::set_asserts_enabled(runtime_config.enable_asserts);

        let (read_half, write_half) = split(transport);
        let encoder = Encoder::new();
        let keep_alive_secs = config.effective_keep_alive_secs();
        let keep_alive_ms = keep_alive_secs as u32 * 1000;

        // Overrides are a process-wide opt-in: a connection configured with
        // one is still subject to `RuntimeConfig::enable_serializer_overrides`
        // being set, so the override can be switched off everywhere without
        // touching `ClientConfig`.
        let serializer_overrides = runtime_config
            .enable_serializer_overrides
            .then(|| config.serializer_overrides.clone())
            .flatten();
        if serializer_overrides.is_some() {
            // One-time process-wide init of the serializer-override module.
            crate::runtime::Runtime::get();
        }

        #[cfg(feature = "static-pool")]
        let allocator: Arc<dyn BufferAllocator> = Arc::new(FixedPoolAllocator::new(
            runtime_config.message_buffers,
            runtime_config.message_buffer_size,
        ));
        #[cfg(not(feature = "static-pool"))]
        let allocator: Arc<dyn BufferAllocator> = Arc::new(HeapAllocator::new());

        let pingreq_packet = if keep_alive_ms != 0 {
            let mut buf = allocator.allocate(0).unwrap_or_default();
            encoder.encode(&Packet::PingReq, &mut buf)?;
            let buf = match &serializer_overrides {
                Some(overrides) => overrides.pingreq(buf)?,
                None => buf,
            };
            buf.freeze()
        } else {
            Bytes::new()
        };

        let inner = Arc::new(ConnectionInner {
            aws_mode: config.aws_mode,
            encoder,
            allocator,
            serializer_overrides,
            write_half: AsyncMutex::new(write_half),
            packet_ids: PacketIdAllocator::new(),
            keep_alive_ms,
            pingreq_packet,
            pingresp_seen: AtomicBool::new(true),
            retry_ms_ceiling: runtime_config.retry_ms_ceiling as u32,
            response_wait: runtime_config.response_wait(),
            retry_limit: config.retry_limit,
            retry_ms: config.retry_ms,
            pool,
            keep_alive_job: SyncMutex::new(None),
            state: SyncMutex::new(PendingState {
                disconnected: false,
                pending_send: VecDeque::new(),
                pending_response: HashMap::new(),
                pending_connect: None,
            }),
            subscriptions: SyncMutex::new(SubscriptionTable::new()),
        });
        let conn = Connection { inner };

        if !restored_subscriptions.is_empty() {
            let mut subs = conn.inner.subscriptions.lock();
            for restored in restored_subscriptions {
                subs.insert(Subscription::new(
                    restored.topic_filter,
                    restored.qos,
                    0,
                    restored.callback,
                ));
            }
        }

        let reader = conn.clone();
        tokio::spawn(async move { reader.spawn_receive_loop(read_half).await });

        let connect_packet = Connect {
            client_id: config.client_id.clone(),
            clean_session: config.clean_session,
            keep_alive: keep_alive_secs,
            username: config.username.clone(),
            password: config.password.clone().map(Bytes::from),
            will: config.will.clone(),
        };
        let mut buf = conn.inner.allocator.allocate(0).unwrap_or_default();
        conn.inner
            .encoder
            .encode(&Packet::Connect(Box::new(connect_packet.clone())), &mut buf)?;
        let buf = match &conn.inner.serializer_overrides {
            Some(overrides) => overrides.connect(&connect_packet, buf)?,
            None => buf,
        };

        let (notify, flags, semaphore) = Completion::Waitable.into_notify();
        let op = Operation::new(
            OperationType::Connect,
            flags,
            buf,
            0,
            None,
            RetryState::none(),
            notify,
        );
        {
            let mut state = conn.inner.state.lock();
            state.pending_send.push_back(op.clone());
        }
        let sender = conn.clone();
        let send_op = op.clone();
        conn.inner
            .pool
            .spawn_now(boxed(async move { sender.process_send(send_op).await }));

        let handle = OperationHandle {
            op,
            semaphore,
            on_timeout: None,
        };
        let status = handle.wait(timeout).await;

        if status.is_success() {
            tracing::debug!(client_id = %config.client_id, "CONNACK accepted");
            if keep_alive_ms != 0 {
                conn.clone().arm_keep_alive();
            }
            Ok(conn)
        } else {
            tracing::error!(client_id = %config.client_id, ?status, "connect failed");
            conn.close(status).await;
            Err(match status {
                Status::Timeout => Error::Timeout,
                Status::ServerRefused => Error::ServerRefused("broker refused the CONNECT"),
                _ => Error::NetworkError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "connect failed",
                )),
            })
        }
    }

    /// Publishes to `topic`. QoS 0 must use `Completion::Fire` — no
    /// acknowledgement is ever observed for it. In AWS mode, a QoS 1
    /// publish's packet-id byte offset is captured so the scheduler can
    /// rewrite it in place on retry.
    pub async fn publish(
        &self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        completion: Completion,
    ) -> Result<OperationHandle, Error> {
        if qos == QoS::ExactlyOnce {
            return Err(Error::BadParameter(
                "QoS 2 publishes are not originated by this client",
            ));
        }
        if qos == QoS::AtMostOnce && !matches!(completion, Completion::Fire) {
            return Err(Error::BadParameter(
                "QoS 0 publish must not request a completion signal",
            ));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            Some(self.inner.packet_ids.allocate())
        } else {
            None
        };

        let publish_packet = crate::protocol::Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: payload.into(),
        };
        tracing::debug!(
            topic = %publish_packet.topic,
            ?qos,
            ?packet_id,
            "enqueuing PUBLISH"
        );
        let mut buf = self.inner.allocator.allocate(0).unwrap_or_default();
        let offset = self.inner.encoder.encode_publish(&publish_packet, &mut buf)?;
        let (buf, offset) = match &self.inner.serializer_overrides {
            Some(overrides) => overrides.publish(&publish_packet, (buf, offset))?,
            None => (buf, offset),
        };
        let packet_id_offset = if self.inner.aws_mode { offset } else { None };

        let retry = if qos == QoS::AtMostOnce {
            RetryState::none()
        } else {
            RetryState {
                limit: self.inner.retry_limit,
                count: 0,
                next_period_ms: self.inner.retry_ms,
            }
        };

        let (notify, flags, semaphore) = completion.into_notify();
        let op = Operation::new(
            OperationType::PublishToServer,
            flags,
            buf,
            packet_id.unwrap_or(0),
            packet_id_offset,
            retry,
            notify,
        );

        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return Err(closed_error());
            }
            state.pending_send.push_back(op.clone());
        }
        let conn = self.clone();
        let send_op = op.clone();
        self.inner
            .pool
            .spawn_now(boxed(async move { conn.process_send(send_op).await }));

        Ok(OperationHandle {
            op,
            semaphore,
            on_timeout: None,
        })
    }

    /// Subscribes to `filter`. The subscription record is added to the
    /// table immediately (before the send is scheduled) so an inbound
    /// PUBLISH arriving just after the SUBACK is never missed; a timed
    /// caller that gives up removes it again via `OperationHandle`'s
    /// timeout cleanup.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        completion: Completion,
        callback: SubscribeCallback,
    ) -> Result<OperationHandle, Error> {
        let filter = filter.into();
        validate_topic_filter(&filter).map_err(Error::BadParameter)?;

        let packet_id = self.inner.packet_ids.allocate();
        let packet = crate::protocol::Subscribe {
            packet_id,
            filters: vec![crate::protocol::SubscribeFilter {
                filter: filter.clone(),
                qos,
            }],
        };
        tracing::debug!(filter = %filter, ?qos, packet_id, "enqueuing SUBSCRIBE");
        let mut buf = self.inner.allocator.allocate(0).unwrap_or_default();
        self.inner
            .encoder
            .encode(&Packet::Subscribe(packet.clone()), &mut buf)?;
        let buf = match &self.inner.serializer_overrides {
            Some(overrides) => overrides.subscribe(&packet, buf)?,
            None => buf,
        };

        let subscription = Subscription::new(filter.clone(), qos, packet_id, callback);
        {
            let mut subs = self.inner.subscriptions.lock();
            subs.insert(subscription);
        }

        let (notify, flags, semaphore) = completion.into_notify();
        let op = Operation::new(
            OperationType::Subscribe,
            flags,
            buf,
            packet_id,
            None,
            RetryState::none(),
            notify,
        );

        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                drop(state);
                self.inner.subscriptions.lock().remove_by_packet_id(packet_id);
                return Err(closed_error());
            }
            state.pending_send.push_back(op.clone());
        }

        let conn = self.clone();
        let send_op = op.clone();
        self.inner
            .pool
            .spawn_now(boxed(async move { conn.process_send(send_op).await }));

        let cleanup_conn = self.clone();
        let on_timeout: Option<Box<dyn FnOnce() + Send>> = Some(Box::new(move || {
            cleanup_conn
                .inner
                .subscriptions
                .lock()
                .remove_by_packet_id(packet_id);
        }));

        Ok(OperationHandle {
            op,
            semaphore,
            on_timeout,
        })
    }

    /// Unsubscribes from `filter`. The subscription record is removed
    /// **before** the UNSUBSCRIBE is sent, so a same-filter SUBSCRIBE racing
    /// in cannot be mistaken for the old registration.
    pub async fn unsubscribe(
        &self,
        filter: &str,
        completion: Completion,
    ) -> Result<OperationHandle, Error> {
        validate_topic_filter(filter).map_err(Error::BadParameter)?;

        {
            let mut subs = self.inner.subscriptions.lock();
            if let Some(sub) = subs.remove_by_filter(filter) {
                sub.mark_unsubscribed();
                sub.release();
            }
        }

        let packet_id = self.inner.packet_ids.allocate();
        let packet = crate::protocol::Unsubscribe {
            packet_id,
            filters: vec![filter.to_string()],
        };
        tracing::debug!(filter, packet_id, "enqueuing UNSUBSCRIBE");
        let mut buf = self.inner.allocator.allocate(0).unwrap_or_default();
        self.inner
            .encoder
            .encode(&Packet::Unsubscribe(packet.clone()), &mut buf)?;
        let buf = match &self.inner.serializer_overrides {
            Some(overrides) => overrides.unsubscribe(&packet, buf)?,
            None => buf,
        };

        let (notify, flags, semaphore) = completion.into_notify();
        let op = Operation::new(
            OperationType::Unsubscribe,
            flags,
            buf,
            packet_id,
            None,
            RetryState::none(),
            notify,
        );
        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return Err(closed_error());
            }
            state.pending_send.push_back(op.clone());
        }
        let conn = self.clone();
        let send_op = op.clone();
        self.inner
            .pool
            .spawn_now(boxed(async move { conn.process_send(send_op).await }));

        Ok(OperationHandle {
            op,
            semaphore,
            on_timeout: None,
        })
    }

    /// Orderly disconnect. Unless `cleanup_only`, sends a waitable
    /// DISCONNECT and waits up to `timeout` for it to flush; then
    /// unconditionally tears down the transport and fails every remaining
    /// operation with `NETWORK_ERROR`.
    pub async fn disconnect(&self, cleanup_only: bool, timeout: Duration) -> Status {
        tracing::debug!(cleanup_only, "disconnecting");
        if self.inner.state.lock().disconnected {
            return Status::Success;
        }

        let mut final_status = Status::Success;
        if !cleanup_only {
            let mut buf = self.inner.allocator.allocate(0).unwrap_or_default();
            let encoded = self.inner.encoder.encode(&Packet::Disconnect, &mut buf).is_ok();
            let buf = match (&self.inner.serializer_overrides, encoded) {
                (Some(overrides), true) => overrides.disconnect(buf).ok(),
                (None, true) => Some(buf),
                (_, false) => None,
            };
            if let Some(buf) = buf {
                let (notify, flags, semaphore) = Completion::Waitable.into_notify();
                let op = Operation::new(
                    OperationType::Disconnect,
                    flags,
                    buf,
                    0,
                    None,
                    RetryState::none(),
                    notify,
                );
                {
                    let mut state = self.inner.state.lock();
                    if !state.disconnected {
                        state.pending_send.push_back(op.clone());
                    }
                }
                let conn = self.clone();
                let send_op = op.clone();
                self.inner
                    .pool
                    .spawn_now(boxed(async move { conn.process_send(send_op).await }));

                let handle = OperationHandle {
                    op,
                    semaphore,
                    on_timeout: None,
                };
                final_status = handle.wait(timeout).await;
                if !matches!(
                    final_status,
                    Status::Success | Status::Timeout | Status::NetworkError
                ) {
                    final_status = Status::Success;
                }
            }
        }

        self.close(Status::NetworkError).await;
        final_status
    }

    pub(super) fn arm_keep_alive(self) {
        if self.inner.keep_alive_ms == 0 {
            return;
        }
        let delay = Duration::from_millis(self.inner.keep_alive_ms as u64);
        let conn = self.clone();
        let handle = self
            .inner
            .pool
            .spawn_after(delay, boxed(async move { conn.process_keep_alive().await }));
        *self.inner.keep_alive_job.lock() = Some(handle);
    }

    /// Tears the connection down: marks `disconnected`, cancels the
    /// keep-alive job, and fails every operation still on either list with
    /// `reason`. Idempotent — a connection already torn down is a no-op.
    pub(super) async fn close(&self, reason: Status) {
        let (to_fail, keep_alive_job) = {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return;
            }
            tracing::debug!(?reason, "connection closed");
            state.disconnected = true;
            let mut to_fail: Vec<Arc<Operation>> = state.pending_send.drain(..).collect();
            to_fail.extend(state.pending_response.drain().map(|(_, op)| op));
            if let Some(op) = state.pending_connect.take() {
                to_fail.push(op);
            }
            (to_fail, self.inner.keep_alive_job.lock().take())
        };
        if let Some(handle) = keep_alive_job {
            handle.cancel();
        }
        for op in to_fail {
            op.complete(reason);
            op.notify().signal(op.status());
            self.inner.allocator.free(op.take_packet());
            op.release();
        }
    }
}
