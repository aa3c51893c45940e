//! The unit of asynchronous work the connection runtime schedules: a
//! serialized packet plus delivery metadata, reference count, completion
//! signal, and optional retry schedule.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::Status;

static ASSERTS_ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

/// Sets the process-wide gate for the `debug_assert!`-style consistency
/// checks in this module and in `subscription`. Called once from
/// `Connection::connect` with `RuntimeConfig::enable_asserts`.
pub fn set_asserts_enabled(enabled: bool) {
    ASSERTS_ENABLED.store(enabled, Ordering::Release);
}

pub(crate) fn asserts_enabled() -> bool {
    ASSERTS_ENABLED.load(Ordering::Acquire)
}

/// An operation never expects more than one acknowledgement, so `WAITABLE`
/// and `CLEANUP_ONLY` fit in a byte.
pub const WAITABLE: u8 = 0b01;
pub const CLEANUP_ONLY: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Connect,
    PublishToServer,
    PubAck,
    Subscribe,
    Unsubscribe,
    PingReq,
    Disconnect,
}

impl OperationType {
    /// Human-readable name, for logging and `operation_type_name`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::PublishToServer => "PUBLISH_TO_SERVER",
            Self::PubAck => "PUBACK",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::PingReq => "PINGREQ",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Whether this operation type moves to `pending-response` and waits
    /// for a correlated inbound packet after it is sent. QoS 0 publishes are
    /// represented as `PublishToServer` too, so the caller must additionally
    /// check whether a packet id was assigned.
    pub fn expects_ack(self) -> bool {
        matches!(self, Self::Connect | Self::Subscribe | Self::Unsubscribe)
    }
}

/// How a waiting caller (or none) is notified of completion.
pub enum Notify {
    Callback(Arc<dyn Fn(Status) + Send + Sync>),
    Waitable(Arc<Semaphore>),
    None,
}

impl Notify {
    /// Signals completion exactly once. A semaphore permit is added so a
    /// concurrent `wait` unblocks; a callback is invoked directly. Must
    /// never be called while a connection lock is held.
    pub fn signal(&self, status: Status) {
        match self {
            Notify::Callback(cb) => cb(status),
            Notify::Waitable(sem) => sem.add_permits(1),
            Notify::None => {}
        }
    }
}

/// Exponential-backoff retry state, consulted only for QoS 1 publishes.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    pub limit: u32,
    pub count: u32,
    pub next_period_ms: u32,
}

impl RetryState {
    pub fn none() -> Self {
        Self {
            limit: 0,
            count: 0,
            next_period_ms: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.limit > 0 && self.count >= self.limit
    }

    /// Doubles the backoff period, capped at `ceiling_ms`, and counts this
    /// attempt.
    pub fn advance(&mut self, ceiling_ms: u32) {
        self.count += 1;
        self.next_period_ms = (self.next_period_ms.saturating_mul(2)).min(ceiling_ms);
    }
}

/// How a caller wants to learn an operation's outcome: a callback, a
/// semaphore to wait on, or nothing at all. A parameter the caller picks
/// explicitly, since Rust has no natural bitflag-selected union of a
/// function pointer and a kernel object.
pub enum Completion {
    /// Fire and forget; nobody is notified.
    Fire,
    /// `WAITABLE`: block on [`OperationHandle::wait`][crate::connection::OperationHandle::wait].
    Waitable,
    /// Invoke `callback` exactly once with the terminal status.
    Callback(Arc<dyn Fn(Status) + Send + Sync>),
}

impl Completion {
    /// Builds the `Notify` this completion implies, the `WAITABLE` flag bit
    /// if applicable, and the semaphore a waiter needs (kept separately
    /// since `Notify` itself is not otherwise inspectable from outside this
    /// module).
    pub fn into_notify(self) -> (Notify, u8, Option<Arc<Semaphore>>) {
        match self {
            Completion::Fire => (Notify::None, 0, None),
            Completion::Waitable => {
                let semaphore = Arc::new(Semaphore::new(0));
                (Notify::Waitable(semaphore.clone()), WAITABLE, Some(semaphore))
            }
            Completion::Callback(callback) => (Notify::Callback(callback), 0, None),
        }
    }
}

struct OperationMutable {
    status: Status,
    retry: RetryState,
}

/// A queued or in-flight unit of work.
pub struct Operation {
    pub op_type: OperationType,
    pub flags: u8,
    /// Serialized packet bytes. Mutable only so the AWS-mode retry path can
    /// write through `packet_id_offset`; the bytes are otherwise never
    /// altered between sends.
    packet: Mutex<BytesMut>,
    /// 0 if this operation has no packet identifier (e.g. PINGREQ,
    /// DISCONNECT).
    pub packet_id: u16,
    /// AWS-mode only: byte offset of the packet-id field within `packet`,
    /// rewritten through before every retransmission so the bytes stay
    /// byte-identical across retries.
    pub packet_id_offset: Option<usize>,
    state: Mutex<OperationMutable>,
    references: AtomicI64,
    notify: Notify,
}

impl Operation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op_type: OperationType,
        flags: u8,
        packet: BytesMut,
        packet_id: u16,
        packet_id_offset: Option<usize>,
        retry: RetryState,
        notify: Notify,
    ) -> Arc<Self> {
        Arc::new(Self {
            op_type,
            flags,
            packet: Mutex::new(packet),
            packet_id,
            packet_id_offset,
            state: Mutex::new(OperationMutable {
                status: Status::StatusPending,
                retry,
            }),
            references: AtomicI64::new(1),
            notify,
        })
    }

    pub fn is_waitable(&self) -> bool {
        self.flags & WAITABLE != 0
    }

    pub fn is_cleanup_only(&self) -> bool {
        self.flags & CLEANUP_ONLY != 0
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status(), Status::StatusPending)
    }

    /// Transitions to a terminal status. A no-op if already terminal —
    /// completion must fire exactly once, so callers check `is_terminal`
    /// under the connection's response-table lock before calling this.
    pub fn complete(&self, status: Status) {
        let mut state = self.state.lock();
        if matches!(state.status, Status::StatusPending) {
            state.status = status;
        }
    }

    pub fn retry(&self) -> RetryState {
        self.state.lock().retry
    }

    pub fn advance_retry(&self, ceiling_ms: u32) {
        self.state.lock().retry.advance(ceiling_ms);
    }

    pub fn clear_retry(&self) {
        self.state.lock().retry = RetryState::none();
    }

    /// Rewrites the two packet-identifier bytes in the serialized buffer in
    /// place, for AWS-mode byte-identical retransmission.
    pub fn rewrite_packet_id(&self) {
        if let Some(offset) = self.packet_id_offset {
            let mut packet = self.packet.lock();
            let id_bytes = self.packet_id.to_be_bytes();
            packet[offset] = id_bytes[0];
            packet[offset + 1] = id_bytes[1];
        }
    }

    pub fn packet_bytes(&self) -> BytesMut {
        self.packet.lock().clone()
    }

    /// Takes the packet buffer, leaving an empty one behind. Called exactly
    /// once, when the operation completes, so its buffer can be returned to
    /// the connection's allocator.
    pub fn take_packet(&self) -> BytesMut {
        std::mem::take(&mut self.packet.lock())
    }

    pub fn acquire(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a reference; returns `true` if this was the last one, at
    /// which point the caller should signal completion if not already done
    /// and drop the operation.
    pub fn release(&self) -> bool {
        let remaining = self.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if asserts_enabled() {
            debug_assert!(remaining >= 0, "operation reference count underflow");
        }
        remaining == 0
    }

    pub fn notify(&self) -> &Notify {
        &self.notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(packet_id_offset: Option<usize>) -> Arc<Operation> {
        let mut packet = BytesMut::new();
        packet.extend_from_slice(&[0x30, 0x02, 0x00, 0x01]);
        Operation::new(
            OperationType::PublishToServer,
            WAITABLE,
            packet,
            1,
            packet_id_offset,
            RetryState::none(),
            Notify::None,
        )
    }

    #[test]
    fn complete_is_idempotent() {
        let operation = op(None);
        operation.complete(Status::Success);
        operation.complete(Status::NetworkError);
        assert_eq!(operation.status(), Status::Success);
    }

    #[test]
    fn rewrite_packet_id_writes_through_offset() {
        let operation = op(Some(2));
        operation.rewrite_packet_id();
        let bytes = operation.packet_bytes();
        assert_eq!(&bytes[2..4], &operation.packet_id.to_be_bytes());
    }

    #[test]
    fn retry_state_doubles_and_caps_at_ceiling() {
        let mut retry = RetryState {
            limit: 5,
            count: 0,
            next_period_ms: 100,
        };
        retry.advance(350);
        assert_eq!(retry.next_period_ms, 200);
        retry.advance(350);
        assert_eq!(retry.next_period_ms, 350);
        retry.advance(350);
        assert_eq!(retry.next_period_ms, 350);
        assert_eq!(retry.count, 3);
    }
}
