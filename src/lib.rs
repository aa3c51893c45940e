//! mqtt-runtime - an MQTT v3.1.1 client connection runtime over a pluggable
//! transport.
//!
//! Drives a single broker connection: handshake, keep-alive, QoS 1
//! publish/retry, subscribe/unsubscribe dispatch, and clean shutdown.

pub mod allocator;
pub mod api;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod topic;
pub mod transport;

pub use allocator::{BufferAllocator, FixedPoolAllocator, HeapAllocator};
pub use config::{ClientConfig, RuntimeConfig};
pub use connection::{
    Completion, Connection, OperationHandle, OperationType, RestoredSubscription,
    SerializerOverrides, SubscribeCallback, CLEANUP_ONLY, WAITABLE,
};
pub use error::{Error, Status};
pub use pool::{JobHandle, Pool, TokioPool};
pub use protocol::QoS;
pub use runtime::Runtime;
pub use transport::{Connector, TcpConnector, Transport};
