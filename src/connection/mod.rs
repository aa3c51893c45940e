//! The per-connection runtime: subscription table, operation records, the
//! scheduler glue that drives them, and the connection handle itself.

mod core;
pub mod operation;
pub mod packet_id;
mod scheduler;
pub mod serializer;
pub mod subscription;

pub use core::{Connection, OperationHandle, RestoredSubscription};
pub use operation::{
    Completion, Notify, Operation, OperationType, RetryState, CLEANUP_ONLY, WAITABLE,
};
pub use packet_id::PacketIdAllocator;
pub use serializer::SerializerOverrides;
pub use subscription::{SubscribeCallback, Subscription, SubscriptionTable};
