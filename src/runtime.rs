//! One-time process-wide setup for the serializer-override module.
//!
//! The connection runtime otherwise has no global state: configuration is
//! per-process-call (`RuntimeConfig::load`) and every other piece of state
//! lives on a `Connection`. The one exception is serializer overrides
//! (`connection::operation::SerializerOverrides`): installing one is a
//! process-wide capability that needs a single init/cleanup pair around it,
//! mirrored here as an explicit value with construction and drop semantics
//! rather than a bare global flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// A handle over the serializer-override module's process-wide state.
/// Acquiring it is idempotent — every caller in the process gets the same
/// instance. The actual gate a connection checks before honoring a
/// per-connection override vtable is `RuntimeConfig::enable_serializer_overrides`;
/// this type only marks that the module has been initialized at least once,
/// for diagnostics that want to know whether any connection in the process
/// has ever turned overrides on.
pub struct Runtime {
    _private: (),
}

impl Runtime {
    /// Returns the process-wide instance, performing one-time init on first
    /// call.
    pub fn get() -> &'static Runtime {
        static INSTANCE: OnceLock<Runtime> = OnceLock::new();
        INSTANCE.get_or_init(Self::init)
    }

    fn init() -> Self {
        ACTIVE.store(true, Ordering::Release);
        tracing::debug!("serializer-override runtime initialized");
        Self { _private: () }
    }

    /// Whether the runtime has been initialized in this process.
    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
        tracing::debug!("serializer-override runtime torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_activates_runtime() {
        let runtime = Runtime::get();
        assert!(Runtime::is_active());
        assert!(std::ptr::eq(runtime, Runtime::get()));
    }
}
