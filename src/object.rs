//! Owned counted reference to a foreign object

use crate::bridge::Bridge;
use crate::errors::Result;
use crate::foreign::{JValue, RawRef};
use crate::handle::{Handle, IdentityKey};
use crate::logging::warn;
use std::fmt;

/// Counted global reference released through the ledger on drop
///
/// Several `ForeignObject`s may share one durable reference; the ledger
/// deletes it with the last of them. Dropping on a thread that is not
/// attached cannot reach the foreign runtime, so the reference is leaked
/// and logged instead.
pub struct ForeignObject {
    bridge: Bridge,
    handle: Handle,
    /// Ownership handed back to the caller; drop releases nothing
    detached: bool,
}

impl ForeignObject {
    pub(crate) fn from_counted(bridge: Bridge, handle: Handle) -> Self {
        Self {
            bridge,
            handle,
            detached: false,
        }
    }

    #[inline]
    pub fn raw(&self) -> RawRef {
        self.handle.raw()
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn key(&self) -> IdentityKey {
        self.handle.key().unwrap_or(IdentityKey(0))
    }

    /// As a call argument
    #[inline]
    pub fn as_value(&self) -> JValue {
        JValue::object(self.raw())
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Another owner of the same durable reference
    pub fn try_clone(&self) -> Result<ForeignObject> {
        self.bridge.acquire_counted(self.handle)
    }

    /// Same foreign object
    pub fn is_same(&self, other: &ForeignObject) -> Result<bool> {
        self.bridge.is_same_object(self.raw(), other.raw())
    }

    /// `toString()` of the object
    pub fn to_foreign_string(&self) -> Result<String> {
        self.bridge.to_string(self.raw())
    }

    pub fn class_name(&self) -> Result<String> {
        self.bridge.class_name(self.raw())
    }

    pub fn hash_code(&self) -> Result<i32> {
        self.bridge.hash_code(self.raw())
    }

    /// Give up ownership without releasing; the caller must release the
    /// counted handle through the ledger.
    pub fn into_handle(mut self) -> Handle {
        self.detached = true;
        self.handle
    }
}

impl Drop for ForeignObject {
    fn drop(&mut self) {
        if self.detached || !self.bridge.is_running() {
            return;
        }
        if !self.bridge.is_current_thread_attached() {
            warn!(
                handle = %self.handle.raw(),
                key = %self.key(),
                "foreign object dropped on an unattached thread; reference leaked"
            );
            return;
        }
        self.bridge.release(self.handle);
    }
}

impl fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignObject")
            .field("handle", &self.handle.raw())
            .field("key", &self.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::bridge::Bridge;
    use crate::config::BridgeConfig;
    use crate::foreign::sim::SimVm;

    #[test]
    fn test_into_handle_keeps_the_entry() {
        let vm = SimVm::new();
        let bridge = Bridge::launch(&vm, BridgeConfig::default()).unwrap();
        let globals = vm.live_globals();

        let handle = bridge.new_string("kept").unwrap().into_handle();
        assert_eq!(bridge.ledger().len(), 1);
        assert_eq!(vm.live_globals(), globals + 1);

        bridge.release(handle);
        assert!(bridge.ledger().is_empty());
        assert_eq!(vm.live_globals(), globals);
        assert_eq!(bridge.consistency_errors(), 0);
    }
}
