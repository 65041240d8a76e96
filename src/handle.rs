//! Handles to foreign objects
//!
//! A `Handle` is one raw reference plus the kind that decides how it is
//! released. Identity comparison always goes through the foreign runtime's
//! same-object primitive, never through the raw value.

use crate::errors::LedgerConsistencyError;
use crate::foreign::{ForeignEnv, RawRef, RefType};
use crate::ledger::{RefLedger, ReleaseOutcome};
use serde::Serialize;
use std::fmt;

/// Stable host-side key for deduplicating counted handles
///
/// The foreign identity hash of the object. Distinct objects may share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IdentityKey(pub i32);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0 as u32)
    }
}

impl From<i32> for IdentityKey {
    fn from(hash: i32) -> Self {
        Self(hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Valid for the current native frame only
    Local,
    /// Pinned until explicitly deleted; not deduplicated
    Global,
    /// Pinned and owned by the ledger
    Counted,
    /// Not pinned; the referent may already be gone
    Weak,
}

impl From<RefType> for RefKind {
    fn from(ty: RefType) -> Self {
        match ty {
            RefType::Local => Self::Local,
            RefType::Global => Self::Global,
            RefType::Weak => Self::Weak,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    raw: RawRef,
    kind: RefKind,
    /// Ledger key, set for counted handles only
    key: Option<IdentityKey>,
}

impl Handle {
    pub const fn local(raw: RawRef) -> Self {
        Self {
            raw,
            kind: RefKind::Local,
            key: None,
        }
    }

    pub const fn global(raw: RawRef) -> Self {
        Self {
            raw,
            kind: RefKind::Global,
            key: None,
        }
    }

    pub const fn weak(raw: RawRef) -> Self {
        Self {
            raw,
            kind: RefKind::Weak,
            key: None,
        }
    }

    /// Only the ledger hands these out
    pub(crate) const fn counted(raw: RawRef, key: IdentityKey) -> Self {
        Self {
            raw,
            kind: RefKind::Counted,
            key: Some(key),
        }
    }

    /// Wrap a raw reference, asking the foreign runtime what kind it is.
    ///
    /// Never yields `Counted`; that kind comes from the ledger alone.
    pub fn infer(env: &dyn ForeignEnv, raw: RawRef) -> Option<Self> {
        let kind = env.ref_kind(raw)?;
        Some(Self {
            raw,
            kind: kind.into(),
            key: None,
        })
    }

    #[inline]
    pub const fn raw(&self) -> RawRef {
        self.raw
    }

    #[inline]
    pub const fn kind(&self) -> RefKind {
        self.kind
    }

    #[inline]
    pub const fn key(&self) -> Option<IdentityKey> {
        self.key
    }

    /// Same foreign object, whatever the representation of either handle
    pub fn is_same(&self, env: &dyn ForeignEnv, other: &Handle) -> bool {
        self.raw == other.raw || env.is_same_object(Some(self.raw), Some(other.raw))
    }

    /// Whether the referent of a weak handle has been collected.
    ///
    /// Pinned handles are never stale.
    pub fn is_stale(&self, env: &dyn ForeignEnv) -> bool {
        self.kind == RefKind::Weak && env.is_same_object(Some(self.raw), None)
    }

    /// Pin the referent with a new durable global reference
    pub fn promote(&self, env: &dyn ForeignEnv) -> Option<Handle> {
        env.new_global_ref(self.raw).map(Handle::global)
    }

    /// Release according to kind.
    ///
    /// Counted handles go back through the ledger, so a handle shared by
    /// several owners is deleted only with its last owner.
    pub fn release(
        self,
        env: &dyn ForeignEnv,
        ledger: &RefLedger,
    ) -> Result<(), LedgerConsistencyError> {
        match self.kind {
            RefKind::Local => env.delete_local_ref(self.raw),
            RefKind::Global => env.delete_global_ref(self.raw),
            RefKind::Weak => ledger.release_weak(env, self.raw),
            RefKind::Counted => {
                let key = self.key.unwrap_or(IdentityKey(0));
                let _: ReleaseOutcome = ledger.release(env, self.raw, key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::sim::SimVm;
    use crate::foreign::{ForeignVm, MemberKind};

    #[test]
    fn test_identity_key_display() {
        assert_eq!(IdentityKey(42).to_string(), "0000002a");
        assert_eq!(IdentityKey(-1).to_string(), "ffffffff");
    }

    #[test]
    fn test_infer_and_identity() {
        let vm = SimVm::new();
        let env = vm.attach_current_thread(None, false).unwrap();
        let s = env.new_string("hello").unwrap();
        let g = env.new_global_ref(s).unwrap();

        let local = Handle::infer(env.as_ref(), s).unwrap();
        let global = Handle::infer(env.as_ref(), g).unwrap();
        assert_eq!(local.kind(), RefKind::Local);
        assert_eq!(global.kind(), RefKind::Global);
        assert_ne!(local.raw(), global.raw());
        assert!(local.is_same(env.as_ref(), &global));

        let other = Handle::local(env.new_string("hello").unwrap());
        assert!(!local.is_same(env.as_ref(), &other));
    }

    #[test]
    fn test_weak_staleness() {
        let vm = SimVm::new();
        let env = vm.attach_current_thread(None, false).unwrap();
        let class = env.find_class("java/lang/Object").unwrap();
        let ctor = env.method_id(class, "<init>", "()V", MemberKind::Instance).unwrap();
        let obj = env.new_object(class, ctor, &[]).unwrap();

        let weak = Handle::weak(env.new_weak_ref(obj).unwrap());
        assert!(!weak.is_stale(env.as_ref()));
        assert!(!Handle::local(obj).is_stale(env.as_ref()));

        env.delete_local_ref(obj);
        vm.collect();
        assert!(weak.is_stale(env.as_ref()));
    }

    #[test]
    fn test_release_by_kind() {
        let vm = SimVm::new();
        let env = vm.attach_current_thread(None, false).unwrap();
        let ledger = RefLedger::new();
        let s = env.new_string("x").unwrap();

        let global = Handle::local(s).promote(env.as_ref()).unwrap();
        let weak = Handle::weak(env.new_weak_ref(s).unwrap());
        global.release(env.as_ref(), &ledger).unwrap();
        weak.release(env.as_ref(), &ledger).unwrap();
        Handle::local(s).release(env.as_ref(), &ledger).unwrap();

        let stats = vm.stats();
        assert_eq!(stats.globals_deleted, 1);
        assert_eq!(stats.weaks_deleted, 1);
        assert_eq!(stats.invalid_deletes, 0);
        assert_eq!(vm.live_locals(), 0);
    }
}
