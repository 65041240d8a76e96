//! Per-class handle caches
//!
//! A `ClassCache` resolves its class and methods once, on first use, and
//! keeps the class pinned with a durable global reference. Initialization
//! runs under `OnceCell::get_or_try_init`: concurrent first users wait for a
//! single initializer instead of racing to fetch the metadata twice. A failed
//! initialization leaves the cache empty for the next caller to retry.

use crate::attach::BridgeId;
use crate::bridge::Bridge;
use crate::errors::{Result, UsageError};
use crate::foreign::{MemberKind, Method, RawRef};
use once_cell::sync::OnceCell;
use std::borrow::Cow;

/// Method to resolve when a class cache initializes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub kind: MemberKind,
}

impl MethodSpec {
    pub const fn instance(name: &'static str, signature: &'static str) -> Self {
        Self {
            name,
            signature,
            kind: MemberKind::Instance,
        }
    }

    pub const fn class_method(name: &'static str, signature: &'static str) -> Self {
        Self {
            name,
            signature,
            kind: MemberKind::Static,
        }
    }

    pub const fn constructor(signature: &'static str) -> Self {
        Self::instance("<init>", signature)
    }
}

/// Resolved class: pinned class reference plus methods in spec order
#[derive(Debug)]
pub struct ClassInfo {
    owner: BridgeId,
    class: RawRef,
    methods: Vec<Method>,
}

impl ClassInfo {
    /// Durable global reference to the class
    #[inline]
    pub fn class(&self) -> RawRef {
        self.class
    }

    /// Method at `index` of the cache's spec list
    #[inline]
    pub fn method(&self, index: usize) -> &Method {
        &self.methods[index]
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }
}

/// Lazily initialized class/method handles for one foreign class
pub struct ClassCache {
    name: Cow<'static, str>,
    methods: Cow<'static, [MethodSpec]>,
    cell: OnceCell<ClassInfo>,
}

impl ClassCache {
    /// Cache usable as a `static`
    pub const fn new(name: &'static str, methods: &'static [MethodSpec]) -> Self {
        Self {
            name: Cow::Borrowed(name),
            methods: Cow::Borrowed(methods),
            cell: OnceCell::new(),
        }
    }

    /// Cache for a class named at runtime
    pub fn owned(name: impl Into<String>, methods: Vec<MethodSpec>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            methods: Cow::Owned(methods),
            cell: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve on first use, then hand out the cached handles.
    ///
    /// A cache belongs to the bridge that initialized it; handles of one VM
    /// mean nothing to another.
    pub fn get(&self, bridge: &Bridge) -> Result<&ClassInfo> {
        let info = self.cell.get_or_try_init(|| self.load(bridge))?;
        if info.owner != bridge.id() {
            return Err(UsageError::ForeignCacheMismatch {
                class: self.name.to_string(),
            }
            .into());
        }
        Ok(info)
    }

    /// Cached handles if already initialized, without initializing
    pub fn loaded(&self) -> Option<&ClassInfo> {
        self.cell.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    // Stays off the ledger: keying an object needs the System cache
    fn load(&self, bridge: &Bridge) -> Result<ClassInfo> {
        let env = bridge.env()?;
        let env = env.as_ref();
        let class = bridge.find_class_local(env, &self.name)?;

        let pinned = self
            .methods
            .iter()
            .map(|spec| bridge.resolve_method(env, class, spec.name, spec.signature, spec.kind))
            .collect::<Result<Vec<_>>>()
            .and_then(|methods| {
                let global = env
                    .new_global_ref(class)
                    .ok_or(UsageError::InvalidReference { handle: class })?;
                Ok((global, methods))
            });
        env.delete_local_ref(class);

        let (class, methods) = pinned?;
        Ok(ClassInfo {
            owner: bridge.id(),
            class,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::foreign::sim::SimVm;
    use crate::foreign::{CallTarget, JValue};
    use std::sync::Arc;
    use std::thread;

    const HASH_CODE: &[MethodSpec] = &[MethodSpec::instance("hashCode", "()I")];

    static OBJECT: ClassCache = ClassCache::new("java/lang/Object", HASH_CODE);

    #[test]
    fn test_initializes_once() {
        let vm = SimVm::new();
        let bridge = Bridge::launch(&vm, BridgeConfig::default()).unwrap();
        let cache = ClassCache::new("java/lang/String", HASH_CODE);

        assert!(!cache.is_initialized());
        let first = cache.get(&bridge).unwrap().class();
        let lookups = vm.stats().find_class_calls;
        let second = cache.get(&bridge).unwrap().class();

        assert_eq!(first, second);
        assert_eq!(vm.stats().find_class_calls, lookups);
    }

    #[test]
    fn test_failed_init_is_retried() {
        let vm = SimVm::new();
        let bridge = Bridge::launch(&vm, BridgeConfig::default()).unwrap();
        let cache = ClassCache::owned("org/example/Late", vec![MethodSpec::constructor("()V")]);

        assert!(cache.get(&bridge).unwrap_err().foreign().is_some());
        assert!(!cache.is_initialized());

        vm.define_class("org/example/Late", "java/lang/Object");
        assert!(cache.get(&bridge).is_ok());
    }

    #[test]
    fn test_unknown_method_fails_init() {
        let vm = SimVm::new();
        let bridge = Bridge::launch(&vm, BridgeConfig::default()).unwrap();
        let cache = ClassCache::owned(
            "java/lang/Object",
            vec![MethodSpec::instance("noSuchMethod", "()V")],
        );

        let globals = vm.live_globals();
        assert!(cache.get(&bridge).is_err());
        assert!(!cache.is_initialized());
        assert_eq!(vm.live_globals(), globals);
        assert_eq!(vm.live_locals(), 0);
    }

    #[test]
    fn test_concurrent_first_use_resolves_once() {
        let vm = SimVm::new();
        let bridge = Bridge::launch(&vm, BridgeConfig::default()).unwrap();
        let cache = Arc::new(ClassCache::owned(
            "java/lang/Throwable",
            vec![MethodSpec::instance("getMessage", "()Ljava/lang/String;")],
        ));
        let globals_before = vm.stats().globals_created;

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let bridge = bridge.clone();
                let cache = cache.clone();
                thread::spawn(move || {
                    bridge.attach_current_thread(None, false).unwrap();
                    let class = cache.get(&bridge).unwrap().class();
                    bridge.detach_current_thread().unwrap();
                    class
                })
            })
            .collect();

        let classes: Vec<RawRef> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert!(classes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(vm.stats().globals_created - globals_before, 1);
    }

    #[test]
    fn test_cache_is_bound_to_its_bridge() {
        let first = Bridge::launch(&SimVm::new(), BridgeConfig::default()).unwrap();
        let second = Bridge::launch(&SimVm::new(), BridgeConfig::default()).unwrap();

        let info = OBJECT.get(&first).unwrap();
        let obj = first.new_string("x").unwrap();
        let hash = first
            .call(CallTarget::Instance(obj.raw()), info.method(0), &[])
            .unwrap();
        assert!(matches!(hash, JValue::Int(_)));

        let err = OBJECT.get(&second).unwrap_err();
        assert!(matches!(
            err,
            crate::errors::BridgeError::Usage(UsageError::ForeignCacheMismatch { .. })
        ));
    }
}
