//! Bridge handle
//!
//! `Bridge` ties one running foreign VM to the ledger, the thread
//! attachments, the exception bridge and the interpreter lock. Every entry
//! point follows the same order:
//! 1. Refuse with a usage error if the VM is stopped or the thread detached
//! 2. Issue the foreign call
//! 3. Run the exception check before the result is used
//!
//! Clones share one bridge.

use crate::attach::{BridgeId, ThreadAttachments};
use crate::classes::{ClassCache, MethodSpec};
use crate::config::{split_classpath, BridgeConfig};
use crate::errors::{
    BridgeError, CallError, ForeignException, HostError, HostErrorInfo, LedgerConsistencyError,
    Result, UsageError,
};
use crate::exception::{ExceptionBridge, Outcome};
use crate::foreign::{
    CallTarget, CarrierNatives, EnvRef, ForeignEnv, ForeignVm, JValue, MemberKind, Method, RawRef,
    Signature, VmLauncher,
};
use crate::gil::{BlockingGuard, CallbackGuard, InterpreterLock, NoHostLock};
use crate::handle::{Handle, IdentityKey, RefKind};
use crate::ledger::RefLedger;
use crate::logging::{
    debug, info, log_foreign_exception, log_ledger_consistency, log_vm_launch, warn,
};
use crate::object::ForeignObject;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const OBJECT_METHODS: &[MethodSpec] = &[
    MethodSpec::instance("toString", "()Ljava/lang/String;"),
    MethodSpec::instance("hashCode", "()I"),
    MethodSpec::instance("getClass", "()Ljava/lang/Class;"),
];
const TO_STRING: usize = 0;
const HASH_CODE: usize = 1;
const GET_CLASS: usize = 2;

const CLASS_METHODS: &[MethodSpec] = &[MethodSpec::instance("getName", "()Ljava/lang/String;")];
const GET_NAME: usize = 0;

const SYSTEM_METHODS: &[MethodSpec] = &[MethodSpec::class_method(
    "identityHashCode",
    "(Ljava/lang/Object;)I",
)];
const IDENTITY_HASH: usize = 0;

const THROWABLE_METHODS: &[MethodSpec] =
    &[MethodSpec::instance("getMessage", "()Ljava/lang/String;")];
const GET_MESSAGE: usize = 0;

const CARRIER_CTOR: usize = 0;

/// Classes the bridge itself calls into
struct CoreClasses {
    object: ClassCache,
    class: ClassCache,
    system: ClassCache,
    throwable: ClassCache,
    carrier: ClassCache,
}

impl CoreClasses {
    fn new(carrier_class: &str) -> Self {
        Self {
            object: ClassCache::new("java/lang/Object", OBJECT_METHODS),
            class: ClassCache::new("java/lang/Class", CLASS_METHODS),
            system: ClassCache::new("java/lang/System", SYSTEM_METHODS),
            throwable: ClassCache::new("java/lang/Throwable", THROWABLE_METHODS),
            carrier: ClassCache::owned(
                carrier_class,
                vec![MethodSpec::constructor("(Ljava/lang/String;)V")],
            ),
        }
    }

    fn all(&self) -> [&ClassCache; 5] {
        [
            &self.object,
            &self.class,
            &self.system,
            &self.throwable,
            &self.carrier,
        ]
    }
}

struct BridgeInner {
    id: BridgeId,
    vm: Box<dyn ForeignVm>,
    ledger: RefLedger,
    exceptions: Arc<ExceptionBridge>,
    attachments: ThreadAttachments,
    host_lock: Box<dyn InterpreterLock>,
    core: CoreClasses,
    config: BridgeConfig,
    consistency_errors: AtomicUsize,
    running: AtomicBool,
}

/// Handle to a running foreign VM
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

/// Diagnostic view of the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RefDump {
    /// Entry count per foreign class name
    ByClass(BTreeMap<String, usize>),
    /// `(toString(), owner count)` per entry
    ByValue(Vec<(String, usize)>),
    /// `(identity key, owner count)` per entry
    ByKey(Vec<(IdentityKey, usize)>),
}

impl Bridge {
    /// Start a VM for a host without an interpreter lock
    pub fn launch(launcher: &dyn VmLauncher, config: BridgeConfig) -> Result<Self> {
        Self::launch_with_lock(launcher, config, Box::new(NoHostLock))
    }

    /// Start a VM; the launching thread comes back attached
    pub fn launch_with_lock(
        launcher: &dyn VmLauncher,
        config: BridgeConfig,
        host_lock: Box<dyn InterpreterLock>,
    ) -> Result<Self> {
        let options = config.vm.render()?;
        let (vm, env) = launcher.launch(&options)?;
        log_vm_launch(&vm.description(), &options);

        let id = BridgeId::next();
        let bridge = Self {
            inner: Arc::new(BridgeInner {
                id,
                vm,
                ledger: RefLedger::new(),
                exceptions: Arc::new(ExceptionBridge::new(id, config.describe_exceptions)),
                attachments: ThreadAttachments::new(id),
                host_lock,
                core: CoreClasses::new(&config.carrier_class),
                config,
                consistency_errors: AtomicUsize::new(0),
                running: AtomicBool::new(true),
            }),
        };
        bridge.inner.attachments.store(env);

        if let Err(err) = bridge.load_core().and_then(|()| bridge.install_carrier_natives()) {
            bridge.inner.running.store(false, Ordering::SeqCst);
            bridge.inner.attachments.forget();
            return Err(err);
        }
        Ok(bridge)
    }

    fn load_core(&self) -> Result<()> {
        for cache in self.inner.core.all() {
            cache.get(self)?;
        }
        Ok(())
    }

    fn install_carrier_natives(&self) -> Result<()> {
        if self.inner.config.register_carrier_natives {
            self.register_carrier_natives()?;
        }
        Ok(())
    }

    /// Bind the carrier class's `getErrorInfo()V` and `clear()V` natives to
    /// this bridge, so foreign code that catches a carrier can inspect and
    /// forget the host error it stands for
    pub fn register_carrier_natives(&self) -> Result<bool> {
        let env = self.env()?;
        let carrier = self.inner.core.carrier.get(self)?;
        let natives: Arc<dyn CarrierNatives> = self.inner.exceptions.clone();

        let registered = env.register_carrier_natives(carrier.class(), natives);
        self.check(env.as_ref())?;
        if registered {
            debug!(class = %self.inner.config.carrier_class, "carrier natives registered");
        } else {
            warn!(class = %self.inner.config.carrier_class, "carrier natives not registered");
        }
        Ok(registered)
    }

    pub fn id(&self) -> BridgeId {
        self.inner.id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn description(&self) -> String {
        self.inner.vm.description()
    }

    /// Both values refer to the same bridge
    pub fn ptr_eq(&self, other: &Bridge) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The ledger, for diagnostics
    pub fn ledger(&self) -> &RefLedger {
        &self.inner.ledger
    }

    /// Active host-level handlers across all threads
    pub fn handler_depth(&self) -> usize {
        self.inner.exceptions.handlers().current()
    }

    /// Ledger consistency errors reported so far
    pub fn consistency_errors(&self) -> usize {
        self.inner.consistency_errors.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Thread attachment
    // ========================================================================

    fn ensure_running(&self) -> std::result::Result<(), UsageError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(UsageError::VmNotStarted)
        }
    }

    /// The calling thread's env; the gate in front of every foreign call
    pub fn env(&self) -> Result<EnvRef> {
        self.ensure_running()?;
        Ok(self.inner.attachments.require()?)
    }

    /// Attach the calling thread; returns the foreign runtime's status code
    pub fn attach_current_thread(&self, name: Option<&str>, daemon: bool) -> Result<i32> {
        self.ensure_running()?;
        Ok(self.inner.attachments.attach(self.inner.vm.as_ref(), name, daemon))
    }

    /// Detach the calling thread; a host error whose carrier foreign code
    /// swallowed is dropped first, while its references can still be released
    pub fn detach_current_thread(&self) -> Result<i32> {
        self.ensure_running()?;
        if let Some(env) = self.inner.attachments.current() {
            if self.inner.exceptions.clear_pending_host_error(env.as_ref()) {
                debug!("host error in flight dropped on detach");
            }
        }
        Ok(self.inner.attachments.detach(self.inner.vm.as_ref()))
    }

    pub fn is_current_thread_attached(&self) -> bool {
        self.is_running() && self.inner.attachments.is_attached()
    }

    // ========================================================================
    // Exception checks
    // ========================================================================

    /// Run the exception check for the calling thread
    pub fn check_exception(&self) -> Result<()> {
        let env = self.env()?;
        self.check(env.as_ref())
    }

    fn check(&self, env: &dyn ForeignEnv) -> Result<()> {
        match self.inner.exceptions.check(env) {
            Outcome::Clear => Ok(()),
            Outcome::HostError(error) => Err(BridgeError::HostRoundTrip(error)),
            Outcome::Foreign(throwable) => Err(self.foreign_exception(env, throwable).into()),
        }
    }

    fn foreign_exception(&self, env: &dyn ForeignEnv, local: RawRef) -> ForeignException {
        let class_name = self.probe_class_name(env, local);
        let message = self.probe_message(env, local);
        let key = self.probe_identity(env, local).unwrap_or(IdentityKey(0));

        let throwable = self
            .inner
            .ledger
            .acquire(env, Handle::local(local), key)
            .map(|handle| ForeignObject::from_counted(self.clone(), handle));
        if throwable.is_none() {
            env.delete_local_ref(local);
        }

        log_foreign_exception(class_name.as_deref(), message.as_deref());
        ForeignException::new(throwable, class_name, message)
    }

    /// Best-effort call made while building an error; anything it raises is
    /// swallowed so error construction never recurses.
    fn probe(&self, env: &dyn ForeignEnv, f: impl FnOnce(&dyn ForeignEnv) -> JValue) -> Option<JValue> {
        let value = f(env);
        match env.exception_occurred() {
            Some(thrown) => {
                env.exception_clear();
                env.delete_local_ref(thrown);
                None
            }
            None => Some(value),
        }
    }

    fn probe_call(
        &self,
        env: &dyn ForeignEnv,
        cache: &ClassCache,
        index: usize,
        target: CallTarget,
        args: &[JValue],
    ) -> Option<JValue> {
        let method = cache.loaded()?.method(index);
        self.probe(env, |env| env.call(target, method.id, args, method.signature.ret))
    }

    fn probe_class_name(&self, env: &dyn ForeignEnv, obj: RawRef) -> Option<String> {
        let core = &self.inner.core;
        let class = self
            .probe_call(env, &core.object, GET_CLASS, CallTarget::Instance(obj), &[])?
            .as_object()?;
        let name = self.probe_call(env, &core.class, GET_NAME, CallTarget::Instance(class), &[]);
        env.delete_local_ref(class);
        take_string(env, name?.as_object()?)
    }

    fn probe_message(&self, env: &dyn ForeignEnv, throwable: RawRef) -> Option<String> {
        let core = &self.inner.core;
        let message = self
            .probe_call(env, &core.throwable, GET_MESSAGE, CallTarget::Instance(throwable), &[])?
            .as_object()?;
        take_string(env, message)
    }

    fn probe_identity(&self, env: &dyn ForeignEnv, obj: RawRef) -> Option<IdentityKey> {
        let system = self.inner.core.system.loaded()?;
        self.probe_call(
            env,
            &self.inner.core.system,
            IDENTITY_HASH,
            CallTarget::Static(system.class()),
            &[JValue::object(obj)],
        )?
        .as_int()
        .map(IdentityKey)
    }

    // ========================================================================
    // Classes and calls
    // ========================================================================

    pub(crate) fn find_class_local(&self, env: &dyn ForeignEnv, name: &str) -> Result<RawRef> {
        let class = env.find_class(name);
        self.check(env)?;
        class.ok_or_else(|| {
            CallError::UnknownClass {
                class: name.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn resolve_method(
        &self,
        env: &dyn ForeignEnv,
        class: RawRef,
        name: &str,
        signature: &str,
        kind: MemberKind,
    ) -> Result<Method> {
        let parsed = Signature::parse(signature)?;
        let id = env.method_id(class, name, signature, kind);
        self.check(env)?;

        let id = id.ok_or_else(|| CallError::UnknownMethod {
            class: self.class_display(env, class),
            name: name.to_string(),
            signature: signature.to_string(),
        })?;
        Ok(Method {
            id,
            kind,
            name: name.to_string(),
            signature: parsed,
        })
    }

    fn class_display(&self, env: &dyn ForeignEnv, class: RawRef) -> String {
        self.probe_call(env, &self.inner.core.class, GET_NAME, CallTarget::Instance(class), &[])
            .and_then(|name| name.as_object())
            .and_then(|name| take_string(env, name))
            .unwrap_or_else(|| class.to_string())
    }

    /// Look a class up by its internal name, e.g. `java/util/ArrayList`
    pub fn find_class(&self, name: &str) -> Result<ForeignObject> {
        let env = self.env()?;
        let class = self.find_class_local(env.as_ref(), name)?;
        self.wrap_local_in(env.as_ref(), class)
    }

    /// Resolve a method of `class`; the signature is parsed up front
    pub fn method(
        &self,
        class: RawRef,
        name: &str,
        signature: &str,
        kind: MemberKind,
    ) -> Result<Method> {
        let env = self.env()?;
        self.resolve_method(env.as_ref(), class, name, signature, kind)
    }

    /// Invoke `method`. Object results are local references; see `call_object`.
    pub fn call(&self, target: CallTarget, method: &Method, args: &[JValue]) -> Result<JValue> {
        let env = self.env()?;
        method.validate(&target, args)?;
        self.dispatch(env.as_ref(), target, method, args)
    }

    /// Invoke `method` with the host lock released; counts as an active
    /// host-level handler for the duration.
    pub fn call_blocking(
        &self,
        target: CallTarget,
        method: &Method,
        args: &[JValue],
    ) -> Result<JValue> {
        let env = self.env()?;
        method.validate(&target, args)?;
        let _unlocked = BlockingGuard::new(
            self.inner.host_lock.as_ref(),
            self.inner.exceptions.handlers(),
        );
        self.dispatch(env.as_ref(), target, method, args)
    }

    /// Invoke an object-returning method and take ownership of the result
    pub fn call_object(
        &self,
        target: CallTarget,
        method: &Method,
        args: &[JValue],
    ) -> Result<Option<ForeignObject>> {
        match self.call(target, method, args)?.as_object() {
            Some(local) => self.wrap_local(local).map(Some),
            None => Ok(None),
        }
    }

    fn dispatch(
        &self,
        env: &dyn ForeignEnv,
        target: CallTarget,
        method: &Method,
        args: &[JValue],
    ) -> Result<JValue> {
        let value = env.call(target, method.id, args, method.signature.ret);
        self.check(env)?;
        Ok(value)
    }

    /// Construct an instance of `class` through `ctor`
    pub fn new_object(&self, class: RawRef, ctor: &Method, args: &[JValue]) -> Result<ForeignObject> {
        let env = self.env()?;
        if ctor.name != "<init>" {
            return Err(CallError::TargetMismatch {
                method: ctor.name.clone(),
                expected: MemberKind::Instance,
            }
            .into());
        }
        ctor.validate(&CallTarget::Instance(class), args)?;

        let obj = env.new_object(class, ctor.id, args);
        self.check(env.as_ref())?;
        let obj = obj.ok_or(UsageError::InvalidReference { handle: class })?;
        self.wrap_local_in(env.as_ref(), obj)
    }

    /// Foreign copy of `value`; interior NULs are refused before any contact
    pub fn new_string(&self, value: &str) -> Result<ForeignObject> {
        let env = self.env()?;
        if value.contains('\0') {
            return Err(CallError::InvalidString {
                reason: "value contains a NUL character",
            }
            .into());
        }
        let string = env.new_string(value);
        self.check(env.as_ref())?;
        let string = string.ok_or(CallError::InvalidString {
            reason: "rejected by the foreign runtime",
        })?;
        self.wrap_local_in(env.as_ref(), string)
    }

    /// Contents of a foreign string; `None` if `string` is not one
    pub fn string_value(&self, string: RawRef) -> Result<Option<String>> {
        let env = self.env()?;
        let value = env.string_value(string);
        self.check(env.as_ref())?;
        Ok(value)
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Take ownership of a local reference as a counted object
    pub fn wrap_local(&self, local: RawRef) -> Result<ForeignObject> {
        let env = self.env()?;
        self.wrap_local_in(env.as_ref(), local)
    }

    fn wrap_local_in(&self, env: &dyn ForeignEnv, local: RawRef) -> Result<ForeignObject> {
        let key = match self.identity_key_in(env, local) {
            Ok(key) => key,
            Err(err) => {
                env.delete_local_ref(local);
                return Err(err);
            }
        };
        self.acquire_in(env, Handle::local(local), key)
    }

    /// Counted object for any reference; a local reference is consumed
    pub fn acquire(&self, raw: RawRef) -> Result<ForeignObject> {
        let env = self.env()?;
        let handle = Handle::infer(env.as_ref(), raw)
            .ok_or(UsageError::InvalidReference { handle: raw })?;
        let key = self.identity_key_in(env.as_ref(), raw)?;
        self.acquire_in(env.as_ref(), handle, key)
    }

    /// One more owner of an already counted handle
    pub(crate) fn acquire_counted(&self, handle: Handle) -> Result<ForeignObject> {
        let env = self.env()?;
        let key = match handle.key() {
            Some(key) if handle.kind() == RefKind::Counted => key,
            _ => self.identity_key_in(env.as_ref(), handle.raw())?,
        };
        self.acquire_in(env.as_ref(), handle, key)
    }

    fn acquire_in(&self, env: &dyn ForeignEnv, handle: Handle, key: IdentityKey) -> Result<ForeignObject> {
        let counted = self
            .inner
            .ledger
            .acquire(env, handle, key)
            .ok_or(UsageError::InvalidReference {
                handle: handle.raw(),
            })?;
        Ok(ForeignObject::from_counted(self.clone(), counted))
    }

    /// Release a handle by kind; counted handles go through the ledger.
    ///
    /// A consistency error is reported, never returned.
    pub fn release(&self, handle: Handle) {
        let env = match self.env() {
            Ok(env) => env,
            Err(err) => {
                warn!(handle = %handle.raw(), error = %err, "release skipped");
                return;
            }
        };
        if let Err(err) = handle.release(env.as_ref(), &self.inner.ledger) {
            self.report(err);
        }
    }

    fn report(&self, err: LedgerConsistencyError) {
        self.inner.consistency_errors.fetch_add(1, Ordering::Relaxed);
        log_ledger_consistency(err.key, err.handle);
    }

    /// Durable global reference outside the ledger
    pub fn new_global_ref(&self, obj: RawRef) -> Result<Handle> {
        let env = self.env()?;
        Handle::local(obj)
            .promote(env.as_ref())
            .ok_or_else(|| UsageError::InvalidReference { handle: obj }.into())
    }

    pub fn delete_global_ref(&self, handle: Handle) -> Result<()> {
        let env = self.env()?;
        env.delete_global_ref(handle.raw());
        Ok(())
    }

    pub fn new_weak_ref(&self, obj: RawRef) -> Result<Handle> {
        let env = self.env()?;
        self.inner
            .ledger
            .acquire_weak(env.as_ref(), obj)
            .ok_or_else(|| UsageError::InvalidReference { handle: obj }.into())
    }

    pub fn delete_weak_ref(&self, handle: Handle) -> Result<()> {
        let env = self.env()?;
        self.inner.ledger.release_weak(env.as_ref(), handle.raw());
        Ok(())
    }

    pub fn is_same_object(&self, a: RawRef, b: RawRef) -> Result<bool> {
        let env = self.env()?;
        Ok(a == b || env.is_same_object(Some(a), Some(b)))
    }

    // ========================================================================
    // Object helpers
    // ========================================================================

    /// Ledger key of an object: its foreign identity hash
    pub fn identity_key(&self, obj: RawRef) -> Result<IdentityKey> {
        let env = self.env()?;
        self.identity_key_in(env.as_ref(), obj)
    }

    fn identity_key_in(&self, env: &dyn ForeignEnv, obj: RawRef) -> Result<IdentityKey> {
        let system = self.inner.core.system.get(self)?;
        let hash = self.dispatch(
            env,
            CallTarget::Static(system.class()),
            system.method(IDENTITY_HASH),
            &[JValue::object(obj)],
        )?;
        Ok(IdentityKey(hash.as_int().unwrap_or(0)))
    }

    pub fn hash_code(&self, obj: RawRef) -> Result<i32> {
        let env = self.env()?;
        let object = self.inner.core.object.get(self)?;
        let hash = self.dispatch(env.as_ref(), CallTarget::Instance(obj), object.method(HASH_CODE), &[])?;
        Ok(hash.as_int().unwrap_or(0))
    }

    /// `toString()` of the object; `"null"` when it returns null
    pub fn to_string(&self, obj: RawRef) -> Result<String> {
        let env = self.env()?;
        self.to_string_in(env.as_ref(), obj)
    }

    fn to_string_in(&self, env: &dyn ForeignEnv, obj: RawRef) -> Result<String> {
        let object = self.inner.core.object.get(self)?;
        let text = self.dispatch(env, CallTarget::Instance(obj), object.method(TO_STRING), &[])?;
        Ok(text
            .as_object()
            .and_then(|text| take_string(env, text))
            .unwrap_or_else(|| "null".to_string()))
    }

    /// Dotted class name of the object, e.g. `java.lang.String`
    pub fn class_name(&self, obj: RawRef) -> Result<String> {
        let env = self.env()?;
        self.class_name_in(env.as_ref(), obj)
    }

    fn class_name_in(&self, env: &dyn ForeignEnv, obj: RawRef) -> Result<String> {
        let object = self.inner.core.object.get(self)?;
        let class_info = self.inner.core.class.get(self)?;

        let class = self.dispatch(env, CallTarget::Instance(obj), object.method(GET_CLASS), &[])?;
        let Some(class) = class.as_object() else {
            return Ok("null".to_string());
        };
        let name = self.dispatch(env, CallTarget::Instance(class), class_info.method(GET_NAME), &[]);
        env.delete_local_ref(class);
        Ok(name?
            .as_object()
            .and_then(|name| take_string(env, name))
            .unwrap_or_default())
    }

    /// Make every entry of a path-separated classpath visible to the
    /// running VM's system class loader
    pub fn append_class_path(&self, classpath: &str) -> Result<()> {
        let env = self.env()?;
        for entry in split_classpath(classpath) {
            let added = env.append_class_path(&entry);
            self.check(env.as_ref())?;
            if added {
                debug!(entry = %entry, "classpath entry appended");
            } else {
                warn!(entry = %entry, "classpath entry not appended");
            }
        }
        Ok(())
    }

    /// Snapshot of the ledger by class name, by value, or by identity key
    pub fn dump_refs(&self, by_class: bool, by_value: bool) -> Result<RefDump> {
        let env = self.env()?;
        let env = env.as_ref();

        if !by_class && !by_value {
            let entries = self.inner.ledger.snapshot();
            return Ok(RefDump::ByKey(
                entries.into_iter().map(|e| (e.key, e.count)).collect(),
            ));
        }

        let mut dump = if by_class {
            RefDump::ByClass(BTreeMap::new())
        } else {
            RefDump::ByValue(Vec::new())
        };
        let mut failure = None;

        for (entry, local) in self.inner.ledger.snapshot_locals(env) {
            let Some(local) = local else {
                continue;
            };
            if failure.is_none() {
                let described = match &mut dump {
                    RefDump::ByClass(counts) => self.class_name_in(env, local).map(|name| {
                        *counts.entry(name).or_insert(0) += 1;
                    }),
                    RefDump::ByValue(values) => self
                        .to_string_in(env, local)
                        .map(|text| values.push((text, entry.count))),
                    RefDump::ByKey(_) => Ok(()),
                };
                failure = described.err();
            }
            env.delete_local_ref(local);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(dump),
        }
    }

    // ========================================================================
    // Host errors and callbacks
    // ========================================================================

    /// Raise `error` into the foreign runtime inside the carrier throwable.
    ///
    /// Returns whether the carrier is pending. When it comes back to a host
    /// call site, the exception check restores this very error.
    pub fn throw_host_error(&self, env: &dyn ForeignEnv, error: HostError) -> bool {
        let Some(carrier) = self.inner.core.carrier.loaded() else {
            warn!(error = %error, "carrier class not loaded; host error dropped");
            return false;
        };
        self.inner.exceptions.raise_host_error(
            env,
            carrier.class(),
            carrier.method(CARRIER_CTOR).id,
            error,
        )
    }

    /// The host error in flight on this thread, as foreign code may see it
    pub fn pending_host_error_info(&self) -> Option<HostErrorInfo> {
        self.inner.exceptions.pending_host_error_info()
    }

    pub fn clear_pending_host_error(&self) -> Result<bool> {
        let env = self.env()?;
        Ok(self.inner.exceptions.clear_pending_host_error(env.as_ref()))
    }

    /// Run host code for a foreign thread.
    ///
    /// Takes the host lock, uses `env` as the thread's attachment for the
    /// duration, and turns an `Err` into a pending carrier throwable. Returns
    /// `None` in that case; the foreign caller sees the exception.
    pub fn callback<T, F>(&self, env: EnvRef, f: F) -> Option<T>
    where
        F: FnOnce(&Bridge) -> std::result::Result<T, HostError>,
    {
        let _locked = CallbackGuard::new(self.inner.host_lock.as_ref());
        let _adopted = self.inner.attachments.adopt(env.clone());
        match f(self) {
            Ok(value) => Some(value),
            Err(error) => {
                self.throw_host_error(env.as_ref(), error);
                None
            }
        }
    }

    /// Drop a host value on behalf of a foreign finalizer thread
    pub fn finalize_host_object<T>(&self, env: EnvRef, value: T) {
        let _locked = CallbackGuard::new(self.inner.host_lock.as_ref());
        let _adopted = self.inner.attachments.adopt(env);
        drop(value);
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Delete every durable reference the bridge holds and stop it.
    ///
    /// Returns the number of ledger references deleted. Every entry point
    /// reports `VmNotStarted` afterwards.
    pub fn shutdown(&self) -> Result<usize> {
        let env = self.env()?;
        let env = env.as_ref();

        let deleted = self.inner.ledger.drain(env);
        for cache in self.inner.core.all() {
            if let Some(info) = cache.loaded() {
                env.delete_global_ref(info.class());
            }
        }
        self.inner.exceptions.clear_pending_host_error(env);

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.attachments.forget();
        info!(deleted, "bridge shut down");
        Ok(deleted)
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .field("ledger_entries", &self.inner.ledger.len())
            .finish()
    }
}

/// Read a foreign string and delete the local reference to it
fn take_string(env: &dyn ForeignEnv, local: RawRef) -> Option<String> {
    let value = env.string_value(local);
    env.delete_local_ref(local);
    value
}

/// Host hash rendered as eight lowercase hex digits
pub fn strhash(hash: i64) -> String {
    format!("{:08x}", hash as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::sim::SimVm;

    fn launch() -> (SimVm, Bridge) {
        let vm = SimVm::new();
        let bridge = Bridge::launch(&vm, BridgeConfig::default()).unwrap();
        (vm, bridge)
    }

    #[test]
    fn test_strhash() {
        assert_eq!(strhash(0), "00000000");
        assert_eq!(strhash(0x2a), "0000002a");
        assert_eq!(strhash(-1), "ffffffff");
        assert_eq!(strhash(0x1_2345_6789), "23456789");
    }

    #[test]
    fn test_launch_attaches_and_loads_core() {
        let (vm, bridge) = launch();
        assert!(bridge.is_current_thread_attached());
        assert!(bridge.ledger().is_empty());
        // One pinned class per core cache
        assert_eq!(vm.live_globals(), 5);
        assert_eq!(vm.live_locals(), 0);
    }

    #[test]
    fn test_bad_carrier_class_fails_launch() {
        let vm = SimVm::new();
        let config = BridgeConfig {
            carrier_class: "org/example/Missing".to_string(),
            ..BridgeConfig::default()
        };
        let err = Bridge::launch(&vm, config).unwrap_err();
        assert!(err.foreign().is_some());
    }

    #[test]
    fn test_object_helpers() {
        let (_vm, bridge) = launch();
        let s = bridge.new_string("hello").unwrap();

        assert_eq!(s.class_name().unwrap(), "java.lang.String");
        assert_eq!(s.to_foreign_string().unwrap(), "hello");
        assert_eq!(bridge.string_value(s.raw()).unwrap().as_deref(), Some("hello"));
        // String.hashCode of "hello"
        assert_eq!(s.hash_code().unwrap(), 99162322);
    }

    #[test]
    fn test_try_clone_shares_the_global() {
        let (vm, bridge) = launch();
        let a = bridge.new_string("x").unwrap();
        let b = a.try_clone().unwrap();

        assert_eq!(a.raw(), b.raw());
        assert_eq!(bridge.ledger().count_for(&*bridge.env().unwrap(), a.raw(), a.key()), 2);
        let globals = vm.live_globals();
        drop(a);
        assert_eq!(vm.live_globals(), globals);
        drop(b);
        assert_eq!(vm.live_globals(), globals - 1);
    }

    #[test]
    fn test_call_validation_happens_before_contact() {
        let (vm, bridge) = launch();
        let class = bridge.find_class("java/lang/Object").unwrap();
        let hash = bridge
            .method(class.raw(), "hashCode", "()I", MemberKind::Instance)
            .unwrap();
        let obj = bridge.new_string("x").unwrap();

        let before = vm.stats().contacts;
        let err = bridge
            .call(CallTarget::Instance(obj.raw()), &hash, &[JValue::Int(1)])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Call(CallError::ArgCountMismatch { .. })));
        assert_eq!(vm.stats().contacts, before);
    }

    #[test]
    fn test_nul_in_string_is_refused_before_contact() {
        let (vm, bridge) = launch();
        let before = vm.stats().contacts;

        let err = bridge.new_string("a\0b").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Call(CallError::InvalidString { .. })
        ));
        assert_eq!(vm.stats().contacts, before);
        assert!(bridge.ledger().is_empty());
    }

    #[test]
    fn test_unknown_method_is_a_foreign_error() {
        let (vm, bridge) = launch();
        let class = bridge.find_class("java/lang/Object").unwrap();
        let err = bridge
            .method(class.raw(), "missing", "()V", MemberKind::Instance)
            .unwrap_err();

        let foreign = err.foreign().unwrap();
        assert_eq!(foreign.class_name(), Some("java.lang.NoSuchMethodError"));
        assert_eq!(foreign.message(), Some("missing"));
        assert_eq!(vm.stats().calls_with_pending, 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (vm, bridge) = launch();
        let kept = bridge.new_string("kept").unwrap();
        let _other = bridge.new_string("other").unwrap();

        assert_eq!(bridge.shutdown().unwrap(), 2);
        assert_eq!(vm.live_globals(), 0);
        assert!(!bridge.is_running());
        assert!(matches!(
            bridge.new_string("late").unwrap_err(),
            BridgeError::Usage(UsageError::VmNotStarted)
        ));

        // Dropping after shutdown touches nothing
        let deletes = vm.stats().globals_deleted;
        drop(kept);
        assert_eq!(vm.stats().globals_deleted, deletes);
        assert_eq!(vm.stats().invalid_deletes, 0);
    }
}
