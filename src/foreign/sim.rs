//! In-process foreign runtime
//!
//! `SimVm` keeps a small object heap with JNI reference semantics: local,
//! global and weak references are distinct handles onto one object, a
//! pending exception belongs to a thread, and every interface call is
//! counted. Classes carry methods implemented as Rust closures, so dispatch,
//! throwing and host callbacks can all be driven without a real VM.
//!
//! Misuse is recorded rather than crashing: deleting a reference twice,
//! calling in while an exception is pending, or calling from a thread that
//! is not attached each bump a counter in `SimStats`.

use super::{
    CallTarget, CarrierNatives, EnvRef, ForeignEnv, ForeignVm, JType, JValue, MemberKind, MethodId, RawRef,
    RefType, VmLauncher, STATUS_DETACHED, STATUS_ERR, STATUS_OK,
};
use crate::config::split_classpath;
use crate::errors::{BridgeError, HostErrorInfo};
use crate::logging::{debug, trace, warn};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Native implementation of a simulated method: `(env, this, args) -> result`
pub type MethodBody = Arc<dyn Fn(&SimEnv, Option<RawRef>, &[JValue]) -> JValue + Send + Sync>;

type ObjId = usize;

const FIRST_REF: usize = 0x1000;
const REF_STRIDE: usize = 0x10;

/// Counters describing everything the bridge asked of the VM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Interface calls made through any `SimEnv`
    pub contacts: usize,
    pub locals_created: usize,
    pub locals_deleted: usize,
    pub globals_created: usize,
    pub globals_deleted: usize,
    pub weaks_created: usize,
    pub weaks_deleted: usize,
    /// Deletes of a reference that was not live with the expected type
    pub invalid_deletes: usize,
    /// Regular interface calls issued while an exception was pending
    pub calls_with_pending: usize,
    /// Calls from a thread that is not attached, or through another thread's env
    pub unattached_calls: usize,
    pub describes: usize,
    pub throws: usize,
    pub find_class_calls: usize,
}

/// Simulated foreign VM; clones share one heap
#[derive(Clone)]
pub struct SimVm {
    state: Arc<SimState>,
}

/// Per-thread interface of a `SimVm`
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<SimState>,
    thread: ThreadId,
}

struct SimState {
    heap: Mutex<Heap>,
    attached: DashMap<ThreadId, AttachedThread>,
    attach_failure: AtomicI32,
}

struct AttachedThread {
    name: String,
    daemon: bool,
}

struct Heap {
    next_obj: ObjId,
    next_ref: usize,
    objects: HashMap<ObjId, SimObject>,
    refs: HashMap<usize, RefEntry>,
    classes: HashMap<String, ObjId>,
    class_class: ObjId,
    methods: Vec<SimMethod>,
    pending: HashMap<ThreadId, ObjId>,
    class_path: Vec<String>,
    /// The system loader refuses new entries
    class_path_locked: bool,
    /// What each carrier learned through its `getErrorInfo` native
    carrier_info: HashMap<ObjId, HostErrorInfo>,
    launch_options: Vec<String>,
    stats: SimStats,
}

struct SimObject {
    class: ObjId,
    value: SimValue,
    identity: i32,
}

enum SimValue {
    Plain,
    Str(String),
    Class(ClassDef),
    Throwable(Option<String>),
}

struct ClassDef {
    name: String,
    superclass: Option<ObjId>,
}

struct SimMethod {
    class: ObjId,
    name: String,
    signature: String,
    kind: MemberKind,
    body: MethodBody,
}

#[derive(Clone, Copy)]
struct RefEntry {
    object: ObjId,
    ty: RefType,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Regular,
    /// Calls the native interface allows while an exception is pending
    ExceptionSafe,
}

impl Heap {
    fn new() -> Self {
        Self {
            next_obj: 1,
            next_ref: FIRST_REF,
            objects: HashMap::new(),
            refs: HashMap::new(),
            classes: HashMap::new(),
            class_class: 0,
            methods: Vec::new(),
            pending: HashMap::new(),
            class_path: Vec::new(),
            class_path_locked: false,
            carrier_info: HashMap::new(),
            launch_options: Vec::new(),
            stats: SimStats::default(),
        }
    }

    fn alloc(&mut self, class: ObjId, value: SimValue) -> ObjId {
        let id = self.next_obj;
        self.next_obj += 1;
        let identity = ((id as u32).wrapping_mul(0x9E37_79B1) & 0x7fff_ffff) as i32;
        self.objects.insert(id, SimObject { class, value, identity });
        id
    }

    fn alloc_class(&mut self, name: &str, superclass: Option<ObjId>) -> ObjId {
        let def = ClassDef {
            name: name.to_string(),
            superclass,
        };
        let id = if self.class_class == 0 {
            // java/lang/Class is its own class
            let id = self.next_obj;
            self.class_class = id;
            self.alloc(id, SimValue::Class(def))
        } else {
            self.alloc(self.class_class, SimValue::Class(def))
        };
        self.classes.insert(name.to_string(), id);
        id
    }

    fn new_ref(&mut self, object: ObjId, ty: RefType) -> RawRef {
        let addr = self.next_ref;
        self.next_ref += REF_STRIDE;
        self.refs.insert(addr, RefEntry { object, ty });
        match ty {
            RefType::Local => self.stats.locals_created += 1,
            RefType::Global => self.stats.globals_created += 1,
            RefType::Weak => self.stats.weaks_created += 1,
        }
        RawRef::from_addr(addr).unwrap_or_else(|| unreachable!("reference addresses start above zero"))
    }

    fn delete_ref(&mut self, raw: RawRef, ty: RefType) {
        match self.refs.get(&raw.addr()) {
            Some(entry) if entry.ty == ty => {
                self.refs.remove(&raw.addr());
                match ty {
                    RefType::Local => self.stats.locals_deleted += 1,
                    RefType::Global => self.stats.globals_deleted += 1,
                    RefType::Weak => self.stats.weaks_deleted += 1,
                }
            }
            _ => {
                self.stats.invalid_deletes += 1;
                warn!(handle = %raw, kind = ?ty, "sim: delete of an invalid reference");
            }
        }
    }

    /// Object named by `raw`; `None` for invalid references and collected referents
    fn resolve(&self, raw: RawRef) -> Option<ObjId> {
        let entry = self.refs.get(&raw.addr())?;
        self.objects.contains_key(&entry.object).then_some(entry.object)
    }

    fn class_def(&self, class: ObjId) -> Option<&ClassDef> {
        match &self.objects.get(&class)?.value {
            SimValue::Class(def) => Some(def),
            _ => None,
        }
    }

    fn is_subclass(&self, mut class: ObjId, ancestor: ObjId) -> bool {
        loop {
            if class == ancestor {
                return true;
            }
            match self.class_def(class).and_then(|def| def.superclass) {
                Some(parent) => class = parent,
                None => return false,
            }
        }
    }

    fn find_method(&self, mut class: ObjId, name: &str, signature: &str) -> Option<usize> {
        loop {
            let found = self
                .methods
                .iter()
                .position(|m| m.class == class && m.name == name && m.signature == signature);
            if found.is_some() {
                return found;
            }
            class = self.class_def(class)?.superclass?;
        }
    }

    fn is_throwable_class(&self, class: ObjId) -> bool {
        self.classes
            .get("java/lang/Throwable")
            .map_or(false, |&throwable| self.is_subclass(class, throwable))
    }

    fn dotted_class_name(&self, class: ObjId) -> String {
        self.class_def(class)
            .map(|def| def.name.replace('/', "."))
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn describe(&self, obj: ObjId) -> String {
        let Some(object) = self.objects.get(&obj) else {
            return "null".to_string();
        };
        match &object.value {
            SimValue::Str(s) => s.clone(),
            SimValue::Class(def) => format!("class {}", def.name.replace('/', ".")),
            SimValue::Throwable(message) => {
                let class = self.dotted_class_name(object.class);
                match message {
                    Some(message) => format!("{}: {}", class, message),
                    None => class,
                }
            }
            SimValue::Plain => {
                format!("{}@{:x}", self.dotted_class_name(object.class), object.identity)
            }
        }
    }

    fn throw_new(&mut self, thread: ThreadId, class_name: &str, message: &str) {
        let class = match self.classes.get(class_name) {
            Some(&class) => class,
            None => self.classes["java/lang/Throwable"],
        };
        let obj = self.alloc(class, SimValue::Throwable(Some(message.to_string())));
        self.pending.insert(thread, obj);
        self.stats.throws += 1;
    }

    fn resolve_call(
        &self,
        target: CallTarget,
        method: MethodId,
    ) -> Result<(MethodBody, Option<RawRef>), (&'static str, String)> {
        let declared = self
            .methods
            .get(method.addr() - 1)
            .ok_or(("java/lang/NoSuchMethodError", format!("invalid method id {}", method.addr())))?;

        let (index, this) = match target {
            CallTarget::Static(_) => (method.addr() - 1, None),
            CallTarget::Instance(obj) => {
                let receiver = self.resolve(obj).ok_or((
                    "java/lang/NullPointerException",
                    format!("{} on a dead reference", declared.name),
                ))?;
                let class = self.objects[&receiver].class;
                let index = self
                    .find_method(class, &declared.name, &declared.signature)
                    .unwrap_or(method.addr() - 1);
                (index, Some(obj))
            }
            CallTarget::Nonvirtual { object, class } => {
                self.resolve(object).ok_or((
                    "java/lang/NullPointerException",
                    format!("{} on a dead reference", declared.name),
                ))?;
                let index = self
                    .resolve(class)
                    .and_then(|class| self.find_method(class, &declared.name, &declared.signature))
                    .unwrap_or(method.addr() - 1);
                (index, Some(object))
            }
        };

        Ok((self.methods[index].body.clone(), this))
    }
}

impl SimVm {
    pub fn new() -> Self {
        let vm = Self {
            state: Arc::new(SimState {
                heap: Mutex::new(Heap::new()),
                attached: DashMap::new(),
                attach_failure: AtomicI32::new(STATUS_OK),
            }),
        };
        vm.bootstrap();
        vm
    }

    fn bootstrap(&self) {
        {
            let mut heap = self.state.heap.lock();
            heap.alloc_class("java/lang/Class", None);
            let object = heap.alloc_class("java/lang/Object", None);
            let class = heap.class_class;
            if let Some(SimObject { value: SimValue::Class(def), .. }) = heap.objects.get_mut(&class) {
                def.superclass = Some(object);
            }
            heap.alloc_class("java/lang/String", Some(object));
            heap.alloc_class("java/lang/System", Some(object));
            let throwable = heap.alloc_class("java/lang/Throwable", Some(object));
            let exception = heap.alloc_class("java/lang/Exception", Some(throwable));
            let error = heap.alloc_class("java/lang/Error", Some(throwable));
            let runtime = heap.alloc_class("java/lang/RuntimeException", Some(exception));
            heap.alloc_class("java/lang/NullPointerException", Some(runtime));
            heap.alloc_class("java/lang/IllegalStateException", Some(runtime));
            heap.alloc_class("java/lang/NoClassDefFoundError", Some(error));
            heap.alloc_class("java/lang/NoSuchMethodError", Some(error));
        }

        let void_body = |_: &SimEnv, _: Option<RawRef>, _: &[JValue]| JValue::Void;
        self.define_method("java/lang/Object", "<init>", "()V", MemberKind::Instance, void_body);
        self.define_method(
            "java/lang/Object",
            "toString",
            "()Ljava/lang/String;",
            MemberKind::Instance,
            |env, this, _| env.builtin(|heap, thread| {
                let text = this.and_then(|r| heap.resolve(r)).map(|obj| heap.describe(obj));
                match text {
                    Some(text) => {
                        let class = heap.classes["java/lang/String"];
                        let obj = heap.alloc(class, SimValue::Str(text));
                        JValue::object(heap.new_ref(obj, RefType::Local))
                    }
                    None => {
                        heap.throw_new(thread, "java/lang/NullPointerException", "toString");
                        JValue::null()
                    }
                }
            }),
        );
        self.define_method("java/lang/Object", "hashCode", "()I", MemberKind::Instance, |env, this, _| {
            env.builtin(|heap, _| {
                let hash = this.and_then(|r| heap.resolve(r)).map_or(0, |obj| {
                    let object = &heap.objects[&obj];
                    match &object.value {
                        SimValue::Str(s) => java_string_hash(s),
                        _ => object.identity,
                    }
                });
                JValue::Int(hash)
            })
        });
        self.define_method(
            "java/lang/Object",
            "getClass",
            "()Ljava/lang/Class;",
            MemberKind::Instance,
            |env, this, _| env.builtin(|heap, _| {
                match this.and_then(|r| heap.resolve(r)) {
                    Some(obj) => {
                        let class = heap.objects[&obj].class;
                        JValue::object(heap.new_ref(class, RefType::Local))
                    }
                    None => JValue::null(),
                }
            }),
        );
        self.define_method(
            "java/lang/Object",
            "equals",
            "(Ljava/lang/Object;)Z",
            MemberKind::Instance,
            |env, this, args| env.builtin(|heap, _| {
                let a = this.and_then(|r| heap.resolve(r));
                let b = args.first().and_then(JValue::as_object).and_then(|r| heap.resolve(r));
                JValue::Boolean(a.is_some() && a == b)
            }),
        );
        self.define_method(
            "java/lang/Class",
            "getName",
            "()Ljava/lang/String;",
            MemberKind::Instance,
            |env, this, _| env.builtin(|heap, _| {
                match this.and_then(|r| heap.resolve(r)) {
                    Some(class) => {
                        let name = heap.dotted_class_name(class);
                        let string = heap.classes["java/lang/String"];
                        let obj = heap.alloc(string, SimValue::Str(name));
                        JValue::object(heap.new_ref(obj, RefType::Local))
                    }
                    None => JValue::null(),
                }
            }),
        );
        self.define_method(
            "java/lang/System",
            "identityHashCode",
            "(Ljava/lang/Object;)I",
            MemberKind::Static,
            |env, _, args| env.builtin(|heap, _| {
                let obj = args.first().and_then(JValue::as_object).and_then(|r| heap.resolve(r));
                JValue::Int(obj.map_or(0, |obj| heap.objects[&obj].identity))
            }),
        );
        self.define_method("java/lang/Throwable", "<init>", "()V", MemberKind::Instance, void_body);
        self.define_method(
            "java/lang/Throwable",
            "<init>",
            "(Ljava/lang/String;)V",
            MemberKind::Instance,
            |env, this, args| env.builtin(|heap, _| {
                let message = args
                    .first()
                    .and_then(JValue::as_object)
                    .and_then(|r| heap.resolve(r))
                    .and_then(|obj| match &heap.objects[&obj].value {
                        SimValue::Str(s) => Some(s.clone()),
                        _ => None,
                    });
                if let Some(obj) = this.and_then(|r| heap.resolve(r)) {
                    if let Some(object) = heap.objects.get_mut(&obj) {
                        object.value = SimValue::Throwable(message);
                    }
                }
                JValue::Void
            }),
        );
        self.define_method(
            "java/lang/Throwable",
            "getMessage",
            "()Ljava/lang/String;",
            MemberKind::Instance,
            |env, this, _| env.builtin(|heap, _| {
                let message = this
                    .and_then(|r| heap.resolve(r))
                    .and_then(|obj| match &heap.objects[&obj].value {
                        SimValue::Throwable(message) => message.clone(),
                        _ => None,
                    });
                match message {
                    Some(message) => {
                        let string = heap.classes["java/lang/String"];
                        let obj = heap.alloc(string, SimValue::Str(message));
                        JValue::object(heap.new_ref(obj, RefType::Local))
                    }
                    None => JValue::null(),
                }
            }),
        );
    }

    /// Define a class extending `superclass`; `false` if the superclass is
    /// unknown or the class already exists.
    pub fn define_class(&self, name: &str, superclass: &str) -> bool {
        let mut heap = self.state.heap.lock();
        if heap.classes.contains_key(name) {
            return false;
        }
        match heap.classes.get(superclass).copied() {
            Some(parent) => {
                heap.alloc_class(name, Some(parent));
                true
            }
            None => false,
        }
    }

    /// Attach a native body to `class`; `false` if the class is unknown.
    pub fn define_method<F>(
        &self,
        class: &str,
        name: &str,
        signature: &str,
        kind: MemberKind,
        body: F,
    ) -> bool
    where
        F: Fn(&SimEnv, Option<RawRef>, &[JValue]) -> JValue + Send + Sync + 'static,
    {
        let mut heap = self.state.heap.lock();
        let Some(&class) = heap.classes.get(class) else {
            return false;
        };
        heap.methods.push(SimMethod {
            class,
            name: name.to_string(),
            signature: signature.to_string(),
            kind,
            body: Arc::new(body),
        });
        true
    }

    /// Force the identity hash of the object behind `obj`
    pub fn set_identity_hash(&self, obj: RawRef, hash: i32) -> bool {
        let mut heap = self.state.heap.lock();
        match heap.resolve(obj) {
            Some(id) => {
                if let Some(object) = heap.objects.get_mut(&id) {
                    object.identity = hash;
                }
                true
            }
            None => false,
        }
    }

    /// Reclaim objects no strong reference reaches; returns how many died
    pub fn collect(&self) -> usize {
        let mut heap = self.state.heap.lock();
        let mut live: HashSet<ObjId> = heap
            .refs
            .values()
            .filter(|entry| entry.ty != RefType::Weak)
            .map(|entry| entry.object)
            .collect();
        live.extend(heap.classes.values().copied());
        live.extend(heap.pending.values().copied());

        let before = heap.objects.len();
        heap.objects.retain(|id, _| live.contains(id));
        let collected = before - heap.objects.len();
        debug!(collected, "sim: collection finished");
        collected
    }

    /// Refuse further classpath entries, like a system loader that is not a
    /// `URLClassLoader`
    pub fn lock_class_path(&self) {
        self.state.heap.lock().class_path_locked = true;
    }

    /// What the carrier behind `obj` learned through `getErrorInfo`
    pub fn carrier_error_info(&self, obj: RawRef) -> Option<HostErrorInfo> {
        let heap = self.state.heap.lock();
        let id = heap.resolve(obj)?;
        heap.carrier_info.get(&id).cloned()
    }

    /// Make the next attach fail with `status`
    pub fn fail_next_attach(&self, status: i32) {
        self.state.attach_failure.store(status, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SimStats {
        self.state.heap.lock().stats
    }

    /// Global references currently alive
    pub fn live_globals(&self) -> usize {
        self.count_refs(RefType::Global)
    }

    pub fn live_weaks(&self) -> usize {
        self.count_refs(RefType::Weak)
    }

    pub fn live_locals(&self) -> usize {
        self.count_refs(RefType::Local)
    }

    fn count_refs(&self, ty: RefType) -> usize {
        self.state.heap.lock().refs.values().filter(|e| e.ty == ty).count()
    }

    pub fn live_objects(&self) -> usize {
        self.state.heap.lock().objects.len()
    }

    pub fn class_path(&self) -> Vec<String> {
        self.state.heap.lock().class_path.clone()
    }

    pub fn launch_options(&self) -> Vec<String> {
        self.state.heap.lock().launch_options.clone()
    }

    pub fn is_attached(&self, thread: ThreadId) -> bool {
        self.state.attached.contains_key(&thread)
    }

    pub fn attached_count(&self) -> usize {
        self.state.attached.len()
    }

    pub fn is_daemon(&self, thread: ThreadId) -> Option<bool> {
        self.state.attached.get(&thread).map(|t| t.daemon)
    }

    pub fn has_pending_exception(&self, thread: ThreadId) -> bool {
        self.state.heap.lock().pending.contains_key(&thread)
    }
}

impl Default for SimVm {
    fn default() -> Self {
        Self::new()
    }
}

impl ForeignVm for SimVm {
    fn attach_current_thread(&self, name: Option<&str>, daemon: bool) -> Result<EnvRef, i32> {
        let failure = self.state.attach_failure.swap(STATUS_OK, Ordering::SeqCst);
        if failure != STATUS_OK {
            return Err(failure);
        }

        let thread = thread::current().id();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Thread-{}", self.state.attached.len()));
        trace!(thread = %name, daemon, "sim: thread attached");
        self.state.attached.insert(thread, AttachedThread { name, daemon });

        Ok(Rc::new(SimEnv {
            state: self.state.clone(),
            thread,
        }))
    }

    fn detach_current_thread(&self) -> i32 {
        let thread = thread::current().id();
        match self.state.attached.remove(&thread) {
            Some(_) => {
                self.state.heap.lock().pending.remove(&thread);
                STATUS_OK
            }
            None => STATUS_DETACHED,
        }
    }

    fn description(&self) -> String {
        format!("sim vm ({} threads attached)", self.state.attached.len())
    }
}

impl VmLauncher for SimVm {
    fn launch(&self, options: &[String]) -> Result<(Box<dyn ForeignVm>, EnvRef), BridgeError> {
        if let Some(bad) = options.iter().find(|o| !o.starts_with('-')) {
            return Err(BridgeError::Launch {
                status: STATUS_ERR,
                reason: format!("unrecognized option: {}", bad),
            });
        }

        {
            let mut heap = self.state.heap.lock();
            heap.launch_options = options.to_vec();
            for option in options {
                if let Some(path) = option.strip_prefix("-Djava.class.path=") {
                    heap.class_path.extend(split_classpath(path));
                }
            }
        }

        let env = self
            .attach_current_thread(Some("main"), false)
            .map_err(|status| BridgeError::Launch {
                status,
                reason: "could not attach the launching thread".to_string(),
            })?;
        Ok((Box::new(self.clone()), env))
    }
}

impl SimEnv {
    fn current(&self) -> ThreadId {
        thread::current().id()
    }

    fn enter(&self, access: Access) -> MutexGuard<'_, Heap> {
        let mut heap = self.state.heap.lock();
        let current = self.current();
        heap.stats.contacts += 1;
        if current != self.thread || !self.state.attached.contains_key(&current) {
            heap.stats.unattached_calls += 1;
        }
        if access == Access::Regular && heap.pending.contains_key(&current) {
            heap.stats.calls_with_pending += 1;
        }
        heap
    }

    /// Run VM-internal work for a builtin method body; not counted as a contact
    fn builtin<R>(&self, f: impl FnOnce(&mut Heap, ThreadId) -> R) -> R {
        let mut heap = self.state.heap.lock();
        f(&mut heap, self.current())
    }

    /// The VM this env belongs to
    pub fn vm(&self) -> SimVm {
        SimVm {
            state: self.state.clone(),
        }
    }

    /// Share this env as the per-thread interface type
    pub fn to_env_ref(&self) -> EnvRef {
        Rc::new(self.clone())
    }
}

impl ForeignEnv for SimEnv {
    fn ref_kind(&self, obj: RawRef) -> Option<RefType> {
        let heap = self.enter(Access::Regular);
        heap.refs.get(&obj.addr()).map(|entry| entry.ty)
    }

    fn is_same_object(&self, a: Option<RawRef>, b: Option<RawRef>) -> bool {
        let heap = self.enter(Access::Regular);
        let a = a.and_then(|r| heap.resolve(r));
        let b = b.and_then(|r| heap.resolve(r));
        a == b
    }

    fn new_local_ref(&self, obj: RawRef) -> Option<RawRef> {
        let mut heap = self.enter(Access::Regular);
        let id = heap.resolve(obj)?;
        Some(heap.new_ref(id, RefType::Local))
    }

    fn delete_local_ref(&self, obj: RawRef) {
        self.enter(Access::ExceptionSafe).delete_ref(obj, RefType::Local);
    }

    fn new_global_ref(&self, obj: RawRef) -> Option<RawRef> {
        let mut heap = self.enter(Access::Regular);
        let id = heap.resolve(obj)?;
        Some(heap.new_ref(id, RefType::Global))
    }

    fn delete_global_ref(&self, obj: RawRef) {
        self.enter(Access::ExceptionSafe).delete_ref(obj, RefType::Global);
    }

    fn new_weak_ref(&self, obj: RawRef) -> Option<RawRef> {
        let mut heap = self.enter(Access::Regular);
        let id = heap.resolve(obj)?;
        Some(heap.new_ref(id, RefType::Weak))
    }

    fn delete_weak_ref(&self, obj: RawRef) {
        self.enter(Access::ExceptionSafe).delete_ref(obj, RefType::Weak);
    }

    fn exception_occurred(&self) -> Option<RawRef> {
        let mut heap = self.enter(Access::ExceptionSafe);
        let current = self.current();
        let throwable = *heap.pending.get(&current)?;
        Some(heap.new_ref(throwable, RefType::Local))
    }

    fn exception_describe(&self) {
        let mut heap = self.enter(Access::ExceptionSafe);
        let current = self.current();
        heap.stats.describes += 1;
        // Describing clears the pending exception, as the native interface does
        if let Some(throwable) = heap.pending.remove(&current) {
            let thread = self
                .state
                .attached
                .get(&current)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "<unattached>".to_string());
            warn!(
                event = "exception_describe",
                thread = %thread,
                "Exception in thread \"{}\" {}",
                thread,
                heap.describe(throwable)
            );
        }
    }

    fn exception_clear(&self) {
        let mut heap = self.enter(Access::ExceptionSafe);
        let current = self.current();
        heap.pending.remove(&current);
    }

    fn throw(&self, throwable: RawRef) -> i32 {
        let mut heap = self.enter(Access::Regular);
        match heap.resolve(throwable) {
            Some(obj) if heap.is_throwable_class(heap.objects[&obj].class) => {
                let current = self.current();
                heap.pending.insert(current, obj);
                heap.stats.throws += 1;
                STATUS_OK
            }
            _ => STATUS_ERR,
        }
    }

    fn throw_new(&self, class: RawRef, message: &str) -> i32 {
        let mut heap = self.enter(Access::Regular);
        match heap.resolve(class) {
            Some(class) if heap.is_throwable_class(class) => {
                let obj = heap.alloc(class, SimValue::Throwable(Some(message.to_string())));
                let current = self.current();
                heap.pending.insert(current, obj);
                heap.stats.throws += 1;
                STATUS_OK
            }
            _ => STATUS_ERR,
        }
    }

    fn find_class(&self, name: &str) -> Option<RawRef> {
        let mut heap = self.enter(Access::Regular);
        heap.stats.find_class_calls += 1;
        match heap.classes.get(name).copied() {
            Some(class) => Some(heap.new_ref(class, RefType::Local)),
            None => {
                let current = self.current();
                heap.throw_new(current, "java/lang/NoClassDefFoundError", name);
                None
            }
        }
    }

    fn object_class(&self, obj: RawRef) -> Option<RawRef> {
        let mut heap = self.enter(Access::Regular);
        let id = heap.resolve(obj)?;
        let class = heap.objects[&id].class;
        Some(heap.new_ref(class, RefType::Local))
    }

    fn is_instance_of(&self, obj: RawRef, class: RawRef) -> bool {
        let heap = self.enter(Access::Regular);
        match (heap.resolve(obj), heap.resolve(class)) {
            (Some(obj), Some(class)) => heap.is_subclass(heap.objects[&obj].class, class),
            _ => false,
        }
    }

    fn method_id(
        &self,
        class: RawRef,
        name: &str,
        signature: &str,
        kind: MemberKind,
    ) -> Option<MethodId> {
        let mut heap = self.enter(Access::Regular);
        let found = heap
            .resolve(class)
            .and_then(|class| heap.find_method(class, name, signature))
            .filter(|&index| heap.methods[index].kind == kind);
        match found {
            Some(index) => MethodId::from_addr(index + 1),
            None => {
                let current = self.current();
                heap.throw_new(current, "java/lang/NoSuchMethodError", name);
                None
            }
        }
    }

    fn call(&self, target: CallTarget, method: MethodId, args: &[JValue], ret: JType) -> JValue {
        let (body, this) = {
            let mut heap = self.enter(Access::Regular);
            match heap.resolve_call(target, method) {
                Ok(resolved) => resolved,
                Err((class, message)) => {
                    let current = self.current();
                    heap.throw_new(current, class, &message);
                    return ret.zero();
                }
            }
        };

        let result = body(self, this, args);

        let heap = self.state.heap.lock();
        if heap.pending.contains_key(&self.current()) || result.ty() != ret {
            ret.zero()
        } else {
            result
        }
    }

    fn new_object(&self, class: RawRef, ctor: MethodId, args: &[JValue]) -> Option<RawRef> {
        let (this, body) = {
            let mut heap = self.enter(Access::Regular);
            let current = self.current();
            let Some(class) = heap.resolve(class) else {
                heap.throw_new(current, "java/lang/NullPointerException", "new_object");
                return None;
            };
            let body = match heap.methods.get(ctor.addr() - 1) {
                Some(m) if m.name == "<init>" => m.body.clone(),
                _ => {
                    heap.throw_new(current, "java/lang/NoSuchMethodError", "<init>");
                    return None;
                }
            };
            let value = if heap.is_throwable_class(class) {
                SimValue::Throwable(None)
            } else if heap.classes.get("java/lang/String") == Some(&class) {
                SimValue::Str(String::new())
            } else {
                SimValue::Plain
            };
            let obj = heap.alloc(class, value);
            (heap.new_ref(obj, RefType::Local), body)
        };

        body(self, Some(this), args);

        let mut heap = self.state.heap.lock();
        if heap.pending.contains_key(&self.current()) {
            heap.refs.remove(&this.addr());
            return None;
        }
        Some(this)
    }

    fn new_string(&self, value: &str) -> Option<RawRef> {
        let mut heap = self.enter(Access::Regular);
        let class = heap.classes["java/lang/String"];
        let obj = heap.alloc(class, SimValue::Str(value.to_string()));
        Some(heap.new_ref(obj, RefType::Local))
    }

    fn string_value(&self, string: RawRef) -> Option<String> {
        let heap = self.enter(Access::Regular);
        let obj = heap.resolve(string)?;
        match &heap.objects[&obj].value {
            SimValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn append_class_path(&self, entry: &str) -> bool {
        let mut heap = self.enter(Access::Regular);
        if heap.class_path_locked {
            return false;
        }
        heap.class_path.push(entry.to_string());
        true
    }

    fn register_carrier_natives(&self, class: RawRef, natives: Arc<dyn CarrierNatives>) -> bool {
        let mut heap = self.enter(Access::Regular);
        let Some(class) = heap.resolve(class) else {
            return false;
        };

        let info = natives.clone();
        let get_error_info: MethodBody = Arc::new(move |env: &SimEnv, this: Option<RawRef>, _: &[JValue]| {
            if let (Some(info), Some(this)) = (info.error_info(), this) {
                env.builtin(|heap, _| {
                    if let Some(obj) = heap.resolve(this) {
                        heap.carrier_info.insert(obj, info);
                    }
                });
            }
            JValue::Void
        });
        let clear: MethodBody = Arc::new(move |env: &SimEnv, _: Option<RawRef>, _: &[JValue]| {
            natives.clear(env);
            JValue::Void
        });

        for (name, body) in [("getErrorInfo", get_error_info), ("clear", clear)] {
            heap.methods.push(SimMethod {
                class,
                name: name.to_string(),
                signature: "()V".to_string(),
                kind: MemberKind::Instance,
                body,
            });
        }
        true
    }
}

fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached() -> (SimVm, EnvRef) {
        let vm = SimVm::new();
        let env = vm.attach_current_thread(Some("test"), false).unwrap();
        (vm, env)
    }

    fn new_plain_object(env: &EnvRef) -> RawRef {
        let class = env.find_class("java/lang/Object").unwrap();
        let ctor = env.method_id(class, "<init>", "()V", MemberKind::Instance).unwrap();
        env.new_object(class, ctor, &[]).unwrap()
    }

    #[test]
    fn test_local_and_global_refs_differ_but_are_same_object() {
        let (vm, env) = attached();
        let local = new_plain_object(&env);
        let global = env.new_global_ref(local).unwrap();

        assert_ne!(local, global);
        assert!(env.is_same_object(Some(local), Some(global)));
        assert_eq!(env.ref_kind(local), Some(RefType::Local));
        assert_eq!(env.ref_kind(global), Some(RefType::Global));

        env.delete_global_ref(global);
        env.delete_global_ref(global);
        assert_eq!(vm.stats().invalid_deletes, 1);
    }

    #[test]
    fn test_weak_ref_goes_stale_after_collection() {
        let (vm, env) = attached();
        let local = new_plain_object(&env);
        let weak = env.new_weak_ref(local).unwrap();

        assert!(!env.is_same_object(Some(weak), None));
        env.delete_local_ref(local);
        assert_eq!(vm.collect(), 1);
        assert!(env.is_same_object(Some(weak), None));
    }

    #[test]
    fn test_pending_exception_is_tracked() {
        let (vm, env) = attached();
        assert!(env.find_class("does/not/Exist").is_none());
        assert!(vm.has_pending_exception(thread::current().id()));

        // A regular call while pending is recorded as misuse
        env.new_string("x");
        assert_eq!(vm.stats().calls_with_pending, 1);

        let throwable = env.exception_occurred().unwrap();
        env.exception_clear();
        assert!(!vm.has_pending_exception(thread::current().id()));
        env.delete_local_ref(throwable);
        assert_eq!(vm.stats().calls_with_pending, 1);
    }

    #[test]
    fn test_builtin_methods() {
        let (_vm, env) = attached();
        let obj = new_plain_object(&env);
        let object = env.find_class("java/lang/Object").unwrap();
        let get_class = env
            .method_id(object, "getClass", "()Ljava/lang/Class;", MemberKind::Instance)
            .unwrap();
        let class = env
            .call(CallTarget::Instance(obj), get_class, &[], JType::Object)
            .as_object()
            .unwrap();

        let class_class = env.find_class("java/lang/Class").unwrap();
        let get_name = env
            .method_id(class_class, "getName", "()Ljava/lang/String;", MemberKind::Instance)
            .unwrap();
        let name = env
            .call(CallTarget::Instance(class), get_name, &[], JType::Object)
            .as_object()
            .unwrap();
        assert_eq!(env.string_value(name).as_deref(), Some("java.lang.Object"));
    }

    #[test]
    fn test_unattached_use_is_recorded() {
        let (vm, env) = attached();
        assert_eq!(vm.detach_current_thread(), STATUS_OK);
        assert_eq!(vm.detach_current_thread(), STATUS_DETACHED);
        env.new_string("late");
        assert_eq!(vm.stats().unattached_calls, 1);
    }

    #[test]
    fn test_launch_rejects_unrecognized_options() {
        let vm = SimVm::new();
        assert!(vm.launch(&["bogus".to_string()]).is_err());
        let (_, _env) = vm.launch(&["-Xmx64m".to_string()]).unwrap();
        assert_eq!(vm.launch_options(), vec!["-Xmx64m".to_string()]);
    }
}
