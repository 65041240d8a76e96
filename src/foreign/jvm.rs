//! JNI backend
//!
//! Loads `libjvm` at runtime with `libloading` and drives it through the raw
//! `jni-sys` function tables. Nothing here checks pending exceptions; the
//! exception bridge does that after every call.

use super::{
    CallTarget, CarrierNatives, EnvRef, ForeignEnv, ForeignVm, JType, JValue, MemberKind,
    MethodId, RawRef, RefType, VmLauncher, STATUS_ERR, STATUS_OK,
};
use crate::errors::BridgeError;
use crate::logging::debug;
use jni_sys::{
    jboolean, jint, jmethodID, jobject, jobjectRefType, jvalue, JNIEnv, JNINativeMethod, JavaVM,
    JavaVMAttachArgs, JavaVMInitArgs, JavaVMOption, JNI_FALSE, JNI_TRUE, JNI_VERSION_1_8,
};
use libloading::Library;
use parking_lot::RwLock;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

/// Locals the classpath append may create before its frame is popped
const LOCAL_FRAME_CAPACITY: jint = 16;

type CreateJavaVm = unsafe extern "system" fn(*mut *mut JavaVM, *mut *mut c_void, *mut c_void) -> jint;

/// Invoke a JNI function through the env's function table.
macro_rules! jni {
    ($env:expr, $name:ident $(, $arg:expr)*) => {{
        let env: *mut JNIEnv = $env;
        match (**env).$name {
            Some(f) => f(env $(, $arg)*),
            None => unreachable!(concat!("JNI function table lacks ", stringify!($name))),
        }
    }};
}

/// Invoke a function of the JNI invocation interface.
macro_rules! jvm {
    ($vm:expr, $name:ident $(, $arg:expr)*) => {{
        let vm: *mut JavaVM = $vm;
        match (**vm).$name {
            Some(f) => f(vm $(, $arg)*),
            None => unreachable!(concat!("JNI invocation table lacks ", stringify!($name))),
        }
    }};
}

/// Dispatch on the expected result type across one family of `Call*MethodA`.
macro_rules! typed_call {
    ($env:expr, $ret:expr,
     [$object:ident, $boolean:ident, $byte:ident, $char:ident, $short:ident,
      $int:ident, $long:ident, $float:ident, $double:ident, $void:ident],
     ($($arg:expr),*)) => {
        match $ret {
            JType::Object => JValue::Object(RawRef::from_ptr(jni!($env, $object $(, $arg)*))),
            JType::Boolean => JValue::Boolean(jni!($env, $boolean $(, $arg)*) != JNI_FALSE),
            JType::Byte => JValue::Byte(jni!($env, $byte $(, $arg)*)),
            JType::Char => JValue::Char(jni!($env, $char $(, $arg)*)),
            JType::Short => JValue::Short(jni!($env, $short $(, $arg)*)),
            JType::Int => JValue::Int(jni!($env, $int $(, $arg)*)),
            JType::Long => JValue::Long(jni!($env, $long $(, $arg)*)),
            JType::Float => JValue::Float(jni!($env, $float $(, $arg)*)),
            JType::Double => JValue::Double(jni!($env, $double $(, $arg)*)),
            JType::Void => {
                jni!($env, $void $(, $arg)*);
                JValue::Void
            }
        }
    };
}

/// Launches a JVM from a dynamically loaded `libjvm`
pub struct JvmLauncher {
    library: Option<PathBuf>,
}

impl JvmLauncher {
    /// Locate `libjvm` under `JAVA_HOME` at launch time
    pub fn new() -> Self {
        Self { library: None }
    }

    /// Use an explicit `libjvm` path
    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library: Some(path.into()),
        }
    }

    fn candidate_paths(java_home: &Path) -> Vec<PathBuf> {
        let name = if cfg!(target_os = "windows") {
            "jvm.dll"
        } else if cfg!(target_os = "macos") {
            "libjvm.dylib"
        } else {
            "libjvm.so"
        };

        let dirs: &[&str] = if cfg!(target_os = "windows") {
            &["bin/server", "jre/bin/server", "bin/client"]
        } else {
            &["lib/server", "jre/lib/server", "lib/amd64/server", "jre/lib/amd64/server"]
        };

        dirs.iter().map(|dir| java_home.join(dir).join(name)).collect()
    }

    fn resolve_library(&self) -> Result<PathBuf, BridgeError> {
        if let Some(path) = &self.library {
            return Ok(path.clone());
        }

        let java_home = std::env::var_os("JAVA_HOME").ok_or_else(|| BridgeError::Launch {
            status: STATUS_ERR,
            reason: "JAVA_HOME is not set and no libjvm path was given".to_string(),
        })?;

        Self::candidate_paths(Path::new(&java_home))
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| BridgeError::Launch {
                status: STATUS_ERR,
                reason: format!("no libjvm found under {}", Path::new(&java_home).display()),
            })
    }
}

impl Default for JvmLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl VmLauncher for JvmLauncher {
    fn launch(&self, options: &[String]) -> Result<(Box<dyn ForeignVm>, EnvRef), BridgeError> {
        let path = self.resolve_library()?;
        let launch_error = |reason: String| BridgeError::Launch {
            status: STATUS_ERR,
            reason,
        };

        let library = unsafe { Library::new(&path) }
            .map_err(|e| launch_error(format!("failed to load {}: {}", path.display(), e)))?;
        let create: CreateJavaVm = unsafe {
            *library
                .get::<CreateJavaVm>(b"JNI_CreateJavaVM\0")
                .map_err(|e| launch_error(format!("JNI_CreateJavaVM not found: {}", e)))?
        };

        let strings = options
            .iter()
            .map(|o| CString::new(o.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| launch_error(format!("invalid option: {}", e)))?;
        let mut jni_options: Vec<JavaVMOption> = strings
            .iter()
            .map(|s| JavaVMOption {
                optionString: s.as_ptr() as *mut c_char,
                extraInfo: ptr::null_mut(),
            })
            .collect();

        let mut args = JavaVMInitArgs {
            version: JNI_VERSION_1_8,
            nOptions: jni_options.len() as jint,
            options: jni_options.as_mut_ptr(),
            ignoreUnrecognized: JNI_FALSE,
        };

        let mut vm: *mut JavaVM = ptr::null_mut();
        let mut env: *mut c_void = ptr::null_mut();
        let status = unsafe { create(&mut vm, &mut env, &mut args as *mut _ as *mut c_void) };
        if status != STATUS_OK || vm.is_null() || env.is_null() {
            return Err(BridgeError::Launch {
                status,
                reason: "JNI_CreateJavaVM failed".to_string(),
            });
        }

        debug!(library = %path.display(), "libjvm loaded");
        let vm = JvmVm {
            vm,
            _library: Arc::new(library),
        };
        let env: EnvRef = Rc::new(JvmEnv {
            env: env as *mut JNIEnv,
        });
        Ok((Box::new(vm), env))
    }
}

/// Running JVM
pub struct JvmVm {
    vm: *mut JavaVM,
    /// Keeps `libjvm` mapped for as long as the VM is reachable
    _library: Arc<Library>,
}

// The invocation interface is callable from any thread.
unsafe impl Send for JvmVm {}
unsafe impl Sync for JvmVm {}

impl ForeignVm for JvmVm {
    fn attach_current_thread(&self, name: Option<&str>, daemon: bool) -> Result<EnvRef, i32> {
        let name = name.map(CString::new).transpose().map_err(|_| STATUS_ERR)?;
        let mut args = JavaVMAttachArgs {
            version: JNI_VERSION_1_8,
            name: name.as_ref().map_or(ptr::null_mut(), |n| n.as_ptr() as *mut c_char),
            group: ptr::null_mut(),
        };
        let mut env: *mut c_void = ptr::null_mut();
        let args_ptr = &mut args as *mut _ as *mut c_void;

        let status = unsafe {
            if daemon {
                jvm!(self.vm, AttachCurrentThreadAsDaemon, &mut env, args_ptr)
            } else {
                jvm!(self.vm, AttachCurrentThread, &mut env, args_ptr)
            }
        };

        if status != STATUS_OK || env.is_null() {
            return Err(status);
        }
        Ok(Rc::new(JvmEnv {
            env: env as *mut JNIEnv,
        }))
    }

    fn detach_current_thread(&self) -> i32 {
        unsafe { jvm!(self.vm, DetachCurrentThread) }
    }

    fn description(&self) -> String {
        format!("JVM at {:p}", self.vm)
    }
}

/// One thread's `JNIEnv`
pub struct JvmEnv {
    env: *mut JNIEnv,
}

impl JvmEnv {
    fn obj(raw: RawRef) -> jobject {
        raw.as_ptr()
    }

    fn opt(raw: Option<RawRef>) -> jobject {
        raw.map_or(ptr::null_mut(), RawRef::as_ptr)
    }

    fn mid(method: MethodId) -> jmethodID {
        method.as_ptr()
    }

    /// `java.io.File(entry).toURI().toURL()` handed to the system loader's
    /// `addURL`. Only a `URLClassLoader` has that method; any other loader
    /// (the application loader since JDK 9) is left alone. Runs inside a
    /// local frame the caller pops.
    unsafe fn add_url(&self, entry: &str) -> Option<()> {
        let loader_class = self.find_class("java/lang/ClassLoader")?;
        let system_loader = self.method_id(
            loader_class,
            "getSystemClassLoader",
            "()Ljava/lang/ClassLoader;",
            MemberKind::Static,
        )?;
        let loader = self
            .call(CallTarget::Static(loader_class), system_loader, &[], JType::Object)
            .as_object()?;

        let ucl_class = self.find_class("java/net/URLClassLoader")?;
        if !self.is_instance_of(loader, ucl_class) {
            debug!(entry, "system class loader is not a URLClassLoader");
            return None;
        }

        let file_class = self.find_class("java/io/File")?;
        let uri_class = self.find_class("java/net/URI")?;
        let ctor = self.method_id(file_class, "<init>", "(Ljava/lang/String;)V", MemberKind::Instance)?;
        let to_uri = self.method_id(file_class, "toURI", "()Ljava/net/URI;", MemberKind::Instance)?;
        let to_url = self.method_id(uri_class, "toURL", "()Ljava/net/URL;", MemberKind::Instance)?;
        let add_url = self.method_id(ucl_class, "addURL", "(Ljava/net/URL;)V", MemberKind::Instance)?;

        let path = self.new_string(entry)?;
        let file = self.new_object(file_class, ctor, &[JValue::object(path)])?;
        let uri = self
            .call(CallTarget::Instance(file), to_uri, &[], JType::Object)
            .as_object()?;
        let url = self
            .call(CallTarget::Instance(uri), to_url, &[], JType::Object)
            .as_object()?;
        self.call(
            CallTarget::Instance(loader),
            add_url,
            &[JValue::object(url)],
            JType::Void,
        );

        (jni!(self.env, ExceptionCheck) == JNI_FALSE).then_some(())
    }

    /// Set a `String` field of `obj` if the class declares it
    unsafe fn set_string_field(&self, obj: RawRef, name: &str, value: &str) {
        let Ok(field) = CString::new(name) else {
            return;
        };
        let Some(class) = self.object_class(obj) else {
            return;
        };
        let id = jni!(
            self.env,
            GetFieldID,
            Self::obj(class),
            field.as_ptr(),
            b"Ljava/lang/String;\0".as_ptr() as *const c_char
        );
        jni!(self.env, DeleteLocalRef, Self::obj(class));
        if id.is_null() {
            // NoSuchFieldError: the carrier does not record this part
            jni!(self.env, ExceptionClear);
            return;
        }
        if let Some(string) = self.new_string(value) {
            jni!(self.env, SetObjectField, Self::obj(obj), id, Self::obj(string));
            jni!(self.env, DeleteLocalRef, Self::obj(string));
        }
    }
}

/// Host side of the carrier natives registered last; one process VM at a time
static CARRIER_NATIVES: RwLock<Option<Arc<dyn CarrierNatives>>> = parking_lot::const_rwlock(None);

fn carrier_natives() -> Option<Arc<dyn CarrierNatives>> {
    CARRIER_NATIVES.read().clone()
}

/// `native void getErrorInfo()`: copies the host error in flight into the
/// carrier's `errorName`, `message` and `traceback` fields
unsafe extern "system" fn carrier_get_error_info(env: *mut JNIEnv, this: jobject) {
    let (Some(natives), Some(this)) = (carrier_natives(), RawRef::from_ptr(this)) else {
        return;
    };
    let Some(info) = natives.error_info() else {
        return;
    };
    let env = JvmEnv { env };
    env.set_string_field(this, "errorName", &info.name);
    env.set_string_field(this, "message", &info.message);
    if let Some(traceback) = &info.traceback {
        env.set_string_field(this, "traceback", traceback);
    }
}

/// `native void clear()`: forgets the host error in flight
unsafe extern "system" fn carrier_clear(env: *mut JNIEnv, _this: jobject) {
    if let Some(natives) = carrier_natives() {
        natives.clear(&JvmEnv { env });
    }
}

fn to_jvalue(value: &JValue) -> jvalue {
    match *value {
        JValue::Boolean(v) => jvalue {
            z: if v { JNI_TRUE } else { JNI_FALSE } as jboolean,
        },
        JValue::Byte(v) => jvalue { b: v },
        JValue::Char(v) => jvalue { c: v },
        JValue::Short(v) => jvalue { s: v },
        JValue::Int(v) => jvalue { i: v },
        JValue::Long(v) => jvalue { j: v },
        JValue::Float(v) => jvalue { f: v },
        JValue::Double(v) => jvalue { d: v },
        JValue::Object(v) => jvalue { l: JvmEnv::opt(v) },
        JValue::Void => jvalue { j: 0 },
    }
}

impl ForeignEnv for JvmEnv {
    fn ref_kind(&self, obj: RawRef) -> Option<RefType> {
        match unsafe { jni!(self.env, GetObjectRefType, Self::obj(obj)) } {
            jobjectRefType::JNILocalRefType => Some(RefType::Local),
            jobjectRefType::JNIGlobalRefType => Some(RefType::Global),
            jobjectRefType::JNIWeakGlobalRefType => Some(RefType::Weak),
            _ => None,
        }
    }

    fn is_same_object(&self, a: Option<RawRef>, b: Option<RawRef>) -> bool {
        unsafe { jni!(self.env, IsSameObject, Self::opt(a), Self::opt(b)) != JNI_FALSE }
    }

    fn new_local_ref(&self, obj: RawRef) -> Option<RawRef> {
        RawRef::from_ptr(unsafe { jni!(self.env, NewLocalRef, Self::obj(obj)) })
    }

    fn delete_local_ref(&self, obj: RawRef) {
        unsafe { jni!(self.env, DeleteLocalRef, Self::obj(obj)) }
    }

    fn new_global_ref(&self, obj: RawRef) -> Option<RawRef> {
        RawRef::from_ptr(unsafe { jni!(self.env, NewGlobalRef, Self::obj(obj)) })
    }

    fn delete_global_ref(&self, obj: RawRef) {
        unsafe { jni!(self.env, DeleteGlobalRef, Self::obj(obj)) }
    }

    fn new_weak_ref(&self, obj: RawRef) -> Option<RawRef> {
        RawRef::from_ptr(unsafe { jni!(self.env, NewWeakGlobalRef, Self::obj(obj)) })
    }

    fn delete_weak_ref(&self, obj: RawRef) {
        unsafe { jni!(self.env, DeleteWeakGlobalRef, Self::obj(obj)) }
    }

    fn exception_occurred(&self) -> Option<RawRef> {
        RawRef::from_ptr(unsafe { jni!(self.env, ExceptionOccurred) })
    }

    fn exception_describe(&self) {
        unsafe { jni!(self.env, ExceptionDescribe) }
    }

    fn exception_clear(&self) {
        unsafe { jni!(self.env, ExceptionClear) }
    }

    fn throw(&self, throwable: RawRef) -> i32 {
        unsafe { jni!(self.env, Throw, Self::obj(throwable)) }
    }

    fn throw_new(&self, class: RawRef, message: &str) -> i32 {
        let Ok(message) = CString::new(message) else {
            return STATUS_ERR;
        };
        unsafe { jni!(self.env, ThrowNew, Self::obj(class), message.as_ptr()) }
    }

    fn find_class(&self, name: &str) -> Option<RawRef> {
        let name = CString::new(name).ok()?;
        RawRef::from_ptr(unsafe { jni!(self.env, FindClass, name.as_ptr()) })
    }

    fn object_class(&self, obj: RawRef) -> Option<RawRef> {
        RawRef::from_ptr(unsafe { jni!(self.env, GetObjectClass, Self::obj(obj)) })
    }

    fn is_instance_of(&self, obj: RawRef, class: RawRef) -> bool {
        unsafe { jni!(self.env, IsInstanceOf, Self::obj(obj), Self::obj(class)) != JNI_FALSE }
    }

    fn method_id(
        &self,
        class: RawRef,
        name: &str,
        signature: &str,
        kind: MemberKind,
    ) -> Option<MethodId> {
        let name = CString::new(name).ok()?;
        let signature = CString::new(signature).ok()?;
        let id = unsafe {
            match kind {
                MemberKind::Instance => jni!(
                    self.env,
                    GetMethodID,
                    Self::obj(class),
                    name.as_ptr(),
                    signature.as_ptr()
                ),
                MemberKind::Static => jni!(
                    self.env,
                    GetStaticMethodID,
                    Self::obj(class),
                    name.as_ptr(),
                    signature.as_ptr()
                ),
            }
        };
        MethodId::from_ptr(id)
    }

    fn call(&self, target: CallTarget, method: MethodId, args: &[JValue], ret: JType) -> JValue {
        let jargs: Vec<jvalue> = args.iter().map(to_jvalue).collect();
        let (env, mid, argv) = (self.env, Self::mid(method), jargs.as_ptr());

        unsafe {
            match target {
                CallTarget::Instance(obj) => typed_call!(
                    env,
                    ret,
                    [
                        CallObjectMethodA, CallBooleanMethodA, CallByteMethodA, CallCharMethodA,
                        CallShortMethodA, CallIntMethodA, CallLongMethodA, CallFloatMethodA,
                        CallDoubleMethodA, CallVoidMethodA
                    ],
                    (Self::obj(obj), mid, argv)
                ),
                CallTarget::Nonvirtual { object, class } => typed_call!(
                    env,
                    ret,
                    [
                        CallNonvirtualObjectMethodA, CallNonvirtualBooleanMethodA,
                        CallNonvirtualByteMethodA, CallNonvirtualCharMethodA,
                        CallNonvirtualShortMethodA, CallNonvirtualIntMethodA,
                        CallNonvirtualLongMethodA, CallNonvirtualFloatMethodA,
                        CallNonvirtualDoubleMethodA, CallNonvirtualVoidMethodA
                    ],
                    (Self::obj(object), Self::obj(class), mid, argv)
                ),
                CallTarget::Static(class) => typed_call!(
                    env,
                    ret,
                    [
                        CallStaticObjectMethodA, CallStaticBooleanMethodA,
                        CallStaticByteMethodA, CallStaticCharMethodA, CallStaticShortMethodA,
                        CallStaticIntMethodA, CallStaticLongMethodA, CallStaticFloatMethodA,
                        CallStaticDoubleMethodA, CallStaticVoidMethodA
                    ],
                    (Self::obj(class), mid, argv)
                ),
            }
        }
    }

    fn new_object(&self, class: RawRef, ctor: MethodId, args: &[JValue]) -> Option<RawRef> {
        let jargs: Vec<jvalue> = args.iter().map(to_jvalue).collect();
        RawRef::from_ptr(unsafe {
            jni!(self.env, NewObjectA, Self::obj(class), Self::mid(ctor), jargs.as_ptr())
        })
    }

    fn new_string(&self, value: &str) -> Option<RawRef> {
        let value = CString::new(value).ok()?;
        RawRef::from_ptr(unsafe { jni!(self.env, NewStringUTF, value.as_ptr()) })
    }

    fn string_value(&self, string: RawRef) -> Option<String> {
        unsafe {
            let chars = jni!(self.env, GetStringUTFChars, Self::obj(string), ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let value = CStr::from_ptr(chars).to_string_lossy().into_owned();
            jni!(self.env, ReleaseStringUTFChars, Self::obj(string), chars);
            Some(value)
        }
    }

    fn append_class_path(&self, entry: &str) -> bool {
        unsafe {
            if jni!(self.env, PushLocalFrame, LOCAL_FRAME_CAPACITY) != STATUS_OK {
                return false;
            }
            let added = self.add_url(entry).is_some();
            jni!(self.env, PopLocalFrame, ptr::null_mut());
            added
        }
    }

    fn register_carrier_natives(&self, class: RawRef, natives: Arc<dyn CarrierNatives>) -> bool {
        *CARRIER_NATIVES.write() = Some(natives);

        let methods = [
            JNINativeMethod {
                name: b"getErrorInfo\0".as_ptr() as *mut c_char,
                signature: b"()V\0".as_ptr() as *mut c_char,
                fnPtr: carrier_get_error_info as *mut c_void,
            },
            JNINativeMethod {
                name: b"clear\0".as_ptr() as *mut c_char,
                signature: b"()V\0".as_ptr() as *mut c_char,
                fnPtr: carrier_clear as *mut c_void,
            },
        ];
        let status = unsafe {
            jni!(
                self.env,
                RegisterNatives,
                Self::obj(class),
                methods.as_ptr(),
                methods.len() as jint
            )
        };
        status == STATUS_OK
    }
}
