//! Foreign runtime seam
//!
//! Design: everything the bridge needs from the foreign VM goes through
//! three traits:
//! 1. `VmLauncher` - creates the VM from rendered launch options
//! 2. `ForeignVm` - process-wide operations (thread attach/detach)
//! 3. `ForeignEnv` - the per-thread call interface
//!
//! Backends:
//! - `sim.rs` - in-process VM with observable counters
//! - `jvm.rs` - JNI over a dynamically loaded `libjvm` (feature `jvm`)

mod types;
pub mod sim;
#[cfg(feature = "jvm")]
pub mod jvm;

pub use types::{
    CallTarget, JType, JValue, MemberKind, Method, MethodId, RawRef, RefType, Signature,
};

use crate::errors::{BridgeError, HostErrorInfo};
use std::rc::Rc;
use std::sync::Arc;

/// Status codes shared with the JNI invocation interface
pub const STATUS_OK: i32 = 0;
pub const STATUS_ERR: i32 = -1;
pub const STATUS_DETACHED: i32 = -2;
pub const STATUS_VERSION: i32 = -3;

/// Per-thread call interface, shared within its thread
pub type EnvRef = Rc<dyn ForeignEnv>;

/// Creates a foreign VM
pub trait VmLauncher {
    /// Start the VM with fully rendered options. The calling thread comes
    /// back attached.
    fn launch(&self, options: &[String]) -> Result<(Box<dyn ForeignVm>, EnvRef), BridgeError>;
}

/// Process-wide view of a running foreign VM
pub trait ForeignVm: Send + Sync {
    /// Attach the calling thread; `Err` carries the runtime's status code.
    fn attach_current_thread(&self, name: Option<&str>, daemon: bool) -> Result<EnvRef, i32>;

    fn detach_current_thread(&self) -> i32;

    fn description(&self) -> String;
}

/// Host side of the carrier class's native methods
///
/// Both run on the foreign thread that caught the carrier, so they see that
/// thread's host error in flight.
pub trait CarrierNatives: Send + Sync {
    /// `getErrorInfo()V`
    fn error_info(&self) -> Option<HostErrorInfo>;

    /// `clear()V`
    fn clear(&self, env: &dyn ForeignEnv);
}

/// Per-thread interface to the foreign runtime
///
/// Mirrors the narrow native interface: reference management, exception
/// state, class/member lookup and one generic call. Implementations never
/// check pending exceptions themselves; that is the exception bridge's job.
pub trait ForeignEnv {
    /// Reference type of `obj`, `None` when it is not a valid reference
    fn ref_kind(&self, obj: RawRef) -> Option<RefType>;

    /// Identity comparison; `None` stands for null
    fn is_same_object(&self, a: Option<RawRef>, b: Option<RawRef>) -> bool;

    fn new_local_ref(&self, obj: RawRef) -> Option<RawRef>;
    fn delete_local_ref(&self, obj: RawRef);
    fn new_global_ref(&self, obj: RawRef) -> Option<RawRef>;
    fn delete_global_ref(&self, obj: RawRef);
    fn new_weak_ref(&self, obj: RawRef) -> Option<RawRef>;
    fn delete_weak_ref(&self, obj: RawRef);

    /// Local reference to the pending throwable, if any
    fn exception_occurred(&self) -> Option<RawRef>;
    /// Print the pending throwable with the runtime's own diagnostics
    fn exception_describe(&self);
    fn exception_clear(&self);
    fn throw(&self, throwable: RawRef) -> i32;
    fn throw_new(&self, class: RawRef, message: &str) -> i32;

    fn find_class(&self, name: &str) -> Option<RawRef>;
    fn object_class(&self, obj: RawRef) -> Option<RawRef>;
    fn is_instance_of(&self, obj: RawRef, class: RawRef) -> bool;
    fn method_id(
        &self,
        class: RawRef,
        name: &str,
        signature: &str,
        kind: MemberKind,
    ) -> Option<MethodId>;

    /// Invoke `method`; object results are local references
    fn call(&self, target: CallTarget, method: MethodId, args: &[JValue], ret: JType) -> JValue;
    fn new_object(&self, class: RawRef, ctor: MethodId, args: &[JValue]) -> Option<RawRef>;

    fn new_string(&self, value: &str) -> Option<RawRef>;
    fn string_value(&self, string: RawRef) -> Option<String>;

    /// Make one classpath entry visible to the system class loader
    fn append_class_path(&self, entry: &str) -> bool;

    /// Bind the carrier class's native `getErrorInfo()V` and `clear()V`
    fn register_carrier_natives(&self, class: RawRef, natives: Arc<dyn CarrierNatives>) -> bool;
}
