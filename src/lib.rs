//! jbridge: a bridge runtime between a host interpreter and a foreign,
//! independently garbage-collected VM reached through a per-thread native
//! interface.
//!
//! The bridge keeps three things consistent across the boundary:
//! - object lifetimes, through a ledger of counted durable references
//! - thread attachment, through a per-thread env table
//! - error propagation, through an exception check after every foreign call

// Core modules
pub mod attach;
pub mod bridge;
pub mod classes;
pub mod config;
pub mod errors;
pub mod exception;
pub mod foreign;
pub mod gil;
pub mod handle;
pub mod ledger;
pub mod logging;
pub mod object;
pub mod runtime;

#[cfg(feature = "python")]
pub mod bindings;

// Re-export commonly used items
pub use bridge::{strhash, Bridge, RefDump};
pub use classes::{ClassCache, ClassInfo, MethodSpec};
pub use config::{BridgeConfig, VmOptions};
pub use errors::{
    BridgeError, CallError, ConfigError, ForeignException, HostError, HostErrorInfo,
    LedgerConsistencyError, Result, UsageError,
};
pub use foreign::{CallTarget, JType, JValue, MemberKind, Method, RawRef, Signature};
pub use handle::{Handle, IdentityKey, RefKind};
pub use ledger::{RefLedger, ReleaseOutcome};
pub use object::ForeignObject;
pub use runtime::{
    attach_current_thread, current_vm, detach_current_thread, dump_refs, init_vm,
    is_current_thread_attached, shutdown_vm,
};
