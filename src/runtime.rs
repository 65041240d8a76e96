//! Process-wide bridge
//!
//! One VM per process, started by the first `init_vm`. Later calls hand back
//! the running bridge; they may still extend its classpath, but launch
//! options can no longer take effect.

use crate::bridge::{Bridge, RefDump};
use crate::config::{BridgeConfig, VmOptions};
use crate::errors::{ConfigError, Result, UsageError};
use crate::foreign::VmLauncher;
use crate::gil::{InterpreterLock, NoHostLock};
use crate::logging::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static VM: Lazy<Mutex<Option<Bridge>>> = Lazy::new(|| Mutex::new(None));

/// Start the process VM, or return the running one
pub fn init_vm(launcher: &dyn VmLauncher, options: VmOptions) -> Result<Bridge> {
    init_vm_with_config(launcher, BridgeConfig::new(options))
}

pub fn init_vm_with_config(launcher: &dyn VmLauncher, config: BridgeConfig) -> Result<Bridge> {
    init_vm_with_lock(launcher, config, Box::new(NoHostLock))
}

/// Start the process VM for a host with an interpreter lock.
///
/// With a VM already running: heap, stack or extra options fail with
/// `OptionsIneffective`; a classpath alone is appended to the running VM.
pub fn init_vm_with_lock(
    launcher: &dyn VmLauncher,
    config: BridgeConfig,
    host_lock: Box<dyn InterpreterLock>,
) -> Result<Bridge> {
    let mut slot = VM.lock();

    if let Some(bridge) = slot.as_ref().filter(|b| b.is_running()) {
        if config.vm.has_launch_options() {
            return Err(ConfigError::OptionsIneffective.into());
        }
        if let Some(classpath) = config.vm.classpath.as_deref().filter(|cp| !cp.is_empty()) {
            bridge.append_class_path(classpath)?;
        }
        debug!("init_vm returned the running VM");
        return Ok(bridge.clone());
    }

    let bridge = Bridge::launch_with_lock(launcher, config, host_lock)?;
    *slot = Some(bridge.clone());
    Ok(bridge)
}

/// The running process VM, if any
pub fn current_vm() -> Option<Bridge> {
    VM.lock().as_ref().filter(|b| b.is_running()).cloned()
}

pub fn require_vm() -> Result<Bridge> {
    current_vm().ok_or_else(|| UsageError::VmNotStarted.into())
}

/// Attach the calling thread to the process VM; returns the status code
pub fn attach_current_thread(name: Option<&str>, daemon: bool) -> Result<i32> {
    require_vm()?.attach_current_thread(name, daemon)
}

pub fn detach_current_thread() -> Result<i32> {
    require_vm()?.detach_current_thread()
}

/// False as well when no VM is running
pub fn is_current_thread_attached() -> bool {
    current_vm().map_or(false, |vm| vm.is_current_thread_attached())
}

pub fn dump_refs(by_class: bool, by_value: bool) -> Result<RefDump> {
    require_vm()?.dump_refs(by_class, by_value)
}

/// Shut the process VM down; returns the number of references deleted.
///
/// A later `init_vm` starts a fresh bridge.
pub fn shutdown_vm() -> Result<usize> {
    let mut slot = VM.lock();
    let bridge = slot
        .as_ref()
        .filter(|b| b.is_running())
        .ok_or(UsageError::VmNotStarted)?;
    let deleted = bridge.shutdown()?;
    *slot = None;
    info!(deleted, "process VM shut down");
    Ok(deleted)
}
