//! Thread attachment manager
//!
//! Each native thread records its attachments in a single thread-local
//! table, one entry per bridge. A thread the foreign runtime did not spawn
//! is invisible to it until attached, so every bridge entry point goes
//! through `require`.

use crate::errors::UsageError;
use crate::foreign::{EnvRef, ForeignVm, STATUS_OK};
use crate::logging::{log_thread_attach, log_thread_detach};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Distinguishes bridge instances sharing the thread-local table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId(u64);

impl BridgeId {
    pub fn next() -> Self {
        Self(NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
struct Attachment {
    owner: BridgeId,
    env: EnvRef,
}

thread_local! {
    /// One entry per bridge this thread is attached through
    static ATTACHMENTS: RefCell<SmallVec<[Attachment; 1]>> = RefCell::new(SmallVec::new());
}

fn take_entry(owner: BridgeId) -> Option<Attachment> {
    ATTACHMENTS.with(|slot| {
        let mut slot = slot.borrow_mut();
        let index = slot.iter().position(|a| a.owner == owner)?;
        Some(slot.swap_remove(index))
    })
}

fn put_entry(attachment: Attachment) -> Option<Attachment> {
    let previous = take_entry(attachment.owner);
    ATTACHMENTS.with(|slot| slot.borrow_mut().push(attachment));
    previous
}

/// Attachment state of the calling thread with respect to one bridge
pub struct ThreadAttachments {
    owner: BridgeId,
}

impl ThreadAttachments {
    pub fn new(owner: BridgeId) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> BridgeId {
        self.owner
    }

    /// Attach the calling thread; returns the runtime's status code.
    ///
    /// Attaching an already attached thread is a no-op returning success.
    pub fn attach(&self, vm: &dyn ForeignVm, name: Option<&str>, daemon: bool) -> i32 {
        if self.is_attached() {
            return STATUS_OK;
        }

        let status = match vm.attach_current_thread(name, daemon) {
            Ok(env) => {
                self.store(env);
                STATUS_OK
            }
            Err(status) => status,
        };
        log_thread_attach(name, daemon, status);
        status
    }

    /// Detach the calling thread and clear its entry; returns the status code
    pub fn detach(&self, vm: &dyn ForeignVm) -> i32 {
        let status = vm.detach_current_thread();
        self.forget();
        log_thread_detach(status);
        status
    }

    /// Record an env the thread already holds (the launching thread, or a
    /// foreign thread calling back into the host)
    pub fn store(&self, env: EnvRef) {
        put_entry(Attachment {
            owner: self.owner,
            env,
        });
    }

    /// Clear the entry without telling the foreign runtime
    pub fn forget(&self) {
        take_entry(self.owner);
    }

    /// Use `env` for the calling thread until the returned guard drops
    pub fn adopt(&self, env: EnvRef) -> AdoptedEnv {
        let previous = put_entry(Attachment {
            owner: self.owner,
            env,
        });
        AdoptedEnv {
            owner: self.owner,
            previous,
        }
    }

    pub fn current(&self) -> Option<EnvRef> {
        ATTACHMENTS.with(|slot| {
            slot.borrow()
                .iter()
                .find(|a| a.owner == self.owner)
                .map(|a| a.env.clone())
        })
    }

    /// Current env, or the usage error every entry point raises without it
    pub fn require(&self) -> Result<EnvRef, UsageError> {
        self.current().ok_or(UsageError::ThreadNotAttached)
    }

    pub fn is_attached(&self) -> bool {
        ATTACHMENTS.with(|slot| slot.borrow().iter().any(|a| a.owner == self.owner))
    }
}

/// Restores the thread's previous attachment on drop
pub struct AdoptedEnv {
    owner: BridgeId,
    previous: Option<Attachment>,
}

impl Drop for AdoptedEnv {
    fn drop(&mut self) {
        take_entry(self.owner);
        if let Some(previous) = self.previous.take() {
            put_entry(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::sim::SimVm;
    use crate::foreign::STATUS_DETACHED;

    #[test]
    fn test_attach_detach_cycle() {
        let vm = SimVm::new();
        let attachments = ThreadAttachments::new(BridgeId::next());

        assert!(!attachments.is_attached());
        assert_eq!(attachments.require().err(), Some(UsageError::ThreadNotAttached));

        assert_eq!(attachments.attach(&vm, Some("worker"), true), STATUS_OK);
        assert!(attachments.is_attached());
        assert_eq!(vm.is_daemon(std::thread::current().id()), Some(true));

        // Second attach reuses the entry
        assert_eq!(attachments.attach(&vm, None, false), STATUS_OK);
        assert_eq!(vm.attached_count(), 1);

        assert_eq!(attachments.detach(&vm), STATUS_OK);
        assert!(!attachments.is_attached());
        assert_eq!(attachments.detach(&vm), STATUS_DETACHED);
    }

    #[test]
    fn test_attach_failure_returns_status() {
        let vm = SimVm::new();
        let attachments = ThreadAttachments::new(BridgeId::next());
        vm.fail_next_attach(-4);

        assert_eq!(attachments.attach(&vm, None, false), -4);
        assert!(!attachments.is_attached());
    }

    #[test]
    fn test_entries_are_per_bridge() {
        let vm = SimVm::new();
        let a = ThreadAttachments::new(BridgeId::next());
        let b = ThreadAttachments::new(BridgeId::next());

        a.attach(&vm, None, false);
        assert!(a.is_attached());
        assert!(!b.is_attached());

        b.store(vm.attach_current_thread(None, false).unwrap());
        assert!(a.is_attached() && b.is_attached());
        b.forget();
        assert!(a.is_attached());
        a.detach(&vm);
    }

    #[test]
    fn test_adopt_restores_previous() {
        let vm = SimVm::new();
        let attachments = ThreadAttachments::new(BridgeId::next());
        let env = vm.attach_current_thread(None, false).unwrap();

        {
            let _adopted = attachments.adopt(env);
            assert!(attachments.is_attached());
        }
        assert!(!attachments.is_attached());
    }

    #[test]
    fn test_other_threads_start_detached() {
        let vm = SimVm::new();
        let attachments = std::sync::Arc::new(ThreadAttachments::new(BridgeId::next()));
        attachments.attach(&vm, None, false);

        let remote = attachments.clone();
        let attached_elsewhere = std::thread::spawn(move || remote.is_attached())
            .join()
            .unwrap();
        assert!(!attached_elsewhere);
        attachments.detach(&vm);
    }
}
