//! Exception bridge
//!
//! Exactly one check follows every foreign call:
//! 1. Nothing pending: done
//! 2. Pending: describe it through the foreign runtime when no host-level
//!    handler is active, then clear it
//! 3. Classify: the carrier raised for a host error comes back as that very
//!    host error; anything else is handed out as a foreign throwable
//!
//! Carrier matching is by object identity with the throwable recorded when
//! the host error was raised, never by class.

use crate::attach::BridgeId;
use crate::errors::{HostError, HostErrorInfo};
use crate::foreign::{CarrierNatives, ForeignEnv, JValue, MethodId, RawRef, STATUS_OK};
use crate::logging::{log_exception_describe, log_host_error_round_trip};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(test)]
mod tests;

/// Number of active host-level handlers, shared by all threads
#[derive(Debug, Default)]
pub struct HandlerDepth(AtomicUsize);

impl HandlerDepth {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Returns the depth after entering
    #[inline]
    pub fn enter(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[inline]
    pub fn exit(&self) {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "handler depth underflow");
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of checking the foreign runtime after a call
#[derive(Debug)]
pub enum Outcome {
    Clear,
    /// A host error raised through the carrier, restored as-is
    HostError(HostError),
    /// Local reference to the cleared foreign throwable
    Foreign(RawRef),
}

struct CarrierSlot {
    owner: BridgeId,
    tag: u64,
    /// Weak reference to the raised carrier throwable
    carrier: RawRef,
    error: HostError,
}

thread_local! {
    static CARRIER: RefCell<Option<CarrierSlot>> = const { RefCell::new(None) };
}

pub struct ExceptionBridge {
    owner: BridgeId,
    handlers: HandlerDepth,
    describe: bool,
    next_tag: AtomicU64,
}

impl ExceptionBridge {
    pub fn new(owner: BridgeId, describe: bool) -> Self {
        Self {
            owner,
            handlers: HandlerDepth::new(),
            describe,
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn handlers(&self) -> &HandlerDepth {
        &self.handlers
    }

    /// Drain and classify the calling thread's pending exception
    pub fn check(&self, env: &dyn ForeignEnv) -> Outcome {
        let Some(throwable) = env.exception_occurred() else {
            return Outcome::Clear;
        };

        let handlers = self.handlers.current();
        if self.describe && handlers == 0 {
            env.exception_describe();
            log_exception_describe(handlers);
        }
        env.exception_clear();

        match self.take_carried(env, throwable) {
            Some(error) => {
                env.delete_local_ref(throwable);
                Outcome::HostError(error)
            }
            None => Outcome::Foreign(throwable),
        }
    }

    fn take_carried(&self, env: &dyn ForeignEnv, throwable: RawRef) -> Option<HostError> {
        CARRIER.with(|slot| {
            let mut slot = slot.borrow_mut();
            let carrier = slot.as_ref().filter(|c| c.owner == self.owner)?.carrier;

            if env.is_same_object(Some(carrier), Some(throwable)) {
                let carried = slot.take()?;
                env.delete_weak_ref(carried.carrier);
                log_host_error_round_trip(carried.error.name(), carried.tag);
                return Some(carried.error);
            }

            // Carrier collected without ever coming back
            if env.is_same_object(Some(carrier), None) {
                if let Some(stale) = slot.take() {
                    env.delete_weak_ref(stale.carrier);
                }
            }
            None
        })
    }

    /// Throw `error` into the foreign runtime inside a new carrier throwable.
    ///
    /// `class`/`ctor` name the carrier class and its `(String)` constructor.
    /// Returns whether the carrier is now pending; on failure whatever the
    /// foreign runtime raised instead is left pending.
    pub fn raise_host_error(
        &self,
        env: &dyn ForeignEnv,
        class: RawRef,
        ctor: MethodId,
        error: HostError,
    ) -> bool {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let message = format!("host error #{}: {}", tag, error.message());

        let Some(text) = env.new_string(&message) else {
            return false;
        };
        let throwable = env.new_object(class, ctor, &[JValue::object(text)]);
        env.delete_local_ref(text);
        let Some(throwable) = throwable else {
            return false;
        };

        let Some(carrier) = env.new_weak_ref(throwable) else {
            env.delete_local_ref(throwable);
            return false;
        };
        self.record(env, tag, carrier, error);

        let status = env.throw(throwable);
        env.delete_local_ref(throwable);
        status == STATUS_OK
    }

    fn record(&self, env: &dyn ForeignEnv, tag: u64, carrier: RawRef, error: HostError) {
        let previous = CARRIER.with(|slot| {
            slot.replace(Some(CarrierSlot {
                owner: self.owner,
                tag,
                carrier,
                error,
            }))
        });
        if let Some(previous) = previous {
            env.delete_weak_ref(previous.carrier);
        }
    }

    /// What foreign code may learn about the host error in flight on this thread
    pub fn pending_host_error_info(&self) -> Option<HostErrorInfo> {
        CARRIER.with(|slot| {
            slot.borrow()
                .as_ref()
                .filter(|c| c.owner == self.owner)
                .map(|c| c.error.info())
        })
    }

    /// Forget the host error in flight; true if there was one
    pub fn clear_pending_host_error(&self, env: &dyn ForeignEnv) -> bool {
        let taken = CARRIER.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(c) if c.owner == self.owner => slot.take(),
                _ => None,
            }
        });
        match taken {
            Some(carried) => {
                env.delete_weak_ref(carried.carrier);
                true
            }
            None => false,
        }
    }
}

/// The carrier's natives read and clear this bridge's slot on the calling thread
impl CarrierNatives for ExceptionBridge {
    fn error_info(&self) -> Option<HostErrorInfo> {
        self.pending_host_error_info()
    }

    fn clear(&self, env: &dyn ForeignEnv) {
        self.clear_pending_host_error(env);
    }
}
