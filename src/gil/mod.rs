//! Interpreter-lock guards
//!
//! Two scope guards around the host interpreter lock:
//! - `CallbackGuard` takes the lock while a foreign thread runs host code
//! - `BlockingGuard` gives the lock up for the length of a foreign call that
//!   may block, and counts as an active host-level handler meanwhile
//!
//! Both restore the previous state on drop, early returns and unwinding
//! included.

use crate::exception::HandlerDepth;

#[cfg(feature = "python")]
pub mod python;

#[cfg(test)]
mod tests;

/// Opaque token returned when the lock state changes, handed back to undo it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState(pub usize);

/// Host interpreter lock
pub trait InterpreterLock: Send + Sync {
    /// Take the lock for a thread that may not hold it
    fn ensure(&self) -> LockState;

    fn release(&self, state: LockState);

    /// Give up the lock held by this thread
    fn suspend(&self) -> LockState;

    fn resume(&self, state: LockState);
}

/// Host without an interpreter lock
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostLock;

impl InterpreterLock for NoHostLock {
    fn ensure(&self) -> LockState {
        LockState(0)
    }

    fn release(&self, _state: LockState) {}

    fn suspend(&self) -> LockState {
        LockState(0)
    }

    fn resume(&self, _state: LockState) {}
}

/// Holds the interpreter lock while foreign code calls into the host
#[must_use = "the lock is released when the guard drops"]
pub struct CallbackGuard<'a> {
    lock: &'a dyn InterpreterLock,
    state: LockState,
}

impl<'a> CallbackGuard<'a> {
    pub fn new(lock: &'a dyn InterpreterLock) -> Self {
        let state = lock.ensure();
        Self { lock, state }
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.state);
    }
}

/// Releases the interpreter lock around a blocking foreign call
#[must_use = "the lock is restored when the guard drops"]
pub struct BlockingGuard<'a> {
    lock: &'a dyn InterpreterLock,
    handlers: &'a HandlerDepth,
    state: LockState,
}

impl<'a> BlockingGuard<'a> {
    pub fn new(lock: &'a dyn InterpreterLock, handlers: &'a HandlerDepth) -> Self {
        handlers.enter();
        let state = lock.suspend();
        Self {
            lock,
            handlers,
            state,
        }
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        self.lock.resume(self.state);
        self.handlers.exit();
    }
}
