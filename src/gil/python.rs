//! CPython GIL as the host interpreter lock

use super::{InterpreterLock, LockState};
use pyo3::ffi;

/// The GIL, driven through the C API
#[derive(Debug, Default, Clone, Copy)]
pub struct PythonLock;

impl InterpreterLock for PythonLock {
    fn ensure(&self) -> LockState {
        let state = unsafe { ffi::PyGILState_Ensure() };
        LockState(state as usize)
    }

    fn release(&self, state: LockState) {
        let state = if state.0 == ffi::PyGILState_STATE::PyGILState_LOCKED as usize {
            ffi::PyGILState_STATE::PyGILState_LOCKED
        } else {
            ffi::PyGILState_STATE::PyGILState_UNLOCKED
        };
        unsafe { ffi::PyGILState_Release(state) }
    }

    fn suspend(&self) -> LockState {
        // Called with the GIL held; the thread state comes back on resume
        let thread_state = unsafe { ffi::PyEval_SaveThread() };
        LockState(thread_state as usize)
    }

    fn resume(&self, state: LockState) {
        unsafe { ffi::PyEval_RestoreThread(state.0 as *mut ffi::PyThreadState) }
    }
}
