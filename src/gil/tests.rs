use super::*;
use parking_lot::Mutex;

/// Records every transition so ordering can be asserted
#[derive(Default)]
struct RecordingLock {
    log: Mutex<Vec<&'static str>>,
}

impl RecordingLock {
    fn events(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }
}

impl InterpreterLock for RecordingLock {
    fn ensure(&self) -> LockState {
        self.log.lock().push("ensure");
        LockState(7)
    }

    fn release(&self, state: LockState) {
        assert_eq!(state, LockState(7));
        self.log.lock().push("release");
    }

    fn suspend(&self) -> LockState {
        self.log.lock().push("suspend");
        LockState(11)
    }

    fn resume(&self, state: LockState) {
        assert_eq!(state, LockState(11));
        self.log.lock().push("resume");
    }
}

#[test]
fn test_callback_guard_pairs_ensure_and_release() {
    let lock = RecordingLock::default();
    {
        let _guard = CallbackGuard::new(&lock);
        assert_eq!(lock.events(), vec!["ensure"]);
    }
    assert_eq!(lock.events(), vec!["ensure", "release"]);
}

#[test]
fn test_blocking_guard_counts_as_handler() {
    let lock = RecordingLock::default();
    let handlers = HandlerDepth::new();
    {
        let _guard = BlockingGuard::new(&lock, &handlers);
        assert_eq!(handlers.current(), 1);
        {
            let _nested = BlockingGuard::new(&lock, &handlers);
            assert_eq!(handlers.current(), 2);
        }
        assert_eq!(handlers.current(), 1);
    }
    assert_eq!(handlers.current(), 0);
    assert_eq!(lock.events(), vec!["suspend", "suspend", "resume", "resume"]);
}

#[test]
fn test_guards_restore_on_early_exit() {
    let lock = RecordingLock::default();
    let handlers = HandlerDepth::new();

    fn fails(lock: &RecordingLock, handlers: &HandlerDepth) -> Result<(), &'static str> {
        let _guard = BlockingGuard::new(lock, handlers);
        Err::<(), _>("foreign call failed")?;
        Ok(())
    }

    assert!(fails(&lock, &handlers).is_err());
    assert_eq!(handlers.current(), 0);
    assert_eq!(lock.events(), vec!["suspend", "resume"]);
}

#[test]
fn test_guards_restore_on_panic() {
    let lock = RecordingLock::default();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _guard = CallbackGuard::new(&lock);
        panic!("host callback panicked");
    }));

    assert!(result.is_err());
    assert_eq!(lock.events(), vec!["ensure", "release"]);
}
