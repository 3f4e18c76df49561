//! Ownership integration tests
//!
//! Thread states used from the wrong thread, or locked twice, fail fast.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use embedlock::{AccessViolation, InProcessRuntime, RuntimeEnvironment, ThreadState};

#[test]
fn test_foreign_thread_rejected_regardless_of_lock_state() {
    let env = RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap();
    let (to_main, from_worker) = mpsc::channel::<ThreadState>();
    let (to_worker, from_main) = mpsc::channel::<ThreadState>();

    let env_ref = &env;
    thread::scope(|s| {
        s.spawn(move || {
            to_main.send(env_ref.create_thread_state().unwrap()).unwrap();
            // Dropped back on its owner.
            drop(from_main.recv().unwrap());
        });

        let foreign = from_worker.recv().unwrap();
        let owner = foreign.owner();
        assert_ne!(owner, thread::current().id());

        // Lock free.
        assert!(matches!(
            foreign.try_acquire_lock(),
            Err(AccessViolation::WrongThread { owner: o, .. }) if o == owner
        ));

        // Lock held by this thread through its own state.
        let own = env.create_thread_state().unwrap();
        {
            let _guard = own.acquire_lock();
            assert!(matches!(
                foreign.try_acquire_lock(),
                Err(AccessViolation::WrongThread { .. })
            ));
        }

        // The panicking variant fails the same way.
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = foreign.acquire_lock();
        }));
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("does not own the thread state"));

        to_worker.send(foreign).unwrap();
    });

    assert!(!env.runtime().is_locked());
}

#[test]
fn test_double_acquire_fails_fast_without_deadlock() {
    let env = RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap();

    let outcome = thread::scope(|s| {
        s.spawn(|| {
            let thread_state = env.create_thread_state().unwrap();
            panic::catch_unwind(AssertUnwindSafe(|| {
                let _first = thread_state.acquire_lock();
                let _second = thread_state.acquire_lock();
            }))
            .is_err()
        })
        .join()
        .unwrap()
    });

    assert!(outcome, "second acquisition must panic");
    assert!(!env.runtime().is_locked(), "first guard released while unwinding");
}

#[test]
fn test_guard_cannot_outlive_state() {
    // Compile-time property, checked here at runtime through the phase: the
    // guard borrows the state, so the state is locked exactly while it lives.
    let env = RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap();
    let thread_state = env.create_thread_state().unwrap();
    let guard = thread_state.acquire_lock();
    assert_eq!(thread_state.phase(), embedlock::ThreadPhase::Locked);
    drop(guard);
    assert_eq!(thread_state.phase(), embedlock::ThreadPhase::Active);
}
