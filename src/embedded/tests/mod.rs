//! Thread-state layer unit tests
//!
//! Each test builds its own [`InProcessRuntime`] so lifecycles never overlap.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::embedded::{AccessViolation, ContextOrigin, RuntimeEnvironment, ThreadPhase};
use crate::runtime::{EmbeddedRuntime, InProcessRuntime, Value};

fn fresh_env() -> RuntimeEnvironment {
    RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap()
}

#[cfg(test)]
mod environment_tests {
    use super::*;

    #[test]
    fn test_new_initializes_and_releases() {
        let env = fresh_env();
        let runtime = env.runtime().clone();
        assert!(env.owns_lifecycle());
        assert!(runtime.is_initialized());
        assert!(!runtime.is_locked());
        assert!(env.bootstrap_context().is_some());
        assert!(env.interpreter().is_some());
        assert_eq!(env.creator(), thread::current().id());
    }

    #[test]
    fn test_drop_finalizes_owned_runtime() {
        let env = fresh_env();
        let runtime = env.runtime().clone();
        drop(env);
        assert!(runtime.is_finalizing());
        assert!(!runtime.is_initialized());
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[test]
    fn test_adopts_host_initialized_runtime() {
        let runtime = Arc::new(InProcessRuntime::new());
        runtime.initialize().unwrap();
        let host_context = runtime.current_context().unwrap();

        let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
        assert!(!env.owns_lifecycle());
        assert_eq!(env.bootstrap_context(), Some(host_context));

        // The host still holds the lock until it decides otherwise.
        runtime.release_thread(host_context).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                let ts = env.create_thread_state().unwrap();
                let guard = ts.acquire_lock();
                assert!(!guard.is_inert());
                assert_eq!(runtime.call("total", &[Value::Int(1)]), Ok(Value::Int(1)));
            });
        });

        drop(env);
        assert!(runtime.is_initialized(), "adopted runtime must not be finalized");
        assert!(!runtime.is_finalizing());
    }

    #[test]
    fn test_no_bootstrap_means_unavailable() {
        let runtime = Arc::new(InProcessRuntime::new());
        thread::scope(|s| {
            s.spawn(|| {
                runtime.initialize().unwrap();
                let context = runtime.current_context().unwrap();
                runtime.release_thread(context).unwrap();
            });
        });

        // Initialized elsewhere, nothing current here: nothing to build on.
        let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
        assert!(!env.owns_lifecycle());
        assert_eq!(env.bootstrap_context(), None);
        assert!(env.create_thread_state().is_none());
        assert!(env.interpreter().is_none());
    }

    #[test]
    fn test_drop_off_creator_thread_leaves_runtime_running() {
        let env = fresh_env();
        let runtime = env.runtime().clone();
        thread::spawn(move || drop(env)).join().unwrap();
        assert!(runtime.is_initialized());
        assert!(!runtime.is_finalizing());
    }

    #[test]
    fn test_create_after_finalize_is_none() {
        let runtime = Arc::new(InProcessRuntime::new());
        let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
        let bootstrap = env.bootstrap_context().unwrap();
        runtime.restore_thread(bootstrap).unwrap();
        runtime.finalize().unwrap();

        assert!(env.create_thread_state().is_none());
        thread::scope(|s| {
            s.spawn(|| assert!(env.create_thread_state().is_none()));
        });
        // Already finalizing: drop is a no-op.
        drop(env);
        assert!(runtime.is_finalizing());
    }
}

#[cfg(test)]
mod thread_state_tests {
    use super::*;

    #[test]
    fn test_creator_reuses_bootstrap() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();
        assert!(ts.is_bootstrap());
        assert_eq!(ts.origin(), Some(ContextOrigin::Bootstrap));
        assert_eq!(ts.context(), env.bootstrap_context());
        assert_eq!(ts.owner(), thread::current().id());

        let live = env.runtime().live_contexts();
        drop(ts);
        assert_eq!(env.runtime().live_contexts(), live, "bootstrap context is never deleted");
    }

    #[test]
    fn test_worker_gets_fresh_context() {
        let env = fresh_env();
        let runtime = env.runtime().clone();
        assert_eq!(runtime.live_contexts(), 1);

        thread::scope(|s| {
            s.spawn(|| {
                let ts = env.create_thread_state().unwrap();
                assert!(!ts.is_bootstrap());
                assert_eq!(ts.origin(), Some(ContextOrigin::Fresh));
                assert_ne!(ts.context(), env.bootstrap_context());
                assert_eq!(runtime.live_contexts(), 2);
            });
        });

        assert_eq!(runtime.live_contexts(), 1);
        assert_eq!(runtime.stats().contexts_deleted(), 1);
        assert!(!runtime.is_locked());
    }

    #[test]
    fn test_phase_follows_guard() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();
        assert_eq!(ts.phase(), ThreadPhase::Active);
        {
            let guard = ts.acquire_lock();
            assert_eq!(guard.origin(), Some(ContextOrigin::Bootstrap));
            assert_eq!(ts.phase(), ThreadPhase::Locked);
            assert!(env.runtime().holds_lock());
        }
        assert_eq!(ts.phase(), ThreadPhase::Active);
        assert!(!env.runtime().is_locked());
    }

    #[test]
    fn test_reentrant_acquire_is_rejected() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();
        let _guard = ts.acquire_lock();
        assert_eq!(
            ts.try_acquire_lock().unwrap_err(),
            AccessViolation::Reentrant(thread::current().id())
        );
    }

    #[test]
    fn test_second_state_on_locked_thread_is_rejected() {
        let env = fresh_env();
        thread::scope(|s| {
            s.spawn(|| {
                let first = env.create_thread_state().unwrap();
                let second = env.create_thread_state().unwrap();
                let _guard = first.acquire_lock();
                assert!(matches!(
                    second.try_acquire_lock(),
                    Err(AccessViolation::Reentrant(_))
                ));
            });
        });
    }

    #[test]
    fn test_drop_under_sibling_guard_keeps_context() {
        let env = fresh_env();
        let runtime = env.runtime().clone();
        thread::scope(|s| {
            s.spawn(|| {
                let first = env.create_thread_state().unwrap();
                let second = env.create_thread_state().unwrap();
                assert_eq!(runtime.live_contexts(), 3);

                let guard = first.acquire_lock();
                drop(second);
                // The sibling guard keeps the lock and stays usable.
                assert!(runtime.holds_lock());
                assert_eq!(guard.runtime().call("total", &[Value::Int(2)]), Ok(Value::Int(2)));
                assert_eq!(runtime.live_contexts(), 3);
                drop(guard);
            });
        });

        // `first` cleaned up; `second` waits for finalization.
        assert_eq!(runtime.live_contexts(), 2);
        assert!(!runtime.is_locked());
        drop(env);
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn test_reentrant_acquire_panics() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();
        let _first = ts.acquire_lock();
        let _second = ts.acquire_lock();
    }

    #[test]
    fn test_wrong_thread_is_rejected() {
        let env = fresh_env();
        let (to_worker, from_main) = mpsc::channel();
        let (to_main, from_worker) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(move || {
                let ts: crate::embedded::ThreadState = from_main.recv().unwrap();
                let outcome = ts.try_acquire_lock().map(|guard| guard.is_inert());
                to_main.send((ts, outcome)).unwrap();
            });

            to_worker.send(env.create_thread_state().unwrap()).unwrap();
            let (ts, outcome) = from_worker.recv().unwrap();
            assert!(matches!(outcome, Err(AccessViolation::WrongThread { .. })));
            // Back on the owner thread, it works again.
            assert!(!ts.acquire_lock().is_inert());
        });
    }

    #[test]
    fn test_wrong_thread_acquire_panics() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();
        let result = thread::spawn(move || {
            let _guard = ts.acquire_lock();
        })
        .join();
        assert!(result.is_err());
        assert!(!env.runtime().is_locked());
    }

    #[test]
    fn test_finalizing_gives_inert_guards() {
        let runtime = Arc::new(InProcessRuntime::new());
        let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
        let ts = env.create_thread_state().unwrap();
        drop(env);

        let guard = ts.acquire_lock();
        assert!(guard.is_inert());
        assert_eq!(ts.phase(), ThreadPhase::Active);
        assert!(!runtime.holds_lock());
        assert!(runtime.call("total", &[]).is_err());
    }
}

#[cfg(test)]
mod lock_guard_tests {
    use super::*;

    #[test]
    fn test_released_on_panic() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ts.acquire_lock();
            panic!("failure inside the protected region");
        }));

        assert!(result.is_err());
        assert!(!env.runtime().is_locked());
        assert_eq!(ts.phase(), ThreadPhase::Active);
        assert!(!ts.acquire_lock().is_inert());
    }

    #[test]
    fn test_released_on_error_return() {
        let env = fresh_env();
        let ts = env.create_thread_state().unwrap();

        let outcome = (|| {
            let guard = ts.acquire_lock();
            guard.runtime().call("raise", &[Value::str("nope")])?;
            Ok::<_, crate::runtime::CallError>(())
        })();

        assert!(outcome.is_err());
        assert!(!env.runtime().is_locked());
    }

    #[test]
    fn test_guard_binds_context() {
        let env = fresh_env();
        let runtime = env.runtime().clone();
        thread::scope(|s| {
            s.spawn(|| {
                let ts = env.create_thread_state().unwrap();
                let guard = ts.acquire_lock();
                assert_eq!(guard.context(), ts.context());
                assert_eq!(guard.origin(), Some(ContextOrigin::Fresh));
                assert_eq!(runtime.current_context(), ts.context());
            });
        });
    }
}
