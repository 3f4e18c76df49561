//! Property tests over worker counts and cycle counts

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use embedlock::{run_workers, InProcessRuntime, RuntimeEnvironment, Value, WorkerPlan};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_every_cycle_runs_alone(threads in 1usize..8, iterations in 1usize..40) {
        let runtime = Arc::new(InProcessRuntime::new());
        let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
        let inside = AtomicUsize::new(0);
        let overlaps = AtomicUsize::new(0);
        let plan = WorkerPlan { threads, iterations, pause: Duration::ZERO };

        let report = run_workers(&env, &plan, |runtime, call| {
            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let out = runtime.call("total", &[Value::Int(call.iteration as i64)]);
            inside.fetch_sub(1, Ordering::SeqCst);
            out
        })
        .unwrap();

        prop_assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        prop_assert_eq!(report.completed_calls(), threads * iterations);
        prop_assert!(runtime.stats().peak_executing() <= 1);
        prop_assert_eq!(runtime.live_contexts(), 1);
        prop_assert!(!runtime.is_locked());
    }

    #[test]
    fn prop_failure_stops_only_that_worker(threads in 2usize..6, fail_at in 0usize..5) {
        let env = RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap();
        let plan = WorkerPlan { threads, iterations: 5, pause: Duration::ZERO };

        let report = run_workers(&env, &plan, |runtime, call| {
            if call.worker == 0 && call.iteration == fail_at {
                runtime.call("raise", &[])
            } else {
                runtime.call("total", &[])
            }
        })
        .unwrap();

        prop_assert_eq!(report.failed_workers(), 1);
        prop_assert_eq!(report.workers[0].completed(), fail_at);
        prop_assert_eq!(report.completed_calls(), fail_at + (threads - 1) * 5);
        prop_assert!(!env.runtime().is_locked());
    }
}
