//! Mutual exclusion integration tests
//!
//! Many workers hammering one runtime; at most one may be inside at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use embedlock::{run_workers, InProcessRuntime, RuntimeEnvironment, Value, WorkerPlan};

#[test]
fn test_single_holder_under_stress() {
    let env = RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap();
    let holders = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let plan = WorkerPlan {
        threads: 8,
        iterations: 500,
        pause: Duration::ZERO,
    };

    let report = run_workers(&env, &plan, |runtime, _call| {
        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        thread::yield_now();
        let out = runtime.call("total", &[Value::Int(1)]);
        holders.fetch_sub(1, Ordering::SeqCst);
        out
    })
    .unwrap();

    assert_eq!(report.completed_calls(), 4000);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(env.runtime().stats().peak_executing(), 1);
    assert!(!env.runtime().is_locked());
}

#[test]
fn test_twenty_workers_fifty_calls() {
    let runtime = Arc::new(InProcessRuntime::new());
    let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
    let plan = WorkerPlan {
        threads: 20,
        iterations: 50,
        pause: Duration::ZERO,
    };

    let report = run_workers(&env, &plan, |runtime, call| {
        let worker = call.worker as i64;
        let iteration = call.iteration as i64;
        runtime.call(
            "sum",
            &[Value::list([worker, iteration, 1]), Value::list([iteration, worker, 2])],
        )
    })
    .unwrap();

    assert_eq!(report.workers.len(), 20);
    assert_eq!(report.completed_calls(), 1000);
    assert_eq!(report.failed_workers(), 0);
    assert_eq!(report.abandoned_workers(), 0);
    for worker in &report.workers {
        for (iteration, result) in worker.results.iter().enumerate() {
            let expected = (worker.index + iteration) as i64;
            assert_eq!(result, &Value::list([expected, expected, 3]));
        }
    }

    assert_eq!(runtime.stats().calls(), 1000);
    assert_eq!(runtime.stats().peak_executing(), 1);
    // Only the bootstrap context is left.
    assert_eq!(runtime.live_contexts(), 1);
}

#[test]
fn test_paced_workers_interleave() {
    let runtime = Arc::new(InProcessRuntime::new());
    let env = RuntimeEnvironment::new(runtime.clone()).unwrap();
    let plan = WorkerPlan {
        threads: 4,
        iterations: 3,
        pause: Duration::from_millis(5),
    };

    let report = run_workers(&env, &plan, |runtime, call| {
        runtime.call("update_status", &[Value::Int(call.worker as i64)])
    })
    .unwrap();

    assert!(report.all_completed(3));
    assert_eq!(runtime.global_value("status_updates"), Some(Value::Int(12)));
    let status = runtime.global_value("status").unwrap();
    assert!(status.as_str().unwrap().ends_with("Update number 12"));
}
