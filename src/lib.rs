//! embedlock
//!
//! Calling into an embedded interpreter from many native threads, when the
//! interpreter only lets one thread execute at a time behind a single global
//! lock.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use embedlock::{InProcessRuntime, RuntimeEnvironment, Value};
//!
//! let env = RuntimeEnvironment::new(Arc::new(InProcessRuntime::new())).unwrap();
//! std::thread::scope(|s| {
//!     for worker in 0..4 {
//!         let env = &env;
//!         s.spawn(move || {
//!             // Each thread must use its own thread state.
//!             let thread_state = env.create_thread_state().unwrap();
//!             let guard = thread_state.acquire_lock();
//!             let out = guard.runtime().call("total", &[Value::Int(worker)]).unwrap();
//!             assert_eq!(out, Value::Int(worker));
//!         });
//!     }
//! });
//! ```
//!
//! # Modules
//!
//! - [`embedded`]: environment, thread states and lock guards
//! - [`runtime`]: the embedded runtime primitives and the in-process runtime
//! - [`workers`]: worker-driver threads
//! - [`util`]: configuration and logging

#![doc(html_root_url = "https://docs.rs/embedlock")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod embedded;
pub mod runtime;
pub mod workers;

// Utility modules
pub mod util;

// Re-exports
pub use embedded::{AccessViolation, ContextOrigin, LockGuard, RuntimeEnvironment, ThreadPhase, ThreadState};
pub use runtime::{CallError, EmbeddedRuntime, InProcessRuntime, RuntimeError, Value};
pub use workers::{run_naive, run_on_bootstrap, run_workers, DriverReport, NaiveFailure, WorkerPlan, WorkerReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Program name
pub const NAME: &str = "embedlock";
