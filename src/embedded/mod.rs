//! Thread-state and lock ownership for an embedded runtime
//!
//! The embedded runtime executes code on one thread at a time, guarded by a
//! single global lock. This module hands that lock between threads:
//!
//! ```text
//! RuntimeEnvironment ──create_thread_state()──▶ ThreadState ──acquire_lock()──▶ LockGuard
//!   (init / finalize once)                      (one per thread)               (one hold)
//! ```
//!
//! - [`RuntimeEnvironment`] initializes the runtime once, releases the lock
//!   and finalizes on drop.
//! - [`ThreadState`] belongs to exactly one thread. It reuses the bootstrap
//!   context on the creating thread and allocates a fresh one elsewhere.
//! - [`LockGuard`] holds the lock for a scope and always releases it.
//!
//! When the runtime is unavailable (never initialized, or finalizing) the
//! layer degrades instead of failing: no thread state, or an inert guard.
//! Misuse (wrong thread, taking the lock twice) panics.

pub mod environment;
pub mod lock;
pub mod thread_state;

pub use environment::{EnvironmentError, RuntimeEnvironment};
pub use lock::{ContextOrigin, LockGuard};
pub use thread_state::{AccessViolation, ThreadPhase, ThreadState};

#[cfg(test)]
mod tests;
