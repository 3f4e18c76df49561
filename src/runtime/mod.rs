//! Embedded runtime collaborator
//!
//! The thread-state layer in [`crate::embedded`] never executes interpreter
//! code itself. It only sequences the primitives of [`EmbeddedRuntime`]:
//! lifecycle queries, per-thread context allocation and the global execution
//! lock. [`InProcessRuntime`] is the implementation shipped with the crate.

pub mod functions;
pub mod in_process;

pub use functions::{FunctionRegistry, Globals, NativeFunction, Value};
pub use in_process::{InProcessRuntime, RuntimeStats};

use std::fmt;
use std::num::NonZeroU64;

/// Opaque per-thread interpreter context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(NonZeroU64);

impl ContextHandle {
    /// Wrap a raw, non-zero context id.
    pub fn from_raw(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    /// Raw context id.
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Opaque interpreter instance a context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterpreterHandle(NonZeroU64);

impl InterpreterHandle {
    /// Wrap a raw, non-zero interpreter id.
    pub fn from_raw(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    /// Raw interpreter id.
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for InterpreterHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "interp#{}", self.0)
    }
}

/// Failures of the runtime primitives themselves.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error("runtime is finalizing")]
    Finalizing,
    #[error("unknown context {0}")]
    UnknownContext(ContextHandle),
    #[error("calling thread does not hold the global lock")]
    LockNotHeld,
    #[error("calling thread already holds the global lock")]
    AlreadyHeld,
    #[error("calling thread has no current context")]
    NoCurrentContext,
    #[error("{0} is not the current context of the calling thread")]
    NotCurrent(ContextHandle),
}

/// Failures surfaced by calls into runtime code.
///
/// These pass through the thread-state layer untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("runtime call made without holding the global lock")]
    LockNotHeld,
    #[error("runtime is finalizing")]
    Finalizing,
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{function}` raised: {message}")]
    Raised { function: String, message: String },
}

/// Primitives of an embedded interpreter with one global execution lock.
///
/// All methods act on behalf of the calling OS thread. Implementations must be
/// correct on their own; the thread-state layer only decides *when* each one
/// is called.
pub trait EmbeddedRuntime: Send + Sync {
    /// Whether one-time initialization has happened and finalization has not.
    fn is_initialized(&self) -> bool;

    /// Whether the runtime has entered (or completed) its shutdown phase.
    fn is_finalizing(&self) -> bool;

    /// One-time startup.
    ///
    /// On success the calling thread holds the global lock and its bootstrap
    /// context is current.
    fn initialize(&self) -> Result<(), RuntimeError>;

    /// One-time shutdown. The calling thread must hold the global lock.
    ///
    /// Every remaining context is reclaimed and the lock is released.
    fn finalize(&self) -> Result<(), RuntimeError>;

    /// Context currently active on the calling thread.
    fn current_context(&self) -> Option<ContextHandle>;

    /// Interpreter a context belongs to.
    fn interpreter_of(
        &self,
        context: ContextHandle,
    ) -> Option<InterpreterHandle>;

    /// Allocate a new per-thread context. Does not need the lock.
    fn new_context(
        &self,
        interpreter: InterpreterHandle,
    ) -> Result<ContextHandle, RuntimeError>;

    /// Clear a context's internal state. Requires the lock.
    fn clear_context(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError>;

    /// Make `context` (or nothing) current on the calling thread, returning
    /// the previous one. Requires the lock.
    fn swap_context(
        &self,
        context: Option<ContextHandle>,
    ) -> Result<Option<ContextHandle>, RuntimeError>;

    /// Delete the calling thread's current context and release the lock.
    fn delete_current(&self) -> Result<(), RuntimeError>;

    /// Re-attach a suspended context: block for the lock, then make
    /// `context` current.
    fn restore_thread(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError>;

    /// First-time bind of a context: block for the lock, then make
    /// `context` current.
    fn acquire_thread(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError>;

    /// Detach `context` from the calling thread and release the lock.
    fn release_thread(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError>;

    /// Whether the calling thread holds the global lock.
    fn holds_lock(&self) -> bool;
}
