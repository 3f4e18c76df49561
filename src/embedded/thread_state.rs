//! Per-thread right to execute runtime code

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, error, warn};

use super::lock::{ContextOrigin, LockGuard};
use crate::runtime::{ContextHandle, EmbeddedRuntime, InProcessRuntime, InterpreterHandle};

/// Misuse of a [`ThreadState`].
///
/// These are bugs in the caller, never runtime conditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessViolation {
    #[error("tried to lock from thread {actual:?}, which does not own the thread state (owner {owner:?})")]
    WrongThread { owner: ThreadId, actual: ThreadId },
    #[error("tried to take the global lock twice on thread {0:?}")]
    Reentrant(ThreadId),
}

/// Observable phase of a thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPhase {
    /// Attached to the runtime, not holding the lock.
    Active,
    /// A guard from this state holds the lock.
    Locked,
}

/// The native context behind a thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeContext {
    /// Bootstrap context; the environment owns it.
    Borrowed(ContextHandle),
    /// Allocated for this thread; deleted when the state is dropped.
    Owned(ContextHandle),
    /// The runtime refused to hand out a context.
    Unavailable,
}

impl NativeContext {
    fn handle(self) -> Option<ContextHandle> {
        match self {
            NativeContext::Borrowed(context) | NativeContext::Owned(context) => Some(context),
            NativeContext::Unavailable => None,
        }
    }

    fn origin(self) -> ContextOrigin {
        match self {
            NativeContext::Borrowed(_) => ContextOrigin::Bootstrap,
            NativeContext::Owned(_) | NativeContext::Unavailable => ContextOrigin::Fresh,
        }
    }
}

/// A thread's handle into the embedded runtime.
///
/// Only the thread that created it may use or drop it. It can be moved
/// between threads (so misuse is caught at runtime and reported) but never
/// shared. Lock the runtime with [`acquire_lock`](Self::acquire_lock).
///
/// Dropping a fresh state needs the global lock to delete its context. If
/// the same thread is holding the lock through another state at that moment,
/// deletion is skipped and the context stays alive until the runtime
/// finalizes. Keep one thread state per thread.
pub struct ThreadState<R: EmbeddedRuntime = InProcessRuntime> {
    runtime: Arc<R>,
    context: NativeContext,
    owner: ThreadId,
    locked: Cell<bool>,
}

impl<R: EmbeddedRuntime> ThreadState<R> {
    /// Wrap the bootstrap context on the thread that initialized the runtime.
    pub(crate) fn borrowed(
        runtime: Arc<R>,
        bootstrap: ContextHandle,
    ) -> Self {
        Self {
            runtime,
            context: NativeContext::Borrowed(bootstrap),
            owner: thread::current().id(),
            locked: Cell::new(false),
        }
    }

    /// Allocate a new context for the calling thread.
    pub(crate) fn fresh(
        runtime: Arc<R>,
        interpreter: InterpreterHandle,
    ) -> Self {
        let context = if runtime.is_finalizing() {
            NativeContext::Unavailable
        } else {
            match runtime.new_context(interpreter) {
                Ok(context) => NativeContext::Owned(context),
                Err(err) => {
                    warn!(%interpreter, %err, "could not allocate thread context");
                    NativeContext::Unavailable
                }
            }
        };
        Self {
            runtime,
            context,
            owner: thread::current().id(),
            locked: Cell::new(false),
        }
    }

    /// Take the global lock, blocking until it is free.
    ///
    /// # Panics
    ///
    /// When called from a thread other than the owner, or when the calling
    /// thread already holds the lock. Use [`try_acquire_lock`](Self::try_acquire_lock)
    /// to get these as errors instead.
    pub fn acquire_lock(&self) -> LockGuard<'_, R> {
        match self.try_acquire_lock() {
            Ok(guard) => guard,
            Err(violation) => panic!("{}", violation),
        }
    }

    /// Like [`acquire_lock`](Self::acquire_lock), returning misuse as an error.
    pub fn try_acquire_lock(&self) -> Result<LockGuard<'_, R>, AccessViolation> {
        self.check_thread()?;
        if self.locked.get() || self.runtime.holds_lock() {
            return Err(AccessViolation::Reentrant(self.owner));
        }
        Ok(LockGuard::new(
            self.runtime.as_ref(),
            self.context.handle(),
            self.context.origin(),
            &self.locked,
        ))
    }

    /// Thread that created this state.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// How the native context was obtained; `None` if there is none.
    pub fn origin(&self) -> Option<ContextOrigin> {
        self.context.handle().map(|_| self.context.origin())
    }

    /// Whether this state reused the bootstrap context.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self.context, NativeContext::Borrowed(_))
    }

    /// Whether a native context backs this state.
    pub fn is_available(&self) -> bool {
        self.context.handle().is_some()
    }

    pub fn context(&self) -> Option<ContextHandle> {
        self.context.handle()
    }

    pub fn phase(&self) -> ThreadPhase {
        if self.locked.get() {
            ThreadPhase::Locked
        } else {
            ThreadPhase::Active
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    fn check_thread(&self) -> Result<(), AccessViolation> {
        let actual = thread::current().id();
        if actual == self.owner {
            Ok(())
        } else {
            Err(AccessViolation::WrongThread {
                owner: self.owner,
                actual,
            })
        }
    }

    /// Tear down an owned context: bind it under the lock, clear it, delete
    /// it. The thread is left with no current context.
    fn delete_owned(
        &self,
        context: ContextHandle,
    ) {
        if let Err(err) = self.runtime.acquire_thread(context) {
            // AlreadyHeld: another state on this thread holds the lock, and
            // deleting here would release it under that guard.
            warn!(%context, %err, "skipping thread context cleanup, context kept until finalization");
            return;
        }
        if let Err(err) = self.runtime.clear_context(context) {
            error!(%context, %err, "failed to clear thread context");
        }
        match self.runtime.delete_current() {
            Ok(()) => debug!(%context, "thread context deleted"),
            Err(err) => error!(%context, %err, "failed to delete thread context"),
        }
    }
}

impl<R: EmbeddedRuntime> Drop for ThreadState<R> {
    fn drop(&mut self) {
        if let Err(violation) = self.check_thread() {
            if thread::panicking() {
                error!(%violation, "thread state dropped off its owner thread; context leaked");
                return;
            }
            panic!("{}", violation);
        }

        let NativeContext::Owned(context) = self.context else {
            return;
        };
        if self.runtime.is_finalizing() {
            debug!(%context, "runtime finalizing, leaving context to finalization");
            return;
        }
        self.delete_owned(context);
        self.context = NativeContext::Unavailable;
    }
}

impl<R: EmbeddedRuntime> std::fmt::Debug for ThreadState<R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("context", &self.context)
            .field("owner", &self.owner)
            .field("phase", &self.phase())
            .finish()
    }
}
