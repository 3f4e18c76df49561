//! Scoped ownership of the global execution lock

use std::cell::Cell;
use std::marker::PhantomData;

use tracing::{debug, error, warn};

use crate::runtime::{ContextHandle, EmbeddedRuntime, InProcessRuntime};

/// How a thread state came by its native context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOrigin {
    /// The runtime's bootstrap context, reused on the thread that initialized it.
    Bootstrap,
    /// A context allocated for this thread alone.
    Fresh,
}

/// Exclusive hold on the runtime's global execution lock.
///
/// Produced by [`ThreadState::acquire_lock`](super::ThreadState::acquire_lock)
/// and released when dropped, including while unwinding. A guard made while
/// the runtime was unavailable is *inert*: it never touched the lock, and
/// runtime calls made under it fail on their own.
///
/// Guards are neither `Clone` nor `Send`, and borrow the thread state that
/// produced them, so a hold can never change hands.
#[must_use = "the global lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, R: EmbeddedRuntime = InProcessRuntime> {
    runtime: &'a R,
    binding: Option<(ContextHandle, ContextOrigin)>,
    held: &'a Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, R: EmbeddedRuntime> LockGuard<'a, R> {
    /// Take the lock for `context`, or build an inert guard if there is no
    /// context or the runtime is finalizing.
    pub(crate) fn new(
        runtime: &'a R,
        context: Option<ContextHandle>,
        origin: ContextOrigin,
        held: &'a Cell<bool>,
    ) -> Self {
        let inert = Self {
            runtime,
            binding: None,
            held,
            _not_send: PhantomData,
        };
        let Some(context) = context else {
            debug!("no native context, guard is inert");
            return inert;
        };
        if runtime.is_finalizing() {
            debug!(%context, "runtime finalizing, guard is inert");
            return inert;
        }

        let bound = match origin {
            ContextOrigin::Bootstrap => runtime.restore_thread(context),
            ContextOrigin::Fresh => runtime.acquire_thread(context),
        };
        if let Err(err) = bound {
            warn!(%context, %err, "global lock not taken, guard is inert");
            return inert;
        }

        held.set(true);
        let mut guard = inert;
        guard.binding = Some((context, origin));
        guard
    }

    /// Whether this guard skipped locking altogether.
    pub fn is_inert(&self) -> bool {
        self.binding.is_none()
    }

    /// Context made current by this guard.
    pub fn context(&self) -> Option<ContextHandle> {
        self.binding.map(|(context, _)| context)
    }

    pub fn origin(&self) -> Option<ContextOrigin> {
        self.binding.map(|(_, origin)| origin)
    }

    pub fn runtime(&self) -> &'a R {
        self.runtime
    }
}

impl<R: EmbeddedRuntime> Drop for LockGuard<'_, R> {
    fn drop(&mut self) {
        let Some((context, _)) = self.binding.take() else {
            return;
        };
        self.held.set(false);
        if self.runtime.is_finalizing() {
            return;
        }
        if let Err(err) = self.runtime.release_thread(context) {
            error!(%context, %err, "failed to release global lock");
        }
    }
}

impl<R: EmbeddedRuntime> std::fmt::Debug for LockGuard<'_, R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("binding", &self.binding)
            .finish()
    }
}
