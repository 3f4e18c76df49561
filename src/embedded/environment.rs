//! Runtime lifecycle ownership

use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::thread_state::ThreadState;
use crate::runtime::{ContextHandle, EmbeddedRuntime, InProcessRuntime, InterpreterHandle, RuntimeError};

static INSTANCE: OnceCell<RuntimeEnvironment<InProcessRuntime>> = OnceCell::new();

/// Failure to bring up an environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to initialize the embedded runtime: {0}")]
    Initialize(#[source] RuntimeError),
    #[error("failed to release the global lock after initialization: {0}")]
    Release(#[source] RuntimeError),
}

/// Owner of the embedded runtime's lifecycle.
///
/// Construction initializes the runtime (unless the host already did) and
/// releases the global lock so other threads can start. Dropping it finalizes
/// the runtime, but only when this environment initialized it, only on the
/// thread that created it, and only if nothing else started finalization.
///
/// Worker threads borrow the environment to get a [`ThreadState`] and must
/// drop their thread states before the environment goes away.
#[derive(Debug)]
pub struct RuntimeEnvironment<R: EmbeddedRuntime = InProcessRuntime> {
    runtime: Arc<R>,
    bootstrap: Option<ContextHandle>,
    owns_lifecycle: bool,
    creator: ThreadId,
}

impl RuntimeEnvironment<InProcessRuntime> {
    /// The process-wide environment over [`InProcessRuntime::global`].
    ///
    /// Built on first use, from whichever thread gets here first. It lives for
    /// the rest of the process and never finalizes the runtime; construct an
    /// environment with [`RuntimeEnvironment::new`] when teardown order matters.
    pub fn get_instance() -> &'static Self {
        INSTANCE.get_or_init(|| {
            let runtime = Arc::clone(InProcessRuntime::global());
            match Self::new(Arc::clone(&runtime)) {
                Ok(env) => env,
                Err(err) => {
                    error!(%err, "process-wide runtime unavailable");
                    Self::detached(runtime)
                }
            }
        })
    }
}

impl<R: EmbeddedRuntime> RuntimeEnvironment<R> {
    /// Initialize `runtime`, or adopt it if the host already initialized it.
    pub fn new(runtime: Arc<R>) -> Result<Self, EnvironmentError> {
        let creator = thread::current().id();

        if runtime.is_initialized() {
            let bootstrap = runtime.current_context();
            info!(
                bootstrap = ?bootstrap,
                "runtime already initialized by host, adopting it"
            );
            return Ok(Self {
                runtime,
                bootstrap,
                owns_lifecycle: false,
                creator,
            });
        }

        runtime.initialize().map_err(EnvironmentError::Initialize)?;
        let bootstrap = runtime.current_context();
        if let Some(context) = bootstrap {
            // Hand the lock back so worker threads can proceed.
            runtime
                .release_thread(context)
                .map_err(EnvironmentError::Release)?;
        }
        debug!(bootstrap = ?bootstrap, "environment ready");

        Ok(Self {
            runtime,
            bootstrap,
            owns_lifecycle: true,
            creator,
        })
    }

    /// Environment with no usable runtime; every thread state request fails.
    fn detached(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            bootstrap: None,
            owns_lifecycle: false,
            creator: thread::current().id(),
        }
    }

    /// Handle for the calling thread, or `None` if the runtime is finalizing
    /// or was never initialized.
    ///
    /// The creating thread gets the bootstrap context back; every other thread
    /// gets a context of its own.
    pub fn create_thread_state(&self) -> Option<ThreadState<R>> {
        if self.runtime.is_finalizing() {
            debug!("runtime finalizing, no thread state");
            return None;
        }
        let bootstrap = self.bootstrap?;

        if thread::current().id() == self.creator {
            return Some(ThreadState::borrowed(Arc::clone(&self.runtime), bootstrap));
        }

        let Some(interpreter) = self.runtime.interpreter_of(bootstrap) else {
            warn!(%bootstrap, "bootstrap context is gone, no thread state");
            return None;
        };
        Some(ThreadState::fresh(Arc::clone(&self.runtime), interpreter))
    }

    /// Interpreter all thread states are attached to.
    pub fn interpreter(&self) -> Option<InterpreterHandle> {
        self.bootstrap
            .and_then(|context| self.runtime.interpreter_of(context))
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn bootstrap_context(&self) -> Option<ContextHandle> {
        self.bootstrap
    }

    /// Whether this environment initialized the runtime and will finalize it.
    pub fn owns_lifecycle(&self) -> bool {
        self.owns_lifecycle
    }

    pub fn creator(&self) -> ThreadId {
        self.creator
    }
}

impl<R: EmbeddedRuntime> Drop for RuntimeEnvironment<R> {
    fn drop(&mut self) {
        if !self.owns_lifecycle {
            return;
        }
        let Some(bootstrap) = self.bootstrap else {
            return;
        };
        if self.runtime.is_finalizing() {
            debug!("runtime already finalizing");
            return;
        }
        if thread::current().id() != self.creator {
            error!("environment dropped off its creator thread, runtime left running");
            return;
        }

        // Shutdown expects the lock held with the bootstrap context current.
        if let Err(err) = self.runtime.restore_thread(bootstrap) {
            error!(%err, "could not reacquire the global lock, runtime left running");
            return;
        }
        match self.runtime.finalize() {
            Ok(()) => info!("runtime finalized"),
            Err(err) => {
                error!(%err, "runtime finalization failed");
                if let Err(err) = self.runtime.release_thread(bootstrap) {
                    error!(%err, "failed to release global lock");
                }
            }
        }
    }
}
