//! In-process embedded runtime
//!
//! A complete [`EmbeddedRuntime`] whose global execution lock is a
//! `parking_lot` mutex/condvar pair. It keeps a context table, the current
//! context of every attached thread, and counters that let callers observe
//! how many threads were executing runtime code at the same time.
//!
//! Like most embedded interpreters, the finalizing flag stays set after
//! shutdown until the runtime is initialized again.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, trace};

use super::functions::{FunctionRegistry, Globals, Value};
use super::{CallError, ContextHandle, EmbeddedRuntime, InterpreterHandle, RuntimeError};

static GLOBAL_RUNTIME: Lazy<Arc<InProcessRuntime>> = Lazy::new(|| Arc::new(InProcessRuntime::new()));

/// Per-context bookkeeping.
#[derive(Debug, Clone, Copy)]
struct ContextRecord {
    interpreter: InterpreterHandle,
    cleared: bool,
}

/// Everything guarded by the state mutex.
#[derive(Debug, Default)]
struct State {
    /// Live interpreter, `None` before init and after finalize.
    interpreter: Option<InterpreterHandle>,
    /// Thread owning the global execution lock.
    holder: Option<ThreadId>,
    /// Context attached to each thread.
    current: HashMap<ThreadId, ContextHandle>,
    contexts: HashMap<ContextHandle, ContextRecord>,
    next_id: u64,
}

impl State {
    fn next_handle(&mut self) -> NonZeroU64 {
        self.next_id += 1;
        NonZeroU64::new(self.next_id).unwrap_or(NonZeroU64::MIN)
    }
}

/// Counters describing how the runtime has been used.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    calls: AtomicUsize,
    executing: AtomicUsize,
    peak_executing: AtomicUsize,
    lock_acquisitions: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_deleted: AtomicUsize,
}

impl RuntimeStats {
    /// Completed or in-flight function calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Threads executing runtime code right now.
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    /// Highest number of threads ever seen executing runtime code at once.
    pub fn peak_executing(&self) -> usize {
        self.peak_executing.load(Ordering::SeqCst)
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.lock_acquisitions.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn contexts_deleted(&self) -> usize {
        self.contexts_deleted.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ExecutionScope<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_executing.fetch_max(current, Ordering::SeqCst);
        ExecutionScope { stats: self }
    }
}

/// Marks one thread as executing runtime code until dropped.
struct ExecutionScope<'a> {
    stats: &'a RuntimeStats,
}

impl Drop for ExecutionScope<'_> {
    fn drop(&mut self) {
        self.stats.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Embedded runtime living entirely inside this process.
#[derive(Debug)]
pub struct InProcessRuntime {
    state: Mutex<State>,
    lock_released: Condvar,
    finalizing: AtomicBool,
    functions: RwLock<FunctionRegistry>,
    globals: Mutex<Globals>,
    stats: RuntimeStats,
}

impl Default for InProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessRuntime {
    /// Uninitialized runtime with the builtin functions registered.
    pub fn new() -> Self {
        Self::with_functions(FunctionRegistry::with_builtins())
    }

    /// Uninitialized runtime with a custom function table.
    pub fn with_functions(functions: FunctionRegistry) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_released: Condvar::new(),
            finalizing: AtomicBool::new(false),
            functions: RwLock::new(functions),
            globals: Mutex::new(Globals::new()),
            stats: RuntimeStats::default(),
        }
    }

    /// The runtime shared by the whole process.
    pub fn global() -> &'static Arc<InProcessRuntime> {
        &GLOBAL_RUNTIME
    }

    /// Register (or replace) a function.
    pub fn register<F>(
        &self,
        name: impl Into<String>,
        func: F,
    ) where
        F: Fn(&mut Globals, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.write().register(name, func);
    }

    /// Call a runtime function. The calling thread must hold the global lock.
    pub fn call(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<Value, CallError> {
        if self.is_finalizing() {
            return Err(CallError::Finalizing);
        }
        if !self.holds_lock() {
            return Err(CallError::LockNotHeld);
        }
        let function = self
            .functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CallError::UnknownFunction(name.to_string()))?;

        let _scope = self.stats.enter();
        trace!(function = name, "runtime call");
        let mut globals = self.globals.lock();
        function(&mut globals, args).map_err(|message| CallError::Raised {
            function: name.to_string(),
            message,
        })
    }

    /// Read a runtime global without going through the lock.
    pub fn global_value(
        &self,
        name: &str,
    ) -> Option<Value> {
        self.globals.lock().get(name).cloned()
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Contexts that exist right now, bootstrap included.
    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Whether any thread holds the global lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// Thread holding the global lock.
    pub fn lock_holder(&self) -> Option<ThreadId> {
        self.state.lock().holder
    }

    /// Whether a context has been cleared but not yet deleted.
    pub fn is_cleared(
        &self,
        context: ContextHandle,
    ) -> Option<bool> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .map(|record| record.cleared)
    }

    /// Block until the lock is free, then give it to the calling thread with
    /// `context` current.
    fn bind(
        &self,
        context: ContextHandle,
        how: &'static str,
    ) -> Result<(), RuntimeError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if self.is_finalizing() {
            return Err(RuntimeError::Finalizing);
        }
        if !state.contexts.contains_key(&context) {
            return Err(RuntimeError::UnknownContext(context));
        }
        if state.holder == Some(me) {
            return Err(RuntimeError::AlreadyHeld);
        }
        loop {
            if self.is_finalizing() {
                return Err(RuntimeError::Finalizing);
            }
            if state.holder.is_none() {
                break;
            }
            self.lock_released.wait(&mut state);
        }
        // Finalization may have reclaimed the context while we waited.
        if !state.contexts.contains_key(&context) {
            return Err(RuntimeError::UnknownContext(context));
        }
        state.holder = Some(me);
        state.current.insert(me, context);
        self.stats.lock_acquisitions.fetch_add(1, Ordering::SeqCst);
        trace!(%context, how, "global lock taken");
        Ok(())
    }

    fn require_holder(
        &self,
        state: &State,
    ) -> Result<ThreadId, RuntimeError> {
        let me = thread::current().id();
        if state.holder == Some(me) {
            Ok(me)
        } else {
            Err(RuntimeError::LockNotHeld)
        }
    }
}

impl EmbeddedRuntime for InProcessRuntime {
    fn is_initialized(&self) -> bool {
        self.state.lock().interpreter.is_some()
    }

    fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::SeqCst)
    }

    fn initialize(&self) -> Result<(), RuntimeError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.interpreter.is_some() {
            return Err(RuntimeError::AlreadyInitialized);
        }
        // A previous finalize released the lock; nobody can hold it now.
        let interpreter = InterpreterHandle::from_raw(state.next_handle());
        let bootstrap = ContextHandle::from_raw(state.next_handle());
        state.interpreter = Some(interpreter);
        state.contexts.insert(
            bootstrap,
            ContextRecord {
                interpreter,
                cleared: false,
            },
        );
        state.holder = Some(me);
        state.current.insert(me, bootstrap);
        self.finalizing.store(false, Ordering::SeqCst);
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.stats.lock_acquisitions.fetch_add(1, Ordering::SeqCst);
        info!(%interpreter, %bootstrap, "runtime initialized");
        Ok(())
    }

    fn finalize(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if state.interpreter.is_none() {
            return Err(RuntimeError::NotInitialized);
        }
        self.require_holder(&state)?;
        self.finalizing.store(true, Ordering::SeqCst);

        let reclaimed = state.contexts.len();
        state.contexts.clear();
        state.current.clear();
        state.interpreter = None;
        state.holder = None;
        self.stats
            .contexts_deleted
            .fetch_add(reclaimed, Ordering::SeqCst);
        self.globals.lock().clear();
        self.lock_released.notify_all();
        info!(reclaimed, "runtime finalized");
        Ok(())
    }

    fn current_context(&self) -> Option<ContextHandle> {
        let me = thread::current().id();
        self.state.lock().current.get(&me).copied()
    }

    fn interpreter_of(
        &self,
        context: ContextHandle,
    ) -> Option<InterpreterHandle> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .map(|record| record.interpreter)
    }

    fn new_context(
        &self,
        interpreter: InterpreterHandle,
    ) -> Result<ContextHandle, RuntimeError> {
        if self.is_finalizing() {
            return Err(RuntimeError::Finalizing);
        }
        let mut state = self.state.lock();
        if state.interpreter != Some(interpreter) {
            return Err(RuntimeError::NotInitialized);
        }
        let context = ContextHandle::from_raw(state.next_handle());
        state.contexts.insert(
            context,
            ContextRecord {
                interpreter,
                cleared: false,
            },
        );
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        debug!(%context, "context allocated");
        Ok(context)
    }

    fn clear_context(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        self.require_holder(&state)?;
        match state.contexts.get_mut(&context) {
            Some(record) => {
                record.cleared = true;
                Ok(())
            }
            None => Err(RuntimeError::UnknownContext(context)),
        }
    }

    fn swap_context(
        &self,
        context: Option<ContextHandle>,
    ) -> Result<Option<ContextHandle>, RuntimeError> {
        let mut state = self.state.lock();
        let me = self.require_holder(&state)?;
        match context {
            Some(context) => {
                if !state.contexts.contains_key(&context) {
                    return Err(RuntimeError::UnknownContext(context));
                }
                Ok(state.current.insert(me, context))
            }
            None => Ok(state.current.remove(&me)),
        }
    }

    fn delete_current(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let me = self.require_holder(&state)?;
        let context = state
            .current
            .remove(&me)
            .ok_or(RuntimeError::NoCurrentContext)?;
        state.contexts.remove(&context);
        state.holder = None;
        self.stats.contexts_deleted.fetch_add(1, Ordering::SeqCst);
        self.lock_released.notify_one();
        debug!(%context, "context deleted");
        Ok(())
    }

    fn restore_thread(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError> {
        self.bind(context, "restore")
    }

    fn acquire_thread(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError> {
        self.bind(context, "acquire")
    }

    fn release_thread(
        &self,
        context: ContextHandle,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let me = self.require_holder(&state)?;
        if state.current.get(&me) != Some(&context) {
            return Err(RuntimeError::NotCurrent(context));
        }
        state.current.remove(&me);
        state.holder = None;
        self.lock_released.notify_one();
        trace!(%context, "global lock released");
        Ok(())
    }

    fn holds_lock(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }
}
