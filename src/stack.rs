//! Corosensei-based stackful coroutine backing for process isolates.
//!
//! Each process runs as a stackful coroutine with a small dedicated stack.
//! It yields cooperatively -- on a blocking send/receive/broadcast, on
//! sleep, or on an explicit yield -- returning control to the worker thread
//! that is resuming it. As with any stackful coroutine, the coroutine is
//! thread-affine: once started, it can only be resumed from the OS thread
//! that created it (see `scheduler.rs`'s per-worker pinned queue).

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use std::cell::Cell;
use std::sync::Arc;

use crate::process::{Process, ProcessBody};
use crate::runtime::{ProcessContext, Runtime};

/// Coroutine stack size: 64 KiB, matching this workspace's actor runtime.
pub(crate) const STACK_SIZE: usize = 64 * 1024;

thread_local! {
    /// Raw pointer to the active coroutine's `Yielder`, installed just
    /// before the process body runs and consulted by `yield_current`.
    ///
    /// Safety: valid only while the coroutine that installed it is the one
    /// currently executing on this thread.
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// Suspend the currently running process, returning control to the worker
/// loop. The process's `Process` record must already reflect why it is
/// suspending (the caller sets `status` before calling this).
///
/// # Panics
///
/// Panics if called outside of a running coroutine.
pub(crate) fn yield_current() {
    CURRENT_YIELDER.with(|cell| {
        let ptr = cell
            .get()
            .expect("yield_current called outside of a process coroutine");
        // Safety: the pointer was installed by the coroutine currently
        // executing on this thread and is valid for the duration of its body.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        // Another coroutine may have run on this thread while we were
        // suspended and overwritten the thread-local; restore it.
        cell.set(Some(ptr));
    });
}

/// A handle wrapping a corosensei `Coroutine` running one process body.
///
/// `!Send`: corosensei coroutines cannot migrate across OS threads, so this
/// handle never leaves the worker that created it.
pub(crate) struct CoroutineHandle {
    coro: Coroutine<(), (), ()>,
}

impl CoroutineHandle {
    /// Build a coroutine that, once resumed, runs `body` with a fresh
    /// [`ProcessContext`] for `process` on `runtime`.
    pub(crate) fn new(body: ProcessBody, process: Arc<Process>, runtime: Runtime) -> Self {
        let stack = DefaultStack::new(STACK_SIZE).expect("failed to allocate process stack");

        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            CURRENT_YIELDER.with(|cell| {
                cell.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });

            let ctx = ProcessContext::new(runtime, process);
            body(&ctx);
        });

        CoroutineHandle { coro }
    }

    /// Resume the coroutine. Returns `true` if it yielded (still has work
    /// to do), `false` if its body returned (the process is finished).
    ///
    /// Propagates a panic from the process body to the caller, matching
    /// corosensei's behavior of re-raising across the coroutine boundary;
    /// the worker loop wraps this call in `catch_unwind`.
    pub(crate) fn resume(&mut self) -> bool {
        match self.coro.resume(()) {
            CoroutineResult::Yield(()) => true,
            CoroutineResult::Return(()) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn coroutine_runs_to_completion_without_yielding() {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let runtime = Runtime::new(1);
        let process = Process::new(ProcessId::next(), false);

        let body: ProcessBody = Arc::new(|_ctx: &ProcessContext| {
            COUNTER.fetch_add(1, Ordering::SeqCst);
        });
        let mut handle = CoroutineHandle::new(body, process, runtime.clone());
        assert!(!handle.resume());
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }

    #[test]
    fn coroutine_yields_then_completes() {
        let runtime = Runtime::new(1);
        let process = Process::new(ProcessId::next(), false);

        let body: ProcessBody = Arc::new(|_ctx: &ProcessContext| {
            yield_current();
        });
        let mut handle = CoroutineHandle::new(body, process, runtime.clone());
        assert!(handle.resume());
        assert!(!handle.resume());
        runtime.shutdown();
    }
}
