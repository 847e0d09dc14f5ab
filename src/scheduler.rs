//! Worker pool, ready-queue, and process lifecycle bookkeeping.
//!
//! A single shared FIFO (`ready`) is the entry point for every process that
//! has never yet run. Once a coroutine has started, it is pinned to the
//! worker that first resumed it -- corosensei's stackful coroutines cannot
//! migrate across OS threads -- so each worker additionally keeps a local
//! FIFO of its own previously-dispatched, still-runnable processes
//! (`parked`, built in `worker_loop`). A worker polls that local set every
//! iteration rather than being notified, the same style this workspace's
//! own actor scheduler uses for its `suspended` list.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::process::{Process, ProcessBody, Status};
use crate::runtime::{Runtime, RuntimeInner};
use crate::stack::CoroutineHandle;

/// A never-yet-started process waiting for a worker to create its
/// coroutine and run it for the first time.
struct SpawnRequest {
    process: Arc<Process>,
    body: ProcessBody,
}

/// Backoff schedule for an idle worker, matching this workspace's own
/// actor scheduler: spin briefly, then back off to microsecond, then
/// millisecond sleeps.
const SPIN_THRESHOLD: u32 = 100;
const BACKOFF_THRESHOLD: u32 = 1000;

pub(crate) struct Scheduler {
    ready: Mutex<VecDeque<SpawnRequest>>,
    worker_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Outstanding teardown tickets; each worker consumes at most one per
    /// loop iteration before exiting. First-come-first-served: concurrent
    /// `set_workers` calls interleave ticket increments and spawns under
    /// the same `worker_handles` lock, so the net effect matches whatever
    /// the counter's final value implies.
    teardown: AtomicUsize,
    active_count: AtomicU64,
    quiescence_lock: Mutex<()>,
    quiescence_cv: Condvar,
    recycle_pool: Mutex<VecDeque<Arc<Process>>>,
    recycle_cap: AtomicUsize,
    /// Set once, immediately after the owning `RuntimeInner` is wrapped in
    /// an `Arc`, so worker threads can build a `ProcessContext`. Breaks the
    /// ownership cycle `RuntimeInner -> Scheduler -> RuntimeInner`.
    runtime: OnceLock<Weak<RuntimeInner>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler {
            ready: Mutex::new(VecDeque::new()),
            worker_handles: Mutex::new(Vec::new()),
            teardown: AtomicUsize::new(0),
            active_count: AtomicU64::new(0),
            quiescence_lock: Mutex::new(()),
            quiescence_cv: Condvar::new(),
            recycle_pool: Mutex::new(VecDeque::new()),
            recycle_cap: AtomicUsize::new(0),
            runtime: OnceLock::new(),
        }
    }

    pub(crate) fn bind_runtime(&self, runtime: Weak<RuntimeInner>) {
        self.runtime
            .set(runtime)
            .unwrap_or_else(|_| panic!("Scheduler::bind_runtime called twice"));
    }

    fn runtime_handle(&self) -> Runtime {
        self.runtime
            .get()
            .expect("scheduler used before bind_runtime")
            .upgrade()
            .map(Runtime::from_inner)
            .expect("runtime dropped while its scheduler is still running")
    }

    pub(crate) fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.prune_finished_workers();
        self.worker_handles.lock().len()
    }

    /// Drop join handles for workers that have already exited a teardown.
    /// Without this, a worker that honored a teardown ticket would stay
    /// counted forever (its `JoinHandle` just sits in the vector until the
    /// final `shutdown`), so a later `set_workers` would undercount how many
    /// threads to spawn.
    fn prune_finished_workers(&self) {
        self.worker_handles.lock().retain(|h| !h.is_finished());
    }

    pub(crate) fn recycle_cap(&self) -> usize {
        self.recycle_cap.load(Ordering::SeqCst)
    }

    /// Set the recycle pool's cap, trimming the pool down to size if it
    /// just shrank.
    pub(crate) fn set_recycle_cap(&self, cap: usize) {
        self.recycle_cap.store(cap, Ordering::SeqCst);
        let mut pool = self.recycle_pool.lock();
        while pool.len() > cap {
            pool.pop_back();
        }
    }

    /// Draw a process from the recycle pool, or hand back `None` so the
    /// caller constructs a fresh one.
    pub(crate) fn take_recycled(&self) -> Option<Arc<Process>> {
        if self.recycle_cap() == 0 {
            return None;
        }
        self.recycle_pool.lock().pop_front()
    }

    fn try_recycle(&self, process: Arc<Process>) {
        let cap = self.recycle_cap();
        if cap == 0 {
            return;
        }
        let mut pool = self.recycle_pool.lock();
        if pool.len() < cap {
            process.reset_for_recycle();
            pool.push_back(process);
        }
    }

    /// Enqueue a never-yet-started process and mark it active.
    pub(crate) fn enqueue(&self, process: Arc<Process>, body: ProcessBody) {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        self.ready.lock().push_back(SpawnRequest { process, body });
    }

    fn dec_active(&self) {
        let previous = self.active_count.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            let _guard = self.quiescence_lock.lock();
            self.quiescence_cv.notify_all();
        }
    }

    /// Block until no process is active. Re-checks the predicate in a loop
    /// around the condition wait (rather than a single check) to tolerate
    /// spurious wake-ups and a re-increment racing the wait.
    pub(crate) fn wait(&self) {
        let mut guard = self.quiescence_lock.lock();
        while self.active_count() != 0 {
            self.quiescence_cv.wait(&mut guard);
        }
    }

    /// Grow or schedule a shrink of the worker pool to `n` threads.
    pub(crate) fn set_workers(&self, n: usize) -> Result<(), crate::error::RuntimeError> {
        if n == 0 {
            return Err(crate::error::RuntimeError::InvalidArgument(
                "worker count must be positive".to_string(),
            ));
        }
        self.prune_finished_workers();
        let mut handles = self.worker_handles.lock();
        let current = handles.len();
        if n > current {
            for _ in 0..(n - current) {
                let runtime = self.runtime_handle();
                let handle = std::thread::Builder::new()
                    .name("lucaproc-worker".to_string())
                    .spawn(move || worker_loop(runtime))
                    .map_err(|e| {
                        crate::error::RuntimeError::WorkerSpawnFailure(e.to_string())
                    })?;
                handles.push(handle);
            }
        } else if n < current {
            self.teardown.fetch_add(current - n, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Drain active processes, request every worker tear down, and join
    /// them all.
    pub(crate) fn shutdown(&self) {
        self.wait();
        let handles: Vec<_> = {
            let mut handles = self.worker_handles.lock();
            self.teardown.fetch_add(handles.len(), Ordering::SeqCst);
            handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Consume one teardown ticket if any are outstanding.
    fn take_teardown_ticket(&self) -> bool {
        self.teardown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                if t > 0 {
                    Some(t - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn pop_ready(&self) -> Option<SpawnRequest> {
        self.ready.lock().pop_front()
    }
}

/// The main loop for each worker thread.
fn worker_loop(runtime: Runtime) {
    let mut parked: VecDeque<(Arc<Process>, CoroutineHandle)> = VecDeque::new();
    let mut draining = false;
    let mut spin_count: u32 = 0;

    loop {
        let mut did_work = false;

        // Phase 1: poll parked (previously-dispatched) processes.
        let mut still_parked = VecDeque::with_capacity(parked.len());
        for (process, mut handle) in parked.drain(..) {
            let runnable = match process.status() {
                Status::Ready => true,
                Status::BlockedSleep => match process.wake_up() {
                    Some(deadline) if Instant::now() >= deadline => {
                        process.set_status(Status::Ready);
                        true
                    }
                    _ => false,
                },
                _ => false,
            };

            if !runnable {
                still_parked.push_back((process, handle));
                continue;
            }

            did_work = true;
            process.set_status(Status::Running);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handle.resume()));
            match outcome {
                Ok(true) => still_parked.push_back((process, handle)),
                Ok(false) => finish_process_clean(&runtime, &process),
                Err(payload) => {
                    report_process_panic(&process, payload);
                    finish_process_errored(&runtime, &process);
                }
            }
        }
        parked = still_parked;

        // Phase 2: dispatch a new, never-yet-started process -- unless
        // this worker is draining toward a `set_workers` shrink.
        if !draining {
            if let Some(request) = runtime.inner().scheduler.pop_ready() {
                did_work = true;
                let process = Arc::clone(&request.process);
                process.set_status(Status::Running);
                let mut handle =
                    CoroutineHandle::new(request.body, Arc::clone(&process), runtime.clone());
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handle.resume()));
                match outcome {
                    Ok(true) => parked.push_back((process, handle)),
                    Ok(false) => finish_process_clean(&runtime, &process),
                    Err(payload) => {
                        report_process_panic(&process, payload);
                        finish_process_errored(&runtime, &process);
                    }
                }
            }
        }

        // Phase 3: honor an outstanding teardown ticket once our own
        // pinned processes have drained; an in-flight coroutine cannot be
        // handed to another worker, so we finish what we already started
        // before exiting.
        if !draining && runtime.inner().scheduler.take_teardown_ticket() {
            draining = true;
        }
        if draining && parked.is_empty() {
            break;
        }

        if !did_work {
            spin_count += 1;
            if spin_count > BACKOFF_THRESHOLD {
                std::thread::sleep(Duration::from_millis(1));
            } else if spin_count > SPIN_THRESHOLD {
                std::thread::sleep(Duration::from_micros(100));
            } else {
                std::hint::spin_loop();
            }
        } else {
            spin_count = 0;
        }
    }
}

/// Clean completion: the process is eligible for recycling.
fn finish_process_clean(runtime: &Runtime, process: &Arc<Process>) {
    process.set_status(Status::Finished);
    let scheduler = &runtime.inner().scheduler;
    scheduler.try_recycle(Arc::clone(process));
    scheduler.dec_active();
}

/// The process body panicked: its isolate is closed -- the coroutine
/// handle is simply dropped by the caller -- and never handed to the
/// recycle pool.
fn finish_process_errored(runtime: &Runtime, process: &Arc<Process>) {
    process.set_status(Status::Finished);
    runtime.inner().scheduler.dec_active();
}

fn report_process_panic(process: &Arc<Process>, payload: Box<dyn std::any::Any + Send>) {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "process body panicked".to_string()
    };
    eprintln!("lucaproc: process {} terminated: {}", process.id, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc as StdArc;

    #[test]
    fn quiescence_returns_once_all_processes_finish() {
        let runtime = Runtime::new(2);
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        for _ in 0..20 {
            runtime
                .newproc(
                    StdArc::new(|_ctx: &crate::runtime::ProcessContext| {
                        COUNTER.fetch_add(1, Ordering::SeqCst);
                    }),
                    Vec::new(),
                )
                .unwrap();
        }
        runtime.wait();
        assert_eq!(runtime.inner().scheduler.active_count(), 0);
        assert!(COUNTER.load(Ordering::SeqCst) >= 20);
        runtime.shutdown();
    }

    #[test]
    fn set_workers_grows_and_shrinks() {
        let runtime = Runtime::new(1);
        assert_eq!(runtime.inner().scheduler.num_workers(), 1);
        runtime.set_num_workers(3).unwrap();
        assert_eq!(runtime.inner().scheduler.num_workers(), 3);
        runtime.shutdown();
    }

    #[test]
    fn recycle_pool_reuses_process_records() {
        let runtime = Runtime::new(1);
        runtime.set_recycle(2);
        for _ in 0..5 {
            runtime
                .newproc(StdArc::new(|_ctx: &crate::runtime::ProcessContext| {}), Vec::new())
                .unwrap();
            runtime.wait();
        }
        runtime.shutdown();
    }

    #[test]
    fn panicking_process_does_not_hang_the_pool() {
        let runtime = Runtime::new(2);
        runtime
            .newproc(
                StdArc::new(|_ctx: &crate::runtime::ProcessContext| {
                    panic!("boom");
                }),
                Vec::new(),
            )
            .unwrap();
        runtime.wait();
        runtime.shutdown();
    }
}
