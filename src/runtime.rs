//! The public runtime handle and the process-facing API surface it hands
//! to a running process body.
//!
//! Every blocking primitive (`send`, `receive`, `broadcast`, `sleep`) is
//! implemented once, as a private `*_impl` free function parameterized by
//! an explicit `&Arc<Process>` standing in for "the caller". `Runtime`'s
//! methods pass the host sentinel; `ProcessContext`'s methods pass the
//! process's own record. The two differ only in how they block: the host
//! waits on a dedicated condition variable, a process yields its coroutine.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::process::{Process, ProcessBody, ProcessId, Status};
use crate::rate::RateHandle;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::stack::yield_current;
use crate::value::{copy_values, Value};

/// Shared runtime state. Reachable only through a [`Runtime`] handle --
/// there is no module-level singleton anywhere in this crate.
pub(crate) struct RuntimeInner {
    pub(crate) registry: Registry,
    pub(crate) scheduler: Scheduler,
    host: Arc<Process>,
    host_lock: Mutex<()>,
    host_cv: Condvar,
}

impl RuntimeInner {
    /// Deliver a result to `process` and, if it is the host sentinel,
    /// wake the host thread's condition wait.
    fn wake(&self, process: &Arc<Process>, result: Result<Vec<Value>, RuntimeError>) {
        process.deliver_result(result);
        if process.is_host {
            let _guard = self.host_lock.lock();
            self.host_cv.notify_all();
        }
    }

    /// Block the caller (`me`) until a result has been delivered for it.
    /// The host thread parks on `host_cv`; a process yields its coroutine
    /// and is resumed by its worker once `wake` has set its status Ready.
    fn block_until_result(&self, me: &Arc<Process>) -> Result<Vec<Value>, RuntimeError> {
        if me.is_host {
            let mut guard = self.host_lock.lock();
            loop {
                if let Some(result) = me.take_result() {
                    return result;
                }
                self.host_cv.wait(&mut guard);
            }
        } else {
            yield_current();
            me.take_result()
                .expect("process resumed without a delivered result")
        }
    }
}

/// An explicit, cloneable handle onto one runtime instance. Several
/// independent runtimes may coexist in one process; nothing is shared
/// between them.
pub struct Runtime(Arc<RuntimeInner>);

impl Clone for Runtime {
    fn clone(&self) -> Self {
        Runtime(Arc::clone(&self.0))
    }
}

impl Runtime {
    /// Build a runtime with `n` worker threads already running.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero or the initial worker threads cannot be
    /// spawned; unlike `set_num_workers`, construction has no existing
    /// runtime to report the failure through.
    pub fn new(n: usize) -> Runtime {
        let inner = Arc::new(RuntimeInner {
            registry: Registry::new(),
            scheduler: Scheduler::new(),
            host: Process::new(ProcessId::HOST, true),
            host_lock: Mutex::new(()),
            host_cv: Condvar::new(),
        });
        inner.scheduler.bind_runtime(Arc::downgrade(&inner));
        inner
            .scheduler
            .set_workers(n)
            .expect("failed to start initial worker pool");
        Runtime(inner)
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Runtime {
        Runtime(inner)
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.0
    }

    /// Spawn a new process running `body`, passing `args` as its initial
    /// received arguments (retrievable via `ProcessContext::args`).
    pub fn newproc(&self, body: ProcessBody, args: Vec<Value>) -> Result<(), RuntimeError> {
        let args = copy_values(args)?;
        let process = self
            .inner()
            .scheduler
            .take_recycled()
            .unwrap_or_else(|| Process::new(ProcessId::next(), false));
        process.set_pending_args(args);
        process.set_status(Status::Idle);
        self.inner().scheduler.enqueue(process, body);
        Ok(())
    }

    /// Create a channel. Errs with `AlreadyExists` if `name` is taken.
    pub fn newchannel(&self, name: &str) -> Result<(), RuntimeError> {
        self.inner().registry.create(name)
    }

    /// Destroy a channel, waking every parked sender and receiver with a
    /// `Destroyed` error.
    pub fn delchannel(&self, name: &str) -> Result<(), RuntimeError> {
        let inner = self.inner();
        inner
            .registry
            .destroy(name, |proc, err| inner.wake(proc, Err(err)))
    }

    pub fn isopen(&self, name: &str) -> bool {
        self.inner().registry.is_open(name)
    }

    /// Blocking send from the host thread.
    pub fn send(&self, name: &str, values: Vec<Value>) -> Result<(), RuntimeError> {
        send_impl(self.inner(), &self.inner().host, name, values)
    }

    /// Blocking (or, if `is_async`, non-blocking) receive from the host
    /// thread.
    pub fn receive(&self, name: &str, is_async: bool) -> Result<Vec<Value>, RuntimeError> {
        receive_impl(self.inner(), &self.inner().host, name, is_async)
    }

    /// Send `values` to every receiver currently parked on `name`.
    ///
    /// If the payload fails to copy, every parked receiver that would
    /// have received it is left scheduled with the same error delivered
    /// to it instead -- it is not re-parked -- and this call returns the
    /// error too; which specific receiver (if several were parked) "saw"
    /// the failure first is not reported.
    pub fn broadcast(&self, name: &str, values: Vec<Value>) -> Result<(), RuntimeError> {
        broadcast_impl(self.inner(), name, values)
    }

    /// Block the host thread for `duration`.
    pub fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Block the host thread until `rate`'s next deadline, drift-free.
    pub fn sleep_rate(&self, rate: &RateHandle) {
        std::thread::sleep(rate.advance());
    }

    /// Build a rate handle for drift-free periodic sleep.
    pub fn period(&self, period: Duration) -> Result<RateHandle, RuntimeError> {
        make_rate_handle(period)
    }

    pub fn set_num_workers(&self, n: usize) -> Result<(), RuntimeError> {
        self.inner().scheduler.set_workers(n)
    }

    pub fn get_num_workers(&self) -> usize {
        self.inner().scheduler.num_workers()
    }

    /// Set the recycle pool's cap; trims the pool immediately if it just
    /// shrank below its current size.
    pub fn set_recycle(&self, n: usize) {
        self.inner().scheduler.set_recycle_cap(n);
    }

    pub fn get_recycle(&self) -> usize {
        self.inner().scheduler.recycle_cap()
    }

    /// Block until no process is active (every `newproc`'d process has
    /// finished or errored).
    pub fn wait(&self) {
        self.inner().scheduler.wait();
    }

    /// Drain active processes and tear down every worker thread. The
    /// runtime is unusable afterward; drop the handle once this returns.
    pub fn shutdown(&self) {
        self.inner().scheduler.shutdown();
    }
}

fn make_rate_handle(period: Duration) -> Result<RateHandle, RuntimeError> {
    if period.is_zero() {
        return Err(RuntimeError::InvalidArgument(
            "period must be positive".to_string(),
        ));
    }
    Ok(RateHandle::new(period))
}

/// The callback interface a process body receives. Every method here is
/// the process-yielding counterpart of the identically-named `Runtime`
/// method: blocking calls suspend the process's coroutine rather than an
/// OS thread.
pub struct ProcessContext {
    runtime: Runtime,
    process: Arc<Process>,
}

impl ProcessContext {
    pub(crate) fn new(runtime: Runtime, process: Arc<Process>) -> Self {
        ProcessContext { runtime, process }
    }

    /// A clone of the runtime handle this process is running under.
    pub fn runtime(&self) -> Runtime {
        self.runtime.clone()
    }

    pub fn id(&self) -> ProcessId {
        self.process.id
    }

    /// Take this process's currently pending arguments (set by `newproc`
    /// or by a completed `send`/`receive` rendezvous).
    pub fn args(&self) -> Vec<Value> {
        self.process.take_pending_args()
    }

    pub fn newproc(&self, body: ProcessBody, args: Vec<Value>) -> Result<(), RuntimeError> {
        self.runtime.newproc(body, args)
    }

    pub fn newchannel(&self, name: &str) -> Result<(), RuntimeError> {
        self.runtime.inner().registry.create(name)
    }

    pub fn delchannel(&self, name: &str) -> Result<(), RuntimeError> {
        self.runtime.delchannel(name)
    }

    pub fn isopen(&self, name: &str) -> bool {
        self.runtime.isopen(name)
    }

    pub fn send(&self, name: &str, values: Vec<Value>) -> Result<(), RuntimeError> {
        send_impl(self.runtime.inner(), &self.process, name, values)
    }

    pub fn receive(&self, name: &str, is_async: bool) -> Result<Vec<Value>, RuntimeError> {
        receive_impl(self.runtime.inner(), &self.process, name, is_async)
    }

    pub fn broadcast(&self, name: &str, values: Vec<Value>) -> Result<(), RuntimeError> {
        broadcast_impl(self.runtime.inner(), name, values)
    }

    /// Suspend this process until `duration` has elapsed.
    pub fn sleep(&self, duration: Duration) {
        self.process.set_wake_up(Instant::now() + duration);
        self.process.set_status(Status::BlockedSleep);
        yield_current();
    }

    /// Suspend this process until `rate`'s next deadline, drift-free.
    pub fn sleep_rate(&self, rate: &RateHandle) {
        self.sleep(rate.advance());
    }

    pub fn period(&self, period: Duration) -> Result<RateHandle, RuntimeError> {
        make_rate_handle(period)
    }

    /// Cooperatively yield, re-joining the tail of this process's
    /// worker's runnable set without blocking on anything.
    pub fn yield_now(&self) {
        self.process.set_status(Status::Ready);
        yield_current();
    }
}

enum SendOutcome {
    Matched(Arc<Process>, Vec<Value>),
    Parked,
}

fn send_impl(
    inner: &RuntimeInner,
    me: &Arc<Process>,
    name: &str,
    values: Vec<Value>,
) -> Result<(), RuntimeError> {
    let parking = Arc::clone(me);
    let (_chan, outcome) = inner.registry.with_channel(name, move |chan, state| {
        if let Some(receiver) = state.recv_queue.pop_front() {
            SendOutcome::Matched(receiver, values)
        } else {
            // Fields must be set while the channel lock is still held: a
            // matching receive on another thread can pop this process off
            // `send_queue` the instant it is pushed, and must observe a
            // consistent BlockedSend/channel pair rather than whatever this
            // thread last wrote before acquiring the lock.
            parking.set_pending_args(values);
            parking.set_channel(Some(Arc::clone(chan)));
            parking.set_status(Status::BlockedSend);
            state.send_queue.push_back(Arc::clone(&parking));
            SendOutcome::Parked
        }
    })?;

    match outcome {
        SendOutcome::Matched(receiver, values) => match copy_values(values) {
            Ok(copied) => {
                inner.wake(&receiver, Ok(copied));
                Ok(())
            }
            Err(err) => {
                inner.wake(&receiver, Err(err.clone()));
                Err(err)
            }
        },
        SendOutcome::Parked => inner.block_until_result(me).map(|_| ()),
    }
}

enum RecvOutcome {
    Matched(Arc<Process>, Vec<Value>),
    Parked,
    AsyncEmpty,
}

fn receive_impl(
    inner: &RuntimeInner,
    me: &Arc<Process>,
    name: &str,
    is_async: bool,
) -> Result<Vec<Value>, RuntimeError> {
    let parking = Arc::clone(me);
    let (_chan, outcome) = inner.registry.with_channel(name, move |chan, state| {
        if let Some(sender) = state.send_queue.pop_front() {
            let values = sender.take_pending_args();
            RecvOutcome::Matched(sender, values)
        } else if is_async {
            RecvOutcome::AsyncEmpty
        } else {
            // See the matching comment in `send_impl`: these fields must be
            // set before the process becomes visible on `recv_queue`, not
            // after this closure (and the channel lock) returns.
            parking.set_channel(Some(Arc::clone(chan)));
            parking.set_status(Status::BlockedRecv);
            state.recv_queue.push_back(Arc::clone(&parking));
            RecvOutcome::Parked
        }
    })?;

    match outcome {
        RecvOutcome::Matched(sender, values) => match copy_values(values) {
            Ok(copied) => {
                inner.wake(&sender, Ok(Vec::new()));
                Ok(copied)
            }
            Err(err) => {
                inner.wake(&sender, Err(err.clone()));
                Err(err)
            }
        },
        RecvOutcome::AsyncEmpty => Err(RuntimeError::no_senders_waiting(name)),
        RecvOutcome::Parked => inner.block_until_result(me),
    }
}

fn broadcast_impl(
    inner: &RuntimeInner,
    name: &str,
    values: Vec<Value>,
) -> Result<(), RuntimeError> {
    let (_chan, receivers) = inner
        .registry
        .with_channel(name, |_chan, state| std::mem::take(&mut state.recv_queue))?;

    if receivers.is_empty() {
        return Err(RuntimeError::no_receivers_waiting(name));
    }

    match copy_values(values) {
        Ok(copied) => {
            for receiver in &receivers {
                inner.wake(receiver, Ok(copied.clone()));
            }
            Ok(())
        }
        Err(err) => {
            for receiver in &receivers {
                inner.wake(receiver, Err(err.clone()));
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn ping_pong_over_a_named_channel() {
        let runtime = Runtime::new(2);
        runtime.newchannel("c").unwrap();
        let producer = runtime.clone();
        runtime
            .newproc(
                Arc::new(move |ctx: &ProcessContext| {
                    ctx.send("c", vec![Value::Int(42)]).unwrap();
                }),
                Vec::new(),
            )
            .unwrap();
        let _ = &producer;
        let received = runtime.receive("c", false).unwrap();
        assert_eq!(received, vec![Value::Int(42)]);
        runtime.wait();
        runtime.shutdown();
    }

    #[test]
    fn async_receive_with_no_senders_errors_immediately() {
        let runtime = Runtime::new(1);
        runtime.newchannel("c").unwrap();
        let err = runtime.receive("c", true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no senders waiting on channel 'c'"
        );
        runtime.shutdown();
    }

    #[test]
    fn destroy_unblocks_a_parked_receiver() {
        let runtime = Runtime::new(2);
        runtime.newchannel("c").unwrap();
        static RESULT: Mutex<Option<String>> = Mutex::new(None);
        runtime
            .newproc(
                Arc::new(|ctx: &ProcessContext| match ctx.receive("c", false) {
                    Ok(_) => *RESULT.lock() = Some("ok".to_string()),
                    Err(e) => *RESULT.lock() = Some(e.to_string()),
                }),
                Vec::new(),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        runtime.delchannel("c").unwrap();
        runtime.wait();
        assert_eq!(
            RESULT.lock().as_deref(),
            Some("channel 'c' destroyed while waiting for sender")
        );
        runtime.shutdown();
    }

    #[test]
    fn broadcast_reaches_every_parked_receiver() {
        let runtime = Runtime::new(3);
        runtime.newchannel("c").unwrap();
        static SEEN: AtomicI64 = AtomicI64::new(0);
        for _ in 0..3 {
            runtime
                .newproc(
                    Arc::new(|ctx: &ProcessContext| {
                        if let Ok(values) = ctx.receive("c", false) {
                            if values == vec![Value::Int(7)] {
                                SEEN.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }),
                    Vec::new(),
                )
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        runtime.broadcast("c", vec![Value::Int(7)]).unwrap();
        runtime.wait();
        assert_eq!(SEEN.load(Ordering::SeqCst), 3);
        runtime.shutdown();
    }

    #[test]
    fn unsupported_value_is_symmetric() {
        let runtime = Runtime::new(2);
        runtime.newchannel("c").unwrap();
        static RESULT: Mutex<Option<String>> = Mutex::new(None);
        runtime
            .newproc(
                Arc::new(|ctx: &ProcessContext| match ctx.receive("c", false) {
                    Ok(_) => *RESULT.lock() = Some("ok".to_string()),
                    Err(e) => *RESULT.lock() = Some(e.to_string()),
                }),
                Vec::new(),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let err = runtime
            .send("c", vec![Value::Unsupported("table")])
            .unwrap_err();
        assert!(err.to_string().contains("unsupported type 'table'"));
        runtime.wait();
        assert!(RESULT
            .lock()
            .as_deref()
            .unwrap()
            .contains("unsupported type 'table'"));
        runtime.shutdown();
    }

    #[test]
    fn periodic_sleep_is_drift_free_across_ten_periods() {
        let rate = make_rate_handle(Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        for _ in 0..10 {
            std::thread::sleep(rate.advance());
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(250));
    }
}
