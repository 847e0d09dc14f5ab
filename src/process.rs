//! Per-process metadata: identity, status, pending payload, and the
//! channel/deadline a blocked process is waiting on.
//!
//! The coroutine itself (`stack::CoroutineHandle`) is *not* part of this
//! record -- it is `!Send` and thread-pinned, so it lives only in the
//! worker loop's local parked set (see `scheduler.rs`). `Process` holds
//! everything that needs to be visible across threads: the channel queues
//! and the scheduler's ready-queue only ever hold `Arc<Process>`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;
use crate::error::RuntimeError;
use crate::runtime::ProcessContext;
use crate::value::Value;

/// A process's code fragment.
///
/// An isolate capability dumps a callable to bytes for transfer and loads a
/// body into a fresh isolate; since source and destination isolates live in
/// the same address space here, "dumping" a body collapses to cloning this
/// `Arc`. A body receives its arguments and calls back into the runtime
/// exclusively through the `ProcessContext` it is given -- never by
/// capturing mutable state directly -- so no state is shared across process
/// boundaries despite the shared address space.
pub type ProcessBody = Arc<dyn Fn(&ProcessContext) + Send + Sync + 'static>;

/// Unique identifier for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// The sentinel id reserved for the host thread's pseudo-process.
    pub(crate) const HOST: ProcessId = ProcessId(0);

    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ProcessId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// The execution status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created/recycled but not yet placed on the ready-queue.
    Idle,
    /// On the ready-queue (or, for an already-started process, simply
    /// runnable again) awaiting a worker.
    Ready,
    /// Currently executing on a worker thread.
    Running,
    /// Parked in a channel's send-queue.
    BlockedSend,
    /// Parked in a channel's recv-queue.
    BlockedRecv,
    /// Parked on a worker's timed list, waiting for `wake_up`.
    BlockedSleep,
    /// The body has returned (or errored); eligible for recycling.
    Finished,
}

struct ProcessInner {
    status: Status,
    /// Input arguments / received payload waiting to be read by the body.
    pending_args: Vec<Value>,
    /// Non-owning back-reference to the channel this process is parked on.
    /// Valid only while `status` is `BlockedSend` or `BlockedRecv`.
    channel: Option<Arc<Channel>>,
    /// Deadline; meaningful only while `status` is `BlockedSleep`.
    wake_up: Option<Instant>,
    /// Outcome of a blocking send/receive, delivered by whichever process
    /// completed the rendezvous (or by `delchannel`).
    result: Option<Result<Vec<Value>, RuntimeError>>,
}

impl ProcessInner {
    fn idle() -> Self {
        ProcessInner {
            status: Status::Idle,
            pending_args: Vec::new(),
            channel: None,
            wake_up: None,
            result: None,
        }
    }
}

/// A process record.
///
/// Every list a process can belong to -- the scheduler's ready-queue, a
/// channel's send/recv queue, a worker's timed list, the recycle pool --
/// holds `Arc<Process>` clones of the same record, never a private copy;
/// the "at most one list at a time" invariant is maintained by the runtime
/// logic that moves a process between those lists, not by the type system.
pub struct Process {
    pub(crate) id: ProcessId,
    /// True only for the single sentinel record representing the host
    /// thread. A host process is never dispatched by the scheduler; only
    /// its channel-waiting state and `result`/`status` fields are used.
    pub(crate) is_host: bool,
    inner: Mutex<ProcessInner>,
}

impl Process {
    pub(crate) fn new(id: ProcessId, is_host: bool) -> Arc<Self> {
        Arc::new(Process {
            id,
            is_host,
            inner: Mutex::new(ProcessInner::idle()),
        })
    }

    pub(crate) fn status(&self) -> Status {
        self.inner.lock().status
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.inner.lock().status = status;
    }

    pub(crate) fn take_pending_args(&self) -> Vec<Value> {
        std::mem::take(&mut self.inner.lock().pending_args)
    }

    pub(crate) fn set_pending_args(&self, args: Vec<Value>) {
        self.inner.lock().pending_args = args;
    }

    pub(crate) fn set_channel(&self, channel: Option<Arc<Channel>>) {
        self.inner.lock().channel = channel;
    }

    pub(crate) fn set_wake_up(&self, deadline: Instant) {
        self.inner.lock().wake_up = Some(deadline);
    }

    pub(crate) fn wake_up(&self) -> Option<Instant> {
        self.inner.lock().wake_up
    }

    /// Deliver the outcome of a blocking operation and mark the process
    /// runnable again. Called by whichever process completed the
    /// rendezvous (the matching send/receive, or `delchannel`).
    pub(crate) fn deliver_result(&self, result: Result<Vec<Value>, RuntimeError>) {
        let mut inner = self.inner.lock();
        inner.result = Some(result);
        inner.status = Status::Ready;
        inner.channel = None;
        inner.wake_up = None;
    }

    pub(crate) fn take_result(&self) -> Option<Result<Vec<Value>, RuntimeError>> {
        self.inner.lock().result.take()
    }

    /// Reset a finished process's record so it can serve a fresh `newproc`
    /// call from the recycle pool.
    pub(crate) fn reset_for_recycle(&self) {
        *self.inner.lock() = ProcessInner::idle();
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("is_host", &self.is_host)
            .field("status", &inner.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_process_is_idle() {
        let p = Process::new(ProcessId::next(), false);
        assert_eq!(p.status(), Status::Idle);
        assert!(p.take_pending_args().is_empty());
    }

    #[test]
    fn deliver_result_marks_ready_and_clears_parking_state() {
        let p = Process::new(ProcessId::next(), false);
        p.set_status(Status::BlockedRecv);
        p.set_wake_up(Instant::now());
        p.deliver_result(Ok(vec![Value::Int(7)]));
        assert_eq!(p.status(), Status::Ready);
        assert!(p.wake_up().is_none());
        assert_eq!(p.take_result().unwrap().unwrap(), vec![Value::Int(7)]);
        assert!(p.take_result().is_none());
    }

    #[test]
    fn recycle_resets_to_idle() {
        let p = Process::new(ProcessId::next(), false);
        p.set_status(Status::Finished);
        p.set_pending_args(vec![Value::Nil]);
        p.reset_for_recycle();
        assert_eq!(p.status(), Status::Idle);
        assert!(p.take_pending_args().is_empty());
    }

    #[test]
    fn pid_next_is_unique_and_skips_host() {
        let a = ProcessId::next();
        let b = ProcessId::next();
        assert_ne!(a, b);
        assert_ne!(a, ProcessId::HOST);
        assert_ne!(b, ProcessId::HOST);
    }
}
