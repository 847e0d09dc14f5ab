//! A named synchronous rendezvous point.
//!
//! At any instant at most one of `send_queue`/`recv_queue` is non-empty:
//! every operation checks for, and pairs with, a waiting counterpart before
//! ever queuing the new arrival, under the same lock acquisition (see
//! `runtime.rs`'s `send_impl`/`receive_impl`).

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::process::Process;

/// The two FIFOs a channel multiplexes: processes parked here by a
/// blocking `send` or `receive` that found no counterpart yet.
#[derive(Default)]
pub(crate) struct ChannelState {
    pub(crate) send_queue: VecDeque<Arc<Process>>,
    pub(crate) recv_queue: VecDeque<Arc<Process>>,
}

/// A channel: its name, its queues, and the condition variable used by the
/// registry's locked-get protocol (see `registry.rs`).
pub(crate) struct Channel {
    pub(crate) name: String,
    state: Mutex<ChannelState>,
    /// Broadcast when the channel's lock becomes available to a waiting
    /// `locked_get` caller, and when the channel is destroyed.
    pub(crate) ready_cv: Condvar,
}

impl Channel {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Channel {
            name,
            state: Mutex::new(ChannelState::default()),
            ready_cv: Condvar::new(),
        })
    }

    /// Attempt to acquire the channel's queue lock without blocking.
    pub(crate) fn try_lock(&self) -> Option<parking_lot::MutexGuard<'_, ChannelState>> {
        self.state.try_lock()
    }

    /// Acquire the channel's queue lock, draining both queues. Used by
    /// `delchannel`, which always succeeds in acquiring since it already
    /// holds the registry lock and no other locked-get caller can still be
    /// mid-wait on a channel the registry is about to remove.
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, ChannelState> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;

    #[test]
    fn queues_start_empty() {
        let chan = Channel::new("c".to_string());
        let state = chan.lock();
        assert!(state.send_queue.is_empty());
        assert!(state.recv_queue.is_empty());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let chan = Channel::new("c".to_string());
        let _guard = chan.lock();
        assert!(chan.try_lock().is_none());
    }

    #[test]
    fn queue_holds_process_handles() {
        let chan = Channel::new("c".to_string());
        let p = Process::new(ProcessId::next(), false);
        chan.lock().send_queue.push_back(p.clone());
        assert_eq!(chan.lock().send_queue.len(), 1);
    }
}
