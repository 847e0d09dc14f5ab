//! Name -> channel mapping behind a single registry lock, plus the
//! locked-get protocol used to operate on a channel by name.
//!
//! The protocol: hold the registry lock just long enough to look up the
//! channel and attempt a non-blocking acquisition of its own lock. If that
//! fails, release the registry lock and wait on the channel's condition
//! variable, then loop -- re-looking-up the name, since the channel may
//! have been destroyed while we waited. This keeps the registry lock short
//! even under channel contention and is robust to destruction races.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::channel::{Channel, ChannelState};
use crate::error::RuntimeError;
use crate::process::Process;

#[derive(Default)]
pub(crate) struct Registry {
    channels: Mutex<FxHashMap<String, Arc<Channel>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    pub(crate) fn create(&self, name: &str) -> Result<(), RuntimeError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(name) {
            return Err(RuntimeError::already_exists(name));
        }
        channels.insert(name.to_string(), Channel::new(name.to_string()));
        Ok(())
    }

    pub(crate) fn is_open(&self, name: &str) -> bool {
        self.channels.lock().contains_key(name)
    }

    /// Run `f` with the named channel's queues locked, implementing the
    /// locked-get protocol described above. `f` receives the channel handle
    /// itself (not just its state) so a caller that is about to park a
    /// process can stash the non-owning back reference while the lock is
    /// still held, before the process becomes visible to a concurrent
    /// matcher. Also returns the channel handle alongside `f`'s result.
    pub(crate) fn with_channel<R>(
        &self,
        name: &str,
        f: impl FnOnce(&Arc<Channel>, &mut ChannelState) -> R,
    ) -> Result<(Arc<Channel>, R), RuntimeError> {
        let mut registry = self.channels.lock();
        loop {
            let chan = match registry.get(name) {
                Some(chan) => Arc::clone(chan),
                None => return Err(RuntimeError::not_found(name)),
            };
            match chan.try_lock() {
                Some(mut state) => {
                    drop(registry);
                    let result = f(&chan, &mut state);
                    // Release the channel's own lock and signal any
                    // `with_channel` caller parked below waiting for it to
                    // become available again.
                    drop(state);
                    chan.ready_cv.notify_all();
                    return Ok((chan.clone(), result));
                }
                None => {
                    // Releases `registry` for the duration of the wait and
                    // reacquires it before returning, per the protocol.
                    chan.ready_cv.wait(&mut registry);
                }
            }
        }
    }

    /// Remove `name` from the registry and drain every parked sender and
    /// receiver, invoking `wake` for each with a `Destroyed` error.
    pub(crate) fn destroy(
        &self,
        name: &str,
        mut wake: impl FnMut(&Arc<Process>, RuntimeError),
    ) -> Result<(), RuntimeError> {
        let chan = {
            let mut registry = self.channels.lock();
            registry.remove(name).ok_or_else(|| RuntimeError::not_found(name))?
        };
        // Any locked_get caller still waiting on this channel's condvar
        // wakes, re-looks-up the (now absent) name, and reports NotFound.
        chan.ready_cv.notify_all();

        let (senders, receivers) = {
            let mut state = chan.lock();
            (
                std::mem::take(&mut state.send_queue),
                std::mem::take(&mut state.recv_queue),
            )
        };
        for proc in senders {
            wake(&proc, RuntimeError::destroyed(name, "receiver"));
        }
        for proc in receivers {
            wake(&proc, RuntimeError::destroyed(name, "sender"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_duplicate_name() {
        let reg = Registry::new();
        reg.create("c").unwrap();
        assert!(matches!(
            reg.create("c").unwrap_err(),
            RuntimeError::AlreadyExists(_)
        ));
    }

    #[test]
    fn with_channel_on_missing_name_is_not_found() {
        let reg = Registry::new();
        let result = reg.with_channel("missing", |_, _| ());
        assert!(matches!(result.unwrap_err(), RuntimeError::NotFound(_)));
    }

    #[test]
    fn destroy_wakes_every_waiter() {
        let reg = Registry::new();
        reg.create("c").unwrap();
        let p1 = Process::new(crate::process::ProcessId::next(), false);
        let p2 = Process::new(crate::process::ProcessId::next(), false);
        reg.with_channel("c", |_chan, state| {
            state.send_queue.push_back(p1.clone());
            state.recv_queue.push_back(p2.clone());
        })
        .unwrap();

        let mut woken = Vec::new();
        reg.destroy("c", |proc, err| woken.push((proc.id, err))).unwrap();
        assert_eq!(woken.len(), 2);
        assert!(!reg.is_open("c"));
    }

    #[test]
    fn destroy_missing_channel_is_not_found() {
        let reg = Registry::new();
        assert!(matches!(
            reg.destroy("missing", |_, _| {}).unwrap_err(),
            RuntimeError::NotFound(_)
        ));
    }
}
