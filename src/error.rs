//! Structured error kinds surfaced to callers.
//!
//! Every fallible runtime operation returns `Result<T, RuntimeError>`; this
//! crate never panics on a caller-reachable error path. Like the rest of
//! this workspace, there is no error-derive crate here -- just a plain enum
//! with a hand-written `Display`/`Error` impl.

use std::fmt;

/// An error returned by a runtime operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// A channel operation named a channel that does not exist.
    NotFound(String),
    /// `newchannel` was called with a name already in the registry.
    AlreadyExists(String),
    /// A waiter was woken by `delchannel` destroying the channel it was
    /// parked on.
    Destroyed(String),
    /// A `send`/`broadcast`/`newproc` payload contained a value this
    /// runtime cannot transfer between isolates.
    UnsupportedValue(String),
    /// A payload exceeded the destination's value-stack capacity.
    StackFull(usize),
    /// A caller-supplied argument was out of range or the wrong shape.
    InvalidArgument(String),
    /// A process body failed to load into its isolate.
    LoadFailure(String),
    /// Spawning an OS worker thread failed.
    WorkerSpawnFailure(String),
    /// The operation found no waiting counterpart and was not willing to
    /// block for one: an async `receive` with no senders queued, or a
    /// `broadcast` with no receivers queued.
    NoCounterpart(String),
}

impl RuntimeError {
    pub(crate) fn not_found(channel: &str) -> Self {
        RuntimeError::NotFound(format!("channel '{channel}' does not exist"))
    }

    pub(crate) fn already_exists(channel: &str) -> Self {
        RuntimeError::AlreadyExists(format!("channel '{channel}' already exists"))
    }

    pub(crate) fn destroyed(channel: &str, waiting_for: &str) -> Self {
        RuntimeError::Destroyed(format!(
            "channel '{channel}' destroyed while waiting for {waiting_for}"
        ))
    }

    pub(crate) fn no_senders_waiting(channel: &str) -> Self {
        RuntimeError::NoCounterpart(format!("no senders waiting on channel '{channel}'"))
    }

    pub(crate) fn no_receivers_waiting(channel: &str) -> Self {
        RuntimeError::NoCounterpart(format!("no one receiving on channel '{channel}'"))
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotFound(msg) => write!(f, "{msg}"),
            RuntimeError::AlreadyExists(msg) => write!(f, "{msg}"),
            RuntimeError::Destroyed(msg) => write!(f, "{msg}"),
            RuntimeError::UnsupportedValue(msg) => write!(f, "{msg}"),
            RuntimeError::StackFull(n) => {
                write!(f, "destination cannot accept a payload of {n} value(s)")
            }
            RuntimeError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            RuntimeError::LoadFailure(msg) => write!(f, "failed to load process body: {msg}"),
            RuntimeError::WorkerSpawnFailure(msg) => {
                write!(f, "failed to spawn worker thread: {msg}")
            }
            RuntimeError::NoCounterpart(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_message_matches_waiting_role() {
        let err = RuntimeError::destroyed("c", "sender");
        assert_eq!(
            err.to_string(),
            "channel 'c' destroyed while waiting for sender"
        );
    }

    #[test]
    fn not_found_message() {
        assert_eq!(
            RuntimeError::not_found("c").to_string(),
            "channel 'c' does not exist"
        );
    }

    #[test]
    fn no_senders_waiting_message() {
        assert_eq!(
            RuntimeError::no_senders_waiting("c").to_string(),
            "no senders waiting on channel 'c'"
        );
    }
}
