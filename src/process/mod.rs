//! Worker process spawning and lifecycle events.
//!
//! The supervisor drives processes through the [`ProcessSpawner`] /
//! [`ProcessHandle`] seam and observes them through a stream of
//! [`ProcessEvent`]s. Auto-restart is *not* part of this layer: a process
//! exits exactly once per spawn, and the supervisor applies its own backoff.
//!
//! [`local::LocalSpawner`] is the shipped unix implementation.

#[cfg(unix)]
pub mod local;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{InboundMessage, MessageChannel};
use crate::error::SpawnError;

/// Fully resolved launch parameters for one worker process.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    /// Interpreter or executable to run.
    pub program: PathBuf,
    /// Arguments, including the module entrypoint.
    pub args: Vec<String>,
    /// Environment handed to the process (connection id, auth token, …).
    pub env: Vec<(String, String)>,
    /// Working directory (the module base directory).
    pub cwd: PathBuf,
    /// How long a stop request waits before the process is killed.
    pub kill_timeout: Duration,
}

impl LaunchCommand {
    /// Returns the value of an environment entry, if present.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Lifecycle and output events of one spawned process.
///
/// Per spawn, the stream delivers `Started` first and `Exited` last; exactly
/// one of `Stopped` (requested) or `Crashed` (unexpected) precedes `Exited`.
#[derive(Debug)]
pub enum ProcessEvent {
    /// The process is running.
    Started,
    /// The process exited after a stop request.
    Stopped,
    /// The process exited without a stop request.
    Crashed,
    /// Terminal event; no further events follow.
    Exited,
    /// One line of the process's stdout.
    Stdout(String),
    /// One line of the process's stderr.
    Stderr(String),
    /// A call sent by the worker over its message channel.
    Message(InboundMessage),
}

/// A spawned process together with its event stream.
pub struct SpawnedProcess {
    /// Control handle, shared with the worker record.
    pub handle: Arc<dyn ProcessHandle>,
    /// Event stream, consumed by exactly one listener task.
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Control surface of one spawned worker process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Returns the message channel once the worker has connected.
    ///
    /// `None` while no channel is bound (the worker has not connected yet,
    /// or the transport is gone).
    fn channel(&self) -> Option<Arc<dyn MessageChannel>>;

    /// Requests termination and waits for the process to exit.
    ///
    /// Idempotent. The implementation closes the worker's channel, grants it
    /// the configured kill timeout to exit, then kills it.
    async fn stop(&self);
}

/// Spawns worker processes.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Starts a process for `command`.
    ///
    /// Implementations must not restart the process on their own; the
    /// supervisor owns retry policy.
    async fn spawn(&self, command: LaunchCommand) -> Result<SpawnedProcess, SpawnError>;
}
