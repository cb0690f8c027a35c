//! # Local process spawner (unix).
//!
//! [`LocalSpawner`] runs workers as real child processes:
//!
//! - stdout/stderr are piped and forwarded line-by-line as
//!   [`ProcessEvent::Stdout`] / [`ProcessEvent::Stderr`];
//! - a fresh unix socket is bound per spawn and its path passed to the child
//!   via the `MODULE_SOCKET` environment variable; the worker connects back
//!   and speaks the JSON-lines protocol
//!   ([`JsonLinesChannel`](crate::channel::socket::JsonLinesChannel));
//! - worker-initiated calls surface as [`ProcessEvent::Message`];
//! - a stop request closes the channel (the worker sees EOF and is expected
//!   to exit), waits [`LaunchCommand::kill_timeout`], then kills the child;
//! - exit without a stop request is reported as [`ProcessEvent::Crashed`].
//!
//! Auto-restart is intentionally absent; the supervisor owns backoff.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::{mpsc, OnceCell};
use tokio::time;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use super::{LaunchCommand, ProcessEvent, ProcessHandle, ProcessSpawner, SpawnedProcess};
use crate::channel::socket::JsonLinesChannel;
use crate::channel::{InboundMessage, MessageChannel};
use crate::error::SpawnError;

/// Environment variable carrying the channel socket path to the worker.
pub const MODULE_SOCKET_ENV: &str = "MODULE_SOCKET";

/// Spawns workers as local child processes connected over a unix socket.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    socket_dir: PathBuf,
}

impl LocalSpawner {
    /// Creates a spawner placing its per-process sockets under `socket_dir`.
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
        }
    }
}

#[async_trait]
impl ProcessSpawner for LocalSpawner {
    async fn spawn(&self, command: LaunchCommand) -> Result<SpawnedProcess, SpawnError> {
        let socket_path = self
            .socket_dir
            .join(format!("worker-{}.sock", uuid::Uuid::new_v4().simple()));
        let listener = UnixListener::bind(&socket_path).map_err(|err| SpawnError::Spawn {
            message: format!("failed to bind channel socket: {err}"),
        })?;

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(MODULE_SOCKET_ENV, &socket_path)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SpawnError::Spawn {
                message: err.to_string(),
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ProcessEvent::Started);

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, events_tx.clone(), ProcessEvent::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, events_tx.clone(), ProcessEvent::Stderr);
        }

        let handle = Arc::new(LocalProcess {
            channel: OnceCell::new(),
            stop_requested: AtomicBool::new(false),
            stop_token: CancellationToken::new(),
            exit_token: CancellationToken::new(),
            channel_token: CancellationToken::new(),
        });

        spawn_acceptor(Arc::clone(&handle), listener, events_tx.clone());
        spawn_waiter(
            Arc::clone(&handle),
            child,
            command.kill_timeout,
            socket_path,
            events_tx,
        );

        Ok(SpawnedProcess {
            handle,
            events: events_rx,
        })
    }
}

struct LocalProcess {
    channel: OnceCell<Arc<JsonLinesChannel>>,
    stop_requested: AtomicBool,
    /// Cancelled by `stop()` to begin shutdown.
    stop_token: CancellationToken,
    /// Cancelled by the waiter once the process has exited.
    exit_token: CancellationToken,
    /// Owns the channel read loop; cancelled on shutdown/exit.
    channel_token: CancellationToken,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn channel(&self) -> Option<Arc<dyn MessageChannel>> {
        self.channel
            .get()
            .map(|channel| Arc::clone(channel) as Arc<dyn MessageChannel>)
    }

    async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_token.cancel();
        self.exit_token.cancelled().await;
    }
}

fn spawn_line_reader<R>(
    reader: R,
    events: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if events.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

fn spawn_acceptor(
    process: Arc<LocalProcess>,
    listener: UnixListener,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    tokio::spawn(async move {
        let stream = tokio::select! {
            _ = process.channel_token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    tracing::debug!(error = %err, "worker socket accept failed");
                    return;
                }
            },
        };

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        let channel =
            JsonLinesChannel::new(stream, inbound_tx, process.channel_token.child_token());
        let _ = process.channel.set(channel);

        while let Some(message) = inbound_rx.recv().await {
            if events.send(ProcessEvent::Message(message)).is_err() {
                break;
            }
        }
    });
}

fn spawn_waiter(
    process: Arc<LocalProcess>,
    mut child: tokio::process::Child,
    kill_timeout: std::time::Duration,
    socket_path: PathBuf,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = child.wait() => {}
            _ = process.stop_token.cancelled() => {
                // Close the channel; a well-behaved worker exits on EOF.
                process.channel_token.cancel();
                if time::timeout(kill_timeout, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        process.channel_token.cancel();
        let _ = std::fs::remove_file(&socket_path);

        if process.stop_requested.load(Ordering::SeqCst) {
            let _ = events.send(ProcessEvent::Stopped);
        } else {
            let _ = events.send(ProcessEvent::Crashed);
        }
        let _ = events.send(ProcessEvent::Exited);
        process.exit_token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell_command(dir: &std::path::Path, script: &str) -> LaunchCommand {
        LaunchCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            env: vec![("CONNECTION_ID".into(), "conn-1".into())],
            cwd: dir.to_path_buf(),
            kill_timeout: Duration::from_millis(200),
        }
    }

    async fn next_skipping_output(
        events: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> Option<ProcessEvent> {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(_) | ProcessEvent::Stderr(_) => continue,
                other => return Some(other),
            }
        }
        None
    }

    #[tokio::test]
    async fn test_clean_exit_without_stop_reports_crash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spawner = LocalSpawner::new(dir.path());
        let mut spawned = spawner
            .spawn(shell_command(dir.path(), "exit 0"))
            .await
            .expect("spawns");

        assert!(matches!(
            next_skipping_output(&mut spawned.events).await,
            Some(ProcessEvent::Started)
        ));
        assert!(matches!(
            next_skipping_output(&mut spawned.events).await,
            Some(ProcessEvent::Crashed)
        ));
        assert!(matches!(
            next_skipping_output(&mut spawned.events).await,
            Some(ProcessEvent::Exited)
        ));
    }

    #[tokio::test]
    async fn test_stop_kills_lingering_process_and_reports_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spawner = LocalSpawner::new(dir.path());
        let mut spawned = spawner
            .spawn(shell_command(dir.path(), "sleep 30"))
            .await
            .expect("spawns");

        assert!(matches!(
            next_skipping_output(&mut spawned.events).await,
            Some(ProcessEvent::Started)
        ));

        spawned.handle.stop().await;

        assert!(matches!(
            next_skipping_output(&mut spawned.events).await,
            Some(ProcessEvent::Stopped)
        ));
        assert!(matches!(
            next_skipping_output(&mut spawned.events).await,
            Some(ProcessEvent::Exited)
        ));
    }

    #[tokio::test]
    async fn test_stdout_lines_are_forwarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spawner = LocalSpawner::new(dir.path());
        let mut spawned = spawner
            .spawn(shell_command(dir.path(), "echo hello-from-worker"))
            .await
            .expect("spawns");

        let mut saw_line = false;
        while let Some(event) = spawned.events.recv().await {
            match event {
                ProcessEvent::Stdout(line) if line == "hello-from-worker" => saw_line = true,
                ProcessEvent::Exited => break,
                _ => {}
            }
        }
        assert!(saw_line, "stdout line was not forwarded");
    }
}
