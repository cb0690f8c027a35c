//! # Debounced trigger with a bounded maximum wait.
//!
//! [`Debouncer`] coalesces bursts of [`Debouncer::trigger`] calls into a
//! single invocation of an async callback, using a trailing-edge wait that is
//! bounded by a maximum latency:
//!
//! - each trigger (re)arms a short `wait` timer;
//! - under continuous triggering the callback still fires within `max_wait`
//!   of the first trigger of the burst;
//! - [`Debouncer::cancel`] clears only the pending invocation — the debouncer
//!   stays usable and the next trigger starts a fresh burst;
//! - dropping the debouncer stops its worker task.
//!
//! ## Architecture
//! ```text
//! trigger() ──┐
//! trigger() ──┼──► [mpsc queue] ──► worker task ── wait/max_wait ──► callback().await
//! cancel()  ──┘                        │
//!                                      └── triggers received while the
//!                                          callback runs start the next burst
//! ```
//!
//! Both batching points of the host (the connection check and the entity
//! reconciliation pass) run on one of these, so a storm of synchronous
//! invalidations produces a single batched pass with bounded latency.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

enum Signal {
    Trigger,
    Cancel,
}

/// Coalesces repeated triggers into single executions of an async callback.
///
/// Cheap handle: cloning is not supported on purpose — the owner controls the
/// lifecycle, collaborators get `trigger()` via the owning component.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Debouncer {
    /// Creates a debouncer and spawns its worker task.
    ///
    /// `callback` is invoked from the worker task; invocations never overlap.
    /// `wait` is the trailing-edge quiet window, `max_wait` bounds the total
    /// latency from the first trigger of a burst (clamped to at least `wait`).
    pub fn new<F>(wait: Duration, max_wait: Duration, callback: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_wait = max_wait.max(wait);
        tokio::spawn(run_worker(rx, wait, max_wait, callback));
        Self { tx }
    }

    /// Requests an invocation of the callback.
    ///
    /// Triggers arriving within `wait` of each other coalesce; the callback
    /// runs once per burst. Safe to call from any task.
    pub fn trigger(&self) {
        let _ = self.tx.send(Signal::Trigger);
    }

    /// Clears any pending (not yet fired) invocation.
    ///
    /// A callback that is already executing is not interrupted. Subsequent
    /// triggers behave normally.
    pub fn cancel(&self) {
        let _ = self.tx.send(Signal::Cancel);
    }
}

async fn run_worker<F>(
    mut rx: mpsc::UnboundedReceiver<Signal>,
    wait: Duration,
    max_wait: Duration,
    callback: F,
) where
    F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    'idle: loop {
        // Wait for the first trigger of a burst.
        match rx.recv().await {
            None => return,
            Some(Signal::Cancel) => continue 'idle,
            Some(Signal::Trigger) => {}
        }

        let deadline = Instant::now() + max_wait;
        'burst: loop {
            let fire_at = (Instant::now() + wait).min(deadline);
            tokio::select! {
                _ = time::sleep_until(fire_at) => break 'burst,
                signal = rx.recv() => match signal {
                    None => return,
                    Some(Signal::Cancel) => continue 'idle,
                    Some(Signal::Trigger) => {} // extend the quiet window
                },
            }
        }

        callback().await;
    }
}
