//! # Worker record: per-connection supervision state.
//!
//! One [`ModuleChild`] per connection id, owned exclusively by the
//! supervisor. The record holds the desired target (`config` +
//! `module_info`; both `None` means "should not be running"), the
//! lifecycle state machine, and the live process/handler handles.
//!
//! Correlation tokens:
//! - `creation_id` identifies the record itself (guards map deletion);
//! - `attempt` identifies one start attempt; process-event listeners and
//!   handshake tasks capture it and become no-ops once it moves on.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use uuid::Uuid;

use super::client::ModuleClient;
use crate::model::{ConnectionConfig, ModuleVersionInfo};
use crate::process::ProcessHandle;

/// Lifecycle state of one worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WorkerState {
    /// A state change has been requested but has not begun.
    Invalidated,
    /// A stop-then-maybe-start attempt is in progress.
    InProgress,
    /// An attempt is in progress and the target changed underneath it.
    InProgressInvalidated,
    /// The worker has settled into its desired state.
    Running,
}

/// Supervision state of one connection's worker.
pub(super) struct ModuleChild {
    /// Identifies this record; a deleted-and-recreated record gets a new id.
    pub creation_id: Uuid,
    /// Bumped per start attempt and per forced restart; stale async
    /// callbacks compare against it and bail.
    pub attempt: u64,
    /// State machine position.
    pub state: WorkerState,
    /// True only after the handshake and the init call completed.
    pub is_ready: bool,
    /// Consecutive failures; reset to 0 by a successful init.
    pub restart_count: u32,
    /// Gate before the next start attempt, set by forced restarts.
    pub delay_start_until: Option<Instant>,
    /// Single-use secret for the registration handshake of the current
    /// attempt; cleared on stop so in-flight registrations are rejected.
    pub auth_token: Option<String>,
    /// Unpackaged modules skip the handshake API-version check.
    pub skip_api_version_check: bool,
    /// Desired configuration; `None` together with `module_info` means the
    /// worker should not be running.
    pub config: Option<ConnectionConfig>,
    /// Desired module build.
    pub module_info: Option<ModuleVersionInfo>,
    /// Live process handle, `None` when not running.
    pub process: Option<Arc<dyn ProcessHandle>>,
    /// Listener task draining the process event stream.
    pub listener: Option<JoinHandle<()>>,
    /// Bound message handler, `None` until the worker registers.
    pub handler: Option<Arc<ModuleClient>>,
}

impl ModuleChild {
    /// Creates a fresh record for a newly configured connection.
    pub fn new(config: ConnectionConfig, module_info: ModuleVersionInfo) -> Self {
        Self {
            creation_id: Uuid::new_v4(),
            attempt: 0,
            state: WorkerState::Invalidated,
            is_ready: false,
            restart_count: 0,
            delay_start_until: None,
            auth_token: None,
            skip_api_version_check: false,
            config: Some(config),
            module_info: Some(module_info),
            process: None,
            listener: None,
            handler: None,
        }
    }
}

/// Shared cell: the map owns one per connection id, async tasks clone the
/// `Arc` and lock the record for short, never-across-await sections.
pub(super) struct ChildCell {
    pub connection_id: String,
    pub child: parking_lot::Mutex<ModuleChild>,
}
