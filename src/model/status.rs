//! # Connection status categories.
//!
//! The host surfaces a connection's coarse runtime state as one of a small
//! set of categories; granular diagnostics go to the per-connection debug
//! log instead.

use serde::{Deserialize, Serialize};

/// Coarse runtime status of a connection, as reported to the status
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCategory {
    /// Worker registered; init call in flight.
    Initializing,
    /// Worker exited unexpectedly; a restart is pending.
    Crashed,
    /// Worker stopped cleanly.
    Stopped,
    /// Connection has no desired configuration.
    Disabled,
}

impl StatusCategory {
    /// Returns a short stable label (snake_case) for logs and variables.
    pub fn as_label(&self) -> &'static str {
        match self {
            StatusCategory::Initializing => "initializing",
            StatusCategory::Crashed => "crashed",
            StatusCategory::Stopped => "stopped",
            StatusCategory::Disabled => "disabled",
        }
    }
}
