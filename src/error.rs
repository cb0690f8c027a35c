//! Error types used by the modvisor host and module channels.
//!
//! This module defines the error enums of the crate:
//!
//! - [`SpawnError`] — failures while validating or launching a worker process.
//! - [`ChannelError`] — failures on the message channel to a running worker.
//!
//! Both types provide `as_label` helpers for logging/metrics. No error here is
//! fatal to the host: spawn failures re-enter the backoff/retry cycle, and
//! channel failures are handled at the call site (logged, or treated as a
//! crash of the worker).

use std::path::PathBuf;

use thiserror::Error;

/// # Errors produced while preparing or starting a worker process.
///
/// These cover the launch preconditions (runtime support, API compatibility,
/// entrypoint on disk) and the spawn itself. Every variant aborts only the
/// current start attempt; the supervisor schedules a delayed retry.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The module manifest declares a channel protocol this host does not speak.
    #[error("module runtime protocol is not supported")]
    UnsupportedProtocol,

    /// No interpreter is available for the declared runtime kind.
    #[error("runtime \"{kind}\" is not supported by this host")]
    UnsupportedRuntime {
        /// The runtime kind string from the module manifest.
        kind: String,
    },

    /// The module API version is outside the host's supported range.
    #[error("module api version {version} is too new or too old")]
    IncompatibleApiVersion {
        /// The rejected version.
        version: semver::Version,
    },

    /// The API version of an unpackaged module could not be read dynamically.
    #[error("failed to resolve module api version: {message}")]
    ApiVersionResolve {
        /// Underlying failure description.
        message: String,
    },

    /// The resolved entrypoint path does not exist on disk.
    #[error("module entrypoint \"{path}\" does not exist")]
    MissingEntrypoint {
        /// The full path that was checked.
        path: PathBuf,
    },

    /// The record has no desired config or module info to start from.
    #[error("missing config or module info for connection")]
    MissingTarget,

    /// The process could not be spawned.
    #[error("failed to spawn worker process: {message}")]
    Spawn {
        /// Underlying failure description.
        message: String,
    },
}

impl SpawnError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::UnsupportedProtocol => "spawn_unsupported_protocol",
            SpawnError::UnsupportedRuntime { .. } => "spawn_unsupported_runtime",
            SpawnError::IncompatibleApiVersion { .. } => "spawn_incompatible_api_version",
            SpawnError::ApiVersionResolve { .. } => "spawn_api_version_resolve",
            SpawnError::MissingEntrypoint { .. } => "spawn_missing_entrypoint",
            SpawnError::MissingTarget => "spawn_missing_target",
            SpawnError::Spawn { .. } => "spawn_failed",
        }
    }
}

/// # Errors produced by message-channel round trips.
///
/// A rejected round trip is never propagated past the supervisor boundary:
/// update payload failures are logged, upgrade batch failures fall back to
/// "pretend it completed", and handshake/init failures force a restart.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel (or the process behind it) is gone.
    #[error("module channel closed")]
    Closed,

    /// The module answered the call with an error response.
    #[error("module returned an error: {0}")]
    Remote(String),

    /// A payload could not be encoded or decoded.
    #[error("failed to encode or decode payload: {0}")]
    Codec(#[from] serde_json::Error),

    /// The underlying stream failed.
    #[error("i/o failure on module channel: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ChannelError::Closed => "channel_closed",
            ChannelError::Remote(_) => "channel_remote_error",
            ChannelError::Codec(_) => "channel_codec",
            ChannelError::Io(_) => "channel_io",
        }
    }
}
