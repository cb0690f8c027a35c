//! # Connection and module descriptors.
//!
//! [`ConnectionConfig`] is the desired configuration of one connection;
//! [`ModuleVersionInfo`] describes the module build that should host it.
//! Both arrive from outside (configuration storage, module store) and are
//! treated as immutable snapshots: changing either queues a worker restart.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Desired configuration of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Human-chosen label, used in logs and status variables.
    pub label: String,
    /// Whether the connection is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opaque module-specific configuration, passed through on init.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Channel protocol a module runtime speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeProtocol {
    /// JSON-lines request/callback protocol over a local socket.
    #[serde(rename = "socket-json")]
    SocketJson,
    /// Anything this host does not speak.
    #[serde(other)]
    Unsupported,
}

/// Runtime section of a module manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRuntime {
    /// Channel protocol the module expects.
    pub protocol: RuntimeProtocol,
    /// Runtime kind, resolved to an interpreter by the module resolver.
    pub kind: String,
    /// Entrypoint path, relative to the module base directory.
    pub entrypoint: String,
    /// Module API version the packaged build was compiled against.
    pub api_version: semver::Version,
}

/// Module manifest, the subset the host needs to launch a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    /// Stable module id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Runtime section.
    pub runtime: ModuleRuntime,
}

/// A concrete module build selected for a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleVersionInfo {
    /// Parsed manifest of the build.
    pub manifest: ModuleManifest,
    /// Directory the build lives in; working directory of the worker.
    pub base_path: PathBuf,
    /// True for store-packaged builds; false for development checkouts.
    ///
    /// Unpackaged builds skip the handshake API-version check and resolve
    /// their API version dynamically instead of trusting the manifest.
    pub is_packaged: bool,
    /// Version tag of the build (`"dev"` for development checkouts).
    pub version_id: String,
}

impl ModuleVersionInfo {
    /// True for development checkouts whose stdout is worth logging.
    pub fn is_dev(&self) -> bool {
        self.version_id == "dev"
    }
}
