//! Worker supervisor: lifecycle of the per-connection module processes.
//!
//! [`ModuleHost`] owns one worker record per configured connection and
//! drives each through an explicit state machine (see [`supervisor`] docs);
//! [`ModuleClient`] is the per-worker handle it exposes once a worker has
//! registered.

mod child;
mod client;
mod launch;
mod supervisor;

pub use client::ModuleClient;
pub use launch::{CONNECTION_ID_ENV, MODULE_MANIFEST_ENV, VERIFICATION_TOKEN_ENV};
pub use supervisor::ModuleHost;
