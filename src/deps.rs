//! Collaborator seams consumed by the host.
//!
//! The supervisor and the entity engine never reach into the rest of the
//! application directly; everything they need from outside comes through the
//! trait objects bundled in [`HostDeps`]. Implementations are expected to be
//! cheap lookups or notifications — they are called from host-internal tasks
//! and must not block or call back into the host synchronously.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SpawnError;
use crate::model::{EntityDefinition, EntityKind, EntityModel, ImageSize, StatusCategory};

/// Receives coarse per-connection status updates.
pub trait StatusReporter: Send + Sync {
    /// Reports the current status of `connection_id`.
    ///
    /// `status = None` clears the category while keeping the optional
    /// human-readable message.
    fn update_connection_status(
        &self,
        connection_id: &str,
        status: Option<StatusCategory>,
        message: Option<&str>,
    );
}

/// Notified when a connection becomes (un)available for action recording.
pub trait ActionRecorder: Send + Sync {
    /// Fired after init succeeds (`true`) and when the worker stops (`false`).
    fn connection_availability_change(&self, connection_id: &str, available: bool);
}

/// Handle to one control, scoped to what the host needs.
pub trait ControlHandle: Send + Sync {
    /// Replaces an entity definition on the control after an upgrade.
    fn entity_replace(&self, entity: EntityModel);

    /// Returns the control's bitmap dimensions, if it renders one.
    fn bitmap_size(&self) -> Option<ImageSize>;
}

/// Resolves control ids to control handles.
pub trait ControlLookup: Send + Sync {
    /// Returns the control, or `None` when it no longer exists.
    fn get_control(&self, control_id: &str) -> Option<Arc<dyn ControlHandle>>;
}

/// Result of resolving variable references inside a text value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedVariables {
    /// The text with all references replaced.
    pub text: String,
    /// Ids of every variable the text referenced.
    pub variable_ids: HashSet<String>,
}

/// Resolves variable references inside option values.
pub trait VariableResolver: Send + Sync {
    /// Resolves `text` in the context of `location`.
    fn parse_variables(&self, text: &str, location: Option<&ControlLocation>) -> ParsedVariables;
}

/// Grid location of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLocation {
    /// Page number.
    pub page_number: u32,
    /// Row within the page.
    pub row: i32,
    /// Column within the row.
    pub column: i32,
}

/// Resolves control ids to their grid location.
pub trait LocationLookup: Send + Sync {
    /// Returns the location, or `None` for controls outside the grid.
    fn location_of_control(&self, control_id: &str) -> Option<ControlLocation>;
}

/// Resolves entity definitions declared by modules.
pub trait EntityDefinitions: Send + Sync {
    /// Returns the definition an entity references, or `None` if unknown.
    fn get_definition(
        &self,
        kind: EntityKind,
        connection_id: &str,
        definition_id: &str,
    ) -> Option<Arc<EntityDefinition>>;
}

/// Resolves module runtimes to concrete interpreters and API versions.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    /// Returns the interpreter executable for a runtime kind, or `None` when
    /// the kind is not supported by this installation.
    fn interpreter_for(&self, runtime_kind: &str) -> Option<PathBuf>;

    /// Reads the effective module API version of an unpackaged checkout.
    ///
    /// Packaged builds trust their manifest; development checkouts are read
    /// dynamically because the checkout may have been rebuilt against a
    /// different library version than the manifest claims.
    async fn dev_api_version(&self, base_path: &Path) -> Result<semver::Version, SpawnError>;
}

/// Bundle of every collaborator the host consumes.
#[derive(Clone)]
pub struct HostDeps {
    /// Status sink.
    pub status: Arc<dyn StatusReporter>,
    /// Action-recorder availability sink.
    pub recorder: Arc<dyn ActionRecorder>,
    /// Control lookup.
    pub controls: Arc<dyn ControlLookup>,
    /// Variable resolution.
    pub variables: Arc<dyn VariableResolver>,
    /// Control location lookup.
    pub locations: Arc<dyn LocationLookup>,
    /// Entity definition lookup.
    pub definitions: Arc<dyn EntityDefinitions>,
    /// Module runtime resolver.
    pub resolver: Arc<dyn ModuleResolver>,
}
