//! # Entity model: actions and feedbacks attached to controls.
//!
//! An entity is one action or feedback instance owned by a control and
//! executed inside a connection's worker process. The host never owns entity
//! identity — it tracks snapshots of the caller's definitions and keeps the
//! worker-side representation synchronized.
//!
//! [`EntityModel`] is a sum type so every consumer matches exhaustively on
//! the kind; feedback-only fields (inversion, style) cannot leak onto
//! actions.

use serde::{Deserialize, Serialize};

/// Option values of an entity, keyed by option field id.
pub type OptionValues = serde_json::Map<String, serde_json::Value>;

/// Discriminates the two entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// An action executed on a control press/event.
    Action,
    /// A feedback evaluated by the module to style a control.
    Feedback,
}

/// One action instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionModel {
    /// Stable entity id.
    pub id: String,
    /// Connection whose worker executes this action.
    pub connection_id: String,
    /// Id of the action definition inside the module.
    pub definition_id: String,
    /// Raw option values as stored by the caller.
    #[serde(default)]
    pub options: OptionValues,
    /// Upgrade index the stored definition was last written at.
    ///
    /// `None` marks a definition that predates upgrade tracking; it always
    /// goes through the upgrade path.
    #[serde(default)]
    pub upgrade_index: Option<i64>,
    /// Disabled entities are synchronized but not executed.
    #[serde(default)]
    pub disabled: bool,
}

/// One feedback instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackModel {
    /// Stable entity id.
    pub id: String,
    /// Connection whose worker evaluates this feedback.
    pub connection_id: String,
    /// Id of the feedback definition inside the module.
    pub definition_id: String,
    /// Raw option values as stored by the caller.
    #[serde(default)]
    pub options: OptionValues,
    /// Upgrade index the stored definition was last written at.
    #[serde(default)]
    pub upgrade_index: Option<i64>,
    /// Disabled entities are synchronized but not executed.
    #[serde(default)]
    pub disabled: bool,
    /// Whether the produced boolean value is inverted before use.
    #[serde(default)]
    pub is_inverted: bool,
    /// Style object last returned by the module for this feedback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<serde_json::Value>,
}

/// An action or feedback instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntityModel {
    /// Action variant.
    Action(ActionModel),
    /// Feedback variant.
    Feedback(FeedbackModel),
}

impl EntityModel {
    /// Returns the stable entity id.
    pub fn id(&self) -> &str {
        match self {
            EntityModel::Action(action) => &action.id,
            EntityModel::Feedback(feedback) => &feedback.id,
        }
    }

    /// Returns the owning connection id.
    pub fn connection_id(&self) -> &str {
        match self {
            EntityModel::Action(action) => &action.connection_id,
            EntityModel::Feedback(feedback) => &feedback.connection_id,
        }
    }

    /// Returns the definition id inside the module.
    pub fn definition_id(&self) -> &str {
        match self {
            EntityModel::Action(action) => &action.definition_id,
            EntityModel::Feedback(feedback) => &feedback.definition_id,
        }
    }

    /// Returns the entity kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityModel::Action(_) => EntityKind::Action,
            EntityModel::Feedback(_) => EntityKind::Feedback,
        }
    }

    /// Returns the raw option values.
    pub fn options(&self) -> &OptionValues {
        match self {
            EntityModel::Action(action) => &action.options,
            EntityModel::Feedback(feedback) => &feedback.options,
        }
    }

    /// Returns the upgrade index the definition was last written at.
    pub fn upgrade_index(&self) -> Option<i64> {
        match self {
            EntityModel::Action(action) => action.upgrade_index,
            EntityModel::Feedback(feedback) => feedback.upgrade_index,
        }
    }

    /// Returns whether the entity is disabled.
    pub fn disabled(&self) -> bool {
        match self {
            EntityModel::Action(action) => action.disabled,
            EntityModel::Feedback(feedback) => feedback.disabled,
        }
    }
}

/// Definition of an entity type, as declared by a module.
///
/// Only the parts the host needs: which option fields may embed variable
/// references and therefore require resolution before being sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDefinition {
    /// Declared option fields.
    pub option_fields: Vec<OptionField>,
}

/// One option field of an entity definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionField {
    /// Field id, matching the key in [`OptionValues`].
    pub id: String,
    /// True when string values of this field may embed variable references.
    pub allows_variables: bool,
}

/// Bitmap dimensions of a control, attached to feedback updates as a
/// rendering size hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}
