//! # Wire messages exchanged with a worker.
//!
//! Typed payloads for every call this host sends or receives. Message names
//! are the `MSG_*` constants; payloads serialize camelCase to match the
//! module-side API.
//!
//! Entity synchronization uses three calls:
//! - [`MSG_UPDATE_ACTIONS`] / [`MSG_UPDATE_FEEDBACKS`] — maps keyed by entity
//!   id; a `null` value is a deletion tombstone;
//! - [`MSG_UPGRADE_ACTIONS_AND_FEEDBACKS`] — parallel lists of stale entities
//!   the module should upgrade to its current definitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{ImageSize, OptionValues};

/// Sent by the worker to authenticate and bind its channel.
pub const MSG_REGISTER: &str = "register";
/// Initializes the module with the connection config.
pub const MSG_INIT: &str = "init";
/// Asks the module to tear down before the process is stopped.
pub const MSG_DESTROY: &str = "destroy";
/// Replaces/deletes action instances inside the module.
pub const MSG_UPDATE_ACTIONS: &str = "updateActions";
/// Replaces/deletes feedback instances inside the module.
pub const MSG_UPDATE_FEEDBACKS: &str = "updateFeedbacks";
/// Batched upgrade round trip for stale entities.
pub const MSG_UPGRADE_ACTIONS_AND_FEEDBACKS: &str = "upgradeActionsAndFeedbacks";
/// Notifies the module which variable values changed.
pub const MSG_VARIABLES_CHANGED: &str = "variablesChanged";
/// Asks the module to learn current option values for an action.
pub const MSG_LEARN_ACTION: &str = "learnAction";
/// Asks the module to learn current option values for a feedback.
pub const MSG_LEARN_FEEDBACK: &str = "learnFeedback";

/// Payload of the worker's `register` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Module API version the worker was built against.
    pub api_version: semver::Version,
    /// Connection the worker believes it hosts.
    pub connection_id: String,
    /// The single-use token handed to the process at launch.
    pub verification_token: String,
}

/// Payload of the host's `init` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    /// Connection label, for module-side logging.
    pub label: String,
    /// Opaque module configuration.
    pub config: serde_json::Value,
}

/// Response to the host's `init` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitResponse {
    /// Upgrade index the module's definitions are currently at.
    pub new_upgrade_index: i64,
    /// Whether the module exposes an HTTP handler.
    pub has_http_handler: bool,
    /// Whether the module can record actions.
    pub has_record_actions_handler: bool,
    /// Config rewritten by the module during init, if any.
    pub updated_config: Option<serde_json::Value>,
}

/// Payload of the host's `variablesChanged` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesChangedMessage {
    /// Ids of the variables whose values changed.
    pub changed_variable_ids: Vec<String>,
}

/// One synchronized action instance, as the module sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInstance {
    /// Entity id.
    pub id: String,
    /// Owning control id.
    pub control_id: String,
    /// Action definition id inside the module.
    pub action_id: String,
    /// Option values (resolved for updates, raw for upgrades).
    #[serde(default)]
    pub options: OptionValues,
    /// Upgrade index the definition was written at.
    #[serde(default)]
    pub upgrade_index: Option<i64>,
    /// Whether the entity is disabled.
    #[serde(default)]
    pub disabled: bool,
}

/// One synchronized feedback instance, as the module sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInstance {
    /// Entity id.
    pub id: String,
    /// Owning control id.
    pub control_id: String,
    /// Feedback definition id inside the module.
    pub feedback_id: String,
    /// Option values (resolved for updates, raw for upgrades).
    #[serde(default)]
    pub options: OptionValues,
    /// Bitmap size hint of the owning control; updates only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSize>,
    /// Whether the produced value is inverted.
    #[serde(default)]
    pub is_inverted: bool,
    /// Upgrade index the definition was written at.
    #[serde(default)]
    pub upgrade_index: Option<i64>,
    /// Whether the entity is disabled.
    #[serde(default)]
    pub disabled: bool,
}

/// Payload of `updateActions`: entity id → instance, `None` = delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateActionsMessage {
    /// Replaced or tombstoned action instances.
    pub actions: HashMap<String, Option<ActionInstance>>,
}

/// Payload of `updateFeedbacks`: entity id → instance, `None` = delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFeedbacksMessage {
    /// Replaced or tombstoned feedback instances.
    pub feedbacks: HashMap<String, Option<FeedbackInstance>>,
}

/// Payload of `upgradeActionsAndFeedbacks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// Stale actions to upgrade.
    pub actions: Vec<ActionInstance>,
    /// Stale feedbacks to upgrade.
    pub feedbacks: Vec<FeedbackInstance>,
}

/// One upgraded action returned by the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradedAction {
    /// Entity id the upgrade applies to.
    pub id: String,
    /// Possibly remapped definition id.
    pub action_id: String,
    /// Rewritten option values.
    #[serde(default)]
    pub options: OptionValues,
    /// Upgrade index the rewritten definition is at.
    #[serde(default)]
    pub upgrade_index: Option<i64>,
}

/// One upgraded feedback returned by the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradedFeedback {
    /// Entity id the upgrade applies to.
    pub id: String,
    /// Possibly remapped definition id.
    pub feedback_id: String,
    /// Rewritten option values.
    #[serde(default)]
    pub options: OptionValues,
    /// Upgrade index the rewritten definition is at.
    #[serde(default)]
    pub upgrade_index: Option<i64>,
    /// Rewritten style object, if any.
    #[serde(default)]
    pub style: Option<serde_json::Value>,
    /// Rewritten inversion flag.
    #[serde(default)]
    pub is_inverted: bool,
}

/// Response of `upgradeActionsAndFeedbacks`.
///
/// The module may omit entries for entities it had nothing to change;
/// absence is not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeResponse {
    /// Upgraded actions, keyed back by entity id.
    pub updated_actions: Vec<UpgradedAction>,
    /// Upgraded feedbacks, keyed back by entity id.
    pub updated_feedbacks: Vec<UpgradedFeedback>,
}

/// Payload of `learnAction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnActionMessage {
    /// The action to learn values for, with its current options.
    pub action: ActionInstance,
}

/// Payload of `learnFeedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnFeedbackMessage {
    /// The feedback to learn values for, with its current options.
    pub feedback: FeedbackInstance,
}

/// Response of the learn calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnResponse {
    /// Learned option values, or `None` when the module declined.
    pub options: Option<OptionValues>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_tombstone_serializes_as_null() {
        let mut message = UpdateActionsMessage::default();
        message.actions.insert("act-1".into(), None);

        let value = serde_json::to_value(&message).expect("serializes");
        assert_eq!(value["actions"]["act-1"], serde_json::Value::Null);
    }

    #[test]
    fn test_upgrade_response_tolerates_empty_object() {
        let response: UpgradeResponse = serde_json::from_value(json!({})).expect("deserializes");
        assert!(response.updated_actions.is_empty());
        assert!(response.updated_feedbacks.is_empty());
    }

    #[test]
    fn test_feedback_instance_omits_missing_image() {
        let instance = FeedbackInstance {
            id: "fb-1".into(),
            control_id: "ctl-1".into(),
            feedback_id: "tally".into(),
            options: OptionValues::new(),
            image: None,
            is_inverted: false,
            upgrade_index: Some(2),
            disabled: false,
        };
        let value = serde_json::to_value(&instance).expect("serializes");
        assert!(value.get("image").is_none());
        assert_eq!(value["upgradeIndex"], json!(2));
    }
}
