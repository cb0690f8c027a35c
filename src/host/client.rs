//! # Per-worker message handler.
//!
//! A [`ModuleClient`] is bound to a worker when its registration handshake
//! succeeds and is the only handle the supervisor exposes to the rest of
//! the application ([`ModuleHost::get_child`](super::ModuleHost::get_child)).
//! It owns the worker's [`EntityManager`] and wraps the wire calls the host
//! makes into a running module.

use std::collections::HashSet;
use std::sync::Arc;

use crate::channel::{
    call, ActionInstance, FeedbackInstance, InitMessage, InitResponse, LearnActionMessage,
    LearnFeedbackMessage, LearnResponse, MessageChannel, VariablesChangedMessage, MSG_DESTROY,
    MSG_INIT, MSG_LEARN_ACTION, MSG_LEARN_FEEDBACK, MSG_VARIABLES_CHANGED,
};
use crate::config::HostConfig;
use crate::deps::HostDeps;
use crate::entities::EntityManager;
use crate::error::ChannelError;
use crate::model::{ConnectionConfig, EntityModel, OptionValues};

/// Handle to one registered worker.
pub struct ModuleClient {
    connection_id: String,
    channel: Arc<dyn MessageChannel>,
    entities: EntityManager,
}

impl ModuleClient {
    /// Binds a handler to a freshly registered worker's channel.
    pub(super) fn new(
        deps: &HostDeps,
        cfg: &HostConfig,
        channel: Arc<dyn MessageChannel>,
        connection_id: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id: connection_id.to_string(),
            channel: Arc::clone(&channel),
            entities: EntityManager::new(channel, deps.clone(), cfg),
        })
    }

    /// Connection this handler belongs to.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Initializes the module with the connection config.
    ///
    /// On success the entity engine is started at the upgrade index the
    /// module reported, releasing any tracking queued before readiness.
    pub(super) async fn init(&self, config: &ConnectionConfig) -> Result<InitResponse, ChannelError> {
        let response: InitResponse = call(
            self.channel.as_ref(),
            MSG_INIT,
            &InitMessage {
                label: config.label.clone(),
                config: config.config.clone(),
            },
        )
        .await?;

        self.entities.start(response.new_upgrade_index);
        Ok(response)
    }

    /// Asks the module to tear down ahead of a process stop.
    pub(super) async fn destroy(&self) -> Result<(), ChannelError> {
        // Silence entity traffic first so nothing races the destroy call.
        self.entities.destroy();
        let _: serde_json::Value =
            call(self.channel.as_ref(), MSG_DESTROY, &serde_json::json!({})).await?;
        Ok(())
    }

    /// Synchronous teardown for crash paths; no outbound traffic.
    pub(super) fn cleanup(&self) {
        self.entities.destroy();
    }

    /// Tracks an entity for synchronization into this worker.
    pub fn entity_update(&self, entity: &EntityModel, control_id: &str) {
        self.entities.track_entity(entity, control_id);
    }

    /// Stops tracking an entity; the worker receives a deletion tombstone.
    pub fn entity_delete(&self, entity_id: &str) {
        self.entities.forget_entity(entity_id);
    }

    /// Asks the module to learn current option values for an entity.
    pub async fn entity_learn_options(
        &self,
        entity: &EntityModel,
        control_id: &str,
    ) -> Result<Option<OptionValues>, ChannelError> {
        let response: LearnResponse = match entity {
            EntityModel::Action(action) => {
                call(
                    self.channel.as_ref(),
                    MSG_LEARN_ACTION,
                    &LearnActionMessage {
                        action: ActionInstance {
                            id: action.id.clone(),
                            control_id: control_id.to_string(),
                            action_id: action.definition_id.clone(),
                            options: action.options.clone(),
                            upgrade_index: action.upgrade_index,
                            disabled: action.disabled,
                        },
                    },
                )
                .await?
            }
            EntityModel::Feedback(feedback) => {
                call(
                    self.channel.as_ref(),
                    MSG_LEARN_FEEDBACK,
                    &LearnFeedbackMessage {
                        feedback: FeedbackInstance {
                            id: feedback.id.clone(),
                            control_id: control_id.to_string(),
                            feedback_id: feedback.definition_id.clone(),
                            options: feedback.options.clone(),
                            image: None,
                            is_inverted: feedback.is_inverted,
                            upgrade_index: feedback.upgrade_index,
                            disabled: feedback.disabled,
                        },
                    },
                )
                .await?
            }
        };
        Ok(response.options)
    }

    /// Notifies the module of changed variables and re-sends every tracked
    /// entity whose resolved options referenced one of them.
    pub async fn send_variables_changed(
        &self,
        changed: &HashSet<String>,
    ) -> Result<(), ChannelError> {
        self.entities.on_variables_changed(changed);

        let mut changed_variable_ids: Vec<String> = changed.iter().cloned().collect();
        changed_variable_ids.sort_unstable();
        let _: serde_json::Value = call(
            self.channel.as_ref(),
            MSG_VARIABLES_CHANGED,
            &VariablesChangedMessage {
                changed_variable_ids,
            },
        )
        .await?;
        Ok(())
    }

    /// Forces a re-send of every tracked feedback, which makes the module
    /// re-subscribe each one.
    pub fn send_all_feedback_instances(&self) {
        self.entities.resend_feedbacks();
    }

    /// The worker's entity engine.
    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }
}
