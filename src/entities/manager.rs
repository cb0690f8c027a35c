//! # Entity manager: reconciles tracked entities with one worker.
//!
//! Tracks a wrapper per entity id and drives each wrapper through a small
//! state machine on a debounced reconciliation pass:
//!
//! ```text
//!            ┌────────────────────────────────────────────────┐
//!            ▼                                                │
//!  UNLOADED ──(index matches)──► READY ──(invalidated)────────┤
//!      │                                                      │
//!      └─(index stale)─► UPGRADING ◄──────────────┐           │
//!                            │  ▲                 │           │
//!               (invalidated)▼  │(response:       │(response: │
//!                UPGRADING_INVALIDATED ──────► UNLOADED)      │
//!                                                             │
//!  any state ──(forget)──► PENDING_DELETE ──(pass)──► removed + tombstone
//! ```
//!
//! Each pass stages three payloads: immediate `updateActions` /
//! `updateFeedbacks` maps (tombstoned with `null` for deletions) and one
//! batched `upgradeActionsAndFeedbacks` request for everything stale. The
//! per-pass `entity id → wrapper id` map is the only correlation between an
//! upgrade response and current truth: a response whose captured wrapper id
//! no longer matches is discarded silently.
//!
//! If the upgrade call itself fails there is no retry path: in-flight
//! wrappers are optimistically marked READY and invalidated ones revert to
//! UNLOADED.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use uuid::Uuid;

use crate::channel::{
    call, ActionInstance, FeedbackInstance, MessageChannel, UpdateActionsMessage,
    UpdateFeedbacksMessage, UpgradeRequest, UpgradeResponse, UpgradedAction, UpgradedFeedback,
    MSG_UPDATE_ACTIONS, MSG_UPDATE_FEEDBACKS, MSG_UPGRADE_ACTIONS_AND_FEEDBACKS,
};
use crate::config::HostConfig;
use crate::debounce::Debouncer;
use crate::deps::{ControlLocation, HostDeps, VariableResolver};
use crate::model::{
    ActionModel, EntityDefinition, EntityModel, FeedbackModel, OptionValues,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityState {
    Unloaded,
    Upgrading,
    UpgradingInvalidated,
    Ready,
    PendingDelete,
}

struct EntityWrapper {
    /// Fresh per-(re)tracking token; the only valid correlation for an
    /// in-flight upgrade response.
    wrapper_id: Uuid,
    entity: EntityModel,
    control_id: String,
    state: EntityState,
    /// Variable ids referenced by the most recent option resolution.
    /// `None` until the entity has been staged into an update once.
    referenced_variables: Option<HashSet<String>>,
}

struct EngineState {
    entities: BTreeMap<String, EntityWrapper>,
    /// No outbound traffic before `start` / after `destroy`.
    ready: bool,
    current_upgrade_index: i64,
}

#[derive(Default)]
struct PassPlan {
    update_actions: HashMap<String, Option<ActionInstance>>,
    update_feedbacks: HashMap<String, Option<FeedbackInstance>>,
    upgrade: UpgradeRequest,
    /// entity id → wrapper id captured when the batch was staged.
    batch: HashMap<String, Uuid>,
}

impl PassPlan {
    fn is_empty(&self) -> bool {
        self.update_actions.is_empty()
            && self.update_feedbacks.is_empty()
            && self.upgrade.actions.is_empty()
            && self.upgrade.feedbacks.is_empty()
    }
}

/// Resolved options together with the variable ids they referenced.
#[derive(Debug, Clone, Default)]
pub struct ParsedOptions {
    /// Option values with variable-capable fields resolved.
    pub options: OptionValues,
    /// Every variable id referenced across all resolved fields.
    pub referenced_variable_ids: HashSet<String>,
}

/// Reconciliation engine for the entities of one worker.
///
/// Scoped to a single worker: constructed with a channel that never outlives
/// that worker's process. All public operations are synchronous map
/// mutations plus a debounced pass trigger; network traffic happens on the
/// pass only.
pub struct EntityManager {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn MessageChannel>,
    deps: HostDeps,
    state: parking_lot::Mutex<EngineState>,
    pass: Debouncer,
}

impl EntityManager {
    /// Creates an engine bound to one worker's channel.
    ///
    /// The engine is not ready: tracking calls are accepted but produce no
    /// outbound traffic until [`EntityManager::start`].
    pub fn new(channel: Arc<dyn MessageChannel>, deps: HostDeps, cfg: &HostConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let pass = Debouncer::new(cfg.debounce_wait, cfg.debounce_max_wait, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_pass().await;
                    }
                }
                .boxed()
            });
            Inner {
                channel,
                deps,
                state: parking_lot::Mutex::new(EngineState {
                    entities: BTreeMap::new(),
                    ready: false,
                    current_upgrade_index: 0,
                }),
                pass,
            }
        });
        Self { inner }
    }

    /// Marks the engine ready and records the worker's upgrade index.
    ///
    /// Triggers an initial pass over everything tracked so far.
    pub fn start(&self, current_upgrade_index: i64) {
        {
            let mut state = self.inner.state.lock();
            state.ready = true;
            state.current_upgrade_index = current_upgrade_index;
        }
        self.inner.pass.trigger();
    }

    /// Cancels any pending pass, clears all wrappers, and marks not ready.
    ///
    /// In-flight round trips are not cancelled at the transport level; their
    /// responses become no-ops because the correlating wrappers are gone.
    pub fn destroy(&self) {
        self.inner.pass.cancel();
        let mut state = self.inner.state.lock();
        state.entities.clear();
        state.ready = false;
    }

    /// Tracks `entity`, replacing any wrapper already registered for its id.
    ///
    /// Replacement allocates a fresh wrapper id, which abandons any upgrade
    /// still in flight for the old wrapper.
    pub fn track_entity(&self, entity: &EntityModel, control_id: &str) {
        {
            let mut state = self.inner.state.lock();
            state.entities.insert(
                entity.id().to_string(),
                EntityWrapper {
                    wrapper_id: Uuid::new_v4(),
                    entity: entity.clone(),
                    control_id: control_id.to_string(),
                    state: EntityState::Unloaded,
                    referenced_variables: None,
                },
            );
        }
        self.inner.pass.trigger();
    }

    /// Marks the entity for deletion; no-op when the id is untracked.
    pub fn forget_entity(&self, entity_id: &str) {
        {
            let mut state = self.inner.state.lock();
            let Some(wrapper) = state.entities.get_mut(entity_id) else {
                return;
            };
            wrapper.state = EntityState::PendingDelete;
        }
        self.inner.pass.trigger();
    }

    /// Forces every feedback wrapper back through the send path.
    ///
    /// READY feedbacks revert to UNLOADED; feedbacks with an upgrade in
    /// flight become UPGRADING_INVALIDATED so the response handler retries
    /// them. PENDING_DELETE wrappers are left alone.
    pub fn resend_feedbacks(&self) {
        {
            let mut state = self.inner.state.lock();
            for wrapper in state.entities.values_mut() {
                if !matches!(wrapper.entity, EntityModel::Feedback(_)) {
                    continue;
                }
                invalidate_wrapper(wrapper);
            }
        }
        self.inner.pass.trigger();
    }

    /// Invalidates every wrapper whose last resolved options referenced one
    /// of `changed`.
    ///
    /// Wrappers never staged into an update (no recorded variable set) are
    /// unaffected.
    pub fn on_variables_changed(&self, changed: &HashSet<String>) {
        let mut any = false;
        {
            let mut state = self.inner.state.lock();
            for wrapper in state.entities.values_mut() {
                let Some(referenced) = &wrapper.referenced_variables else {
                    continue;
                };
                if referenced.is_disjoint(changed) {
                    continue;
                }
                invalidate_wrapper(wrapper);
                any = true;
            }
        }
        if any {
            self.inner.pass.trigger();
        }
    }

    /// Resolves variable-capable option fields of `options` at `location`.
    ///
    /// Fields not flagged in `definition` pass through unchanged; with no
    /// definition the options are returned as-is with an empty referenced
    /// set.
    pub fn parse_options_object(
        &self,
        definition: Option<&EntityDefinition>,
        options: &OptionValues,
        location: Option<&ControlLocation>,
    ) -> ParsedOptions {
        parse_options(
            self.inner.deps.variables.as_ref(),
            definition,
            options,
            location,
        )
    }
}

/// State transition shared by `resend_feedbacks` and `on_variables_changed`.
fn invalidate_wrapper(wrapper: &mut EntityWrapper) {
    match wrapper.state {
        EntityState::Ready => wrapper.state = EntityState::Unloaded,
        EntityState::Upgrading => wrapper.state = EntityState::UpgradingInvalidated,
        EntityState::Unloaded
        | EntityState::UpgradingInvalidated
        | EntityState::PendingDelete => {}
    }
}

fn parse_options(
    variables: &dyn VariableResolver,
    definition: Option<&EntityDefinition>,
    options: &OptionValues,
    location: Option<&ControlLocation>,
) -> ParsedOptions {
    let Some(definition) = definition else {
        return ParsedOptions {
            options: options.clone(),
            referenced_variable_ids: HashSet::new(),
        };
    };

    let mut resolved = options.clone();
    let mut referenced = HashSet::new();
    for field in &definition.option_fields {
        if !field.allows_variables {
            continue;
        }
        let Some(serde_json::Value::String(raw)) = options.get(&field.id) else {
            continue;
        };
        let parsed = variables.parse_variables(raw, location);
        resolved.insert(field.id.clone(), serde_json::Value::String(parsed.text));
        referenced.extend(parsed.variable_ids);
    }

    ParsedOptions {
        options: resolved,
        referenced_variable_ids: referenced,
    }
}

impl Inner {
    async fn run_pass(self: Arc<Self>) {
        let Some(plan) = self.build_pass_plan() else {
            return;
        };

        // Update payloads go out immediately, independent of the upgrade
        // path. Failures are logged; there is nothing to roll back.
        if !plan.update_actions.is_empty() {
            let channel = Arc::clone(&self.channel);
            let payload = UpdateActionsMessage {
                actions: plan.update_actions,
            };
            tokio::spawn(async move {
                if let Err(err) =
                    call::<_, serde_json::Value>(channel.as_ref(), MSG_UPDATE_ACTIONS, &payload)
                        .await
                {
                    tracing::error!(error = %err, "updateActions failed");
                }
            });
        }
        if !plan.update_feedbacks.is_empty() {
            let channel = Arc::clone(&self.channel);
            let payload = UpdateFeedbacksMessage {
                feedbacks: plan.update_feedbacks,
            };
            tokio::spawn(async move {
                if let Err(err) =
                    call::<_, serde_json::Value>(channel.as_ref(), MSG_UPDATE_FEEDBACKS, &payload)
                        .await
                {
                    tracing::error!(error = %err, "updateFeedbacks failed");
                }
            });
        }

        if !plan.upgrade.actions.is_empty() || !plan.upgrade.feedbacks.is_empty() {
            tokio::spawn(Arc::clone(&self).run_upgrade_batch(plan.upgrade, plan.batch));
        }
    }

    fn build_pass_plan(&self) -> Option<PassPlan> {
        let mut state = self.state.lock();
        if !state.ready {
            return None;
        }
        let current_index = state.current_upgrade_index;

        let mut plan = PassPlan::default();
        let mut removed = Vec::new();

        let EngineState { entities, .. } = &mut *state;
        for (entity_id, wrapper) in entities.iter_mut() {
            match wrapper.state {
                EntityState::Unloaded => {
                    if wrapper.entity.upgrade_index() == Some(current_index) {
                        wrapper.state = EntityState::Ready;
                        self.stage_update(entity_id, wrapper, &mut plan);
                    } else {
                        wrapper.state = EntityState::Upgrading;
                        plan.batch.insert(entity_id.clone(), wrapper.wrapper_id);
                        stage_upgrade(wrapper, &mut plan.upgrade);
                    }
                }
                EntityState::Upgrading | EntityState::UpgradingInvalidated => {
                    // Round trip in flight; leave it alone.
                }
                EntityState::Ready => {}
                EntityState::PendingDelete => {
                    removed.push(entity_id.clone());
                    match wrapper.entity {
                        EntityModel::Action(_) => {
                            plan.update_actions.insert(entity_id.clone(), None);
                        }
                        EntityModel::Feedback(_) => {
                            plan.update_feedbacks.insert(entity_id.clone(), None);
                        }
                    }
                }
            }
        }
        for entity_id in removed {
            entities.remove(&entity_id);
        }

        if plan.is_empty() {
            None
        } else {
            Some(plan)
        }
    }

    /// Stages one current entity into the immediate update payload,
    /// resolving its options and recording the referenced-variable set.
    fn stage_update(&self, entity_id: &str, wrapper: &mut EntityWrapper, plan: &mut PassPlan) {
        let definition = self.deps.definitions.get_definition(
            wrapper.entity.kind(),
            wrapper.entity.connection_id(),
            wrapper.entity.definition_id(),
        );
        let location = self.deps.locations.location_of_control(&wrapper.control_id);
        let parsed = parse_options(
            self.deps.variables.as_ref(),
            definition.as_deref(),
            wrapper.entity.options(),
            location.as_ref(),
        );
        wrapper.referenced_variables = Some(parsed.referenced_variable_ids);

        match &wrapper.entity {
            EntityModel::Action(action) => {
                plan.update_actions.insert(
                    entity_id.to_string(),
                    Some(ActionInstance {
                        id: action.id.clone(),
                        control_id: wrapper.control_id.clone(),
                        action_id: action.definition_id.clone(),
                        options: parsed.options,
                        upgrade_index: action.upgrade_index,
                        disabled: action.disabled,
                    }),
                );
            }
            EntityModel::Feedback(feedback) => {
                let image = self
                    .deps
                    .controls
                    .get_control(&wrapper.control_id)
                    .and_then(|control| control.bitmap_size());
                plan.update_feedbacks.insert(
                    entity_id.to_string(),
                    Some(FeedbackInstance {
                        id: feedback.id.clone(),
                        control_id: wrapper.control_id.clone(),
                        feedback_id: feedback.definition_id.clone(),
                        options: parsed.options,
                        image,
                        is_inverted: feedback.is_inverted,
                        upgrade_index: feedback.upgrade_index,
                        disabled: feedback.disabled,
                    }),
                );
            }
        }
    }

    async fn run_upgrade_batch(
        self: Arc<Self>,
        request: UpgradeRequest,
        batch: HashMap<String, Uuid>,
    ) {
        match call::<_, UpgradeResponse>(
            self.channel.as_ref(),
            MSG_UPGRADE_ACTIONS_AND_FEEDBACKS,
            &request,
        )
        .await
        {
            Ok(response) => self.apply_upgrade_response(response, &batch),
            Err(err) => {
                tracing::error!(error = %err, "upgradeActionsAndFeedbacks failed");
                self.apply_upgrade_failure(&batch);
            }
        }

        // Pick up anything invalidated during the round trip.
        self.pass.trigger();
    }

    fn apply_upgrade_response(&self, response: UpgradeResponse, batch: &HashMap<String, Uuid>) {
        let upgraded_actions: HashMap<&str, &UpgradedAction> = response
            .updated_actions
            .iter()
            .map(|action| (action.id.as_str(), action))
            .collect();
        let upgraded_feedbacks: HashMap<&str, &UpgradedFeedback> = response
            .updated_feedbacks
            .iter()
            .map(|feedback| (feedback.id.as_str(), feedback))
            .collect();

        let mut replacements: Vec<(String, EntityModel)> = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.ready {
                return;
            }
            let current_index = state.current_upgrade_index;

            // Walk what was sent, not what came back: the module may omit
            // entries, and the map may have changed under us.
            for (entity_id, wrapper_id) in batch {
                let Some(wrapper) = state.entities.get_mut(entity_id) else {
                    continue;
                };
                if wrapper.wrapper_id != *wrapper_id {
                    // Replaced or re-tracked mid-flight; this response no
                    // longer speaks for the entity.
                    continue;
                }

                match wrapper.state {
                    EntityState::UpgradingInvalidated => {
                        wrapper.state = EntityState::Unloaded;
                    }
                    EntityState::Upgrading => {
                        let updated = match &wrapper.entity {
                            EntityModel::Action(action) => upgraded_actions
                                .get(entity_id.as_str())
                                .map(|up| upgraded_action_model(action, up, current_index)),
                            EntityModel::Feedback(feedback) => upgraded_feedbacks
                                .get(entity_id.as_str())
                                .map(|up| upgraded_feedback_model(feedback, up, current_index)),
                        };
                        if let Some(updated) = updated {
                            wrapper.entity = updated.clone();
                            replacements.push((wrapper.control_id.clone(), updated));
                        }
                        // The state is intentionally left at UPGRADING: the
                        // entity-replace round trip through the control
                        // re-tracks the wrapper and reconciles it.
                    }
                    EntityState::Ready | EntityState::Unloaded | EntityState::PendingDelete => {
                        // Stale; pretend we never saw it.
                    }
                }
            }
        }

        for (control_id, entity) in replacements {
            if let Some(control) = self.deps.controls.get_control(&control_id) {
                control.entity_replace(entity);
            }
        }
    }

    /// Failure fallback: there is no retry path for the upgrade call itself,
    /// so in-flight wrappers progress as if it succeeded.
    fn apply_upgrade_failure(&self, batch: &HashMap<String, Uuid>) {
        let mut state = self.state.lock();
        for (entity_id, wrapper_id) in batch {
            let Some(wrapper) = state.entities.get_mut(entity_id) else {
                continue;
            };
            if wrapper.wrapper_id != *wrapper_id {
                continue;
            }
            match wrapper.state {
                EntityState::Upgrading => wrapper.state = EntityState::Ready,
                EntityState::UpgradingInvalidated => wrapper.state = EntityState::Unloaded,
                EntityState::Ready | EntityState::Unloaded | EntityState::PendingDelete => {}
            }
        }
    }
}

fn stage_upgrade(wrapper: &EntityWrapper, request: &mut UpgradeRequest) {
    match &wrapper.entity {
        EntityModel::Action(action) => request.actions.push(ActionInstance {
            id: action.id.clone(),
            control_id: wrapper.control_id.clone(),
            action_id: action.definition_id.clone(),
            options: action.options.clone(),
            upgrade_index: action.upgrade_index,
            disabled: action.disabled,
        }),
        EntityModel::Feedback(feedback) => request.feedbacks.push(FeedbackInstance {
            id: feedback.id.clone(),
            control_id: wrapper.control_id.clone(),
            feedback_id: feedback.definition_id.clone(),
            options: feedback.options.clone(),
            image: None,
            is_inverted: feedback.is_inverted,
            upgrade_index: feedback.upgrade_index,
            disabled: feedback.disabled,
        }),
    }
}

fn upgraded_action_model(
    previous: &ActionModel,
    upgraded: &UpgradedAction,
    current_index: i64,
) -> EntityModel {
    EntityModel::Action(ActionModel {
        id: upgraded.id.clone(),
        connection_id: previous.connection_id.clone(),
        definition_id: upgraded.action_id.clone(),
        options: upgraded.options.clone(),
        upgrade_index: Some(upgraded.upgrade_index.unwrap_or(current_index)),
        disabled: previous.disabled,
    })
}

fn upgraded_feedback_model(
    previous: &FeedbackModel,
    upgraded: &UpgradedFeedback,
    current_index: i64,
) -> EntityModel {
    EntityModel::Feedback(FeedbackModel {
        id: upgraded.id.clone(),
        connection_id: previous.connection_id.clone(),
        definition_id: upgraded.feedback_id.clone(),
        options: upgraded.options.clone(),
        upgrade_index: Some(upgraded.upgrade_index.unwrap_or(current_index)),
        disabled: previous.disabled,
        is_inverted: upgraded.is_inverted,
        style: upgraded.style.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, ImageSize, OptionField};
    use crate::testing::{test_deps, FakeControl, RecordingChannel, TestDeps};
    use serde_json::json;
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_millis(120);

    fn action(id: &str, upgrade_index: Option<i64>) -> EntityModel {
        EntityModel::Action(ActionModel {
            id: id.into(),
            connection_id: "conn-1".into(),
            definition_id: "press".into(),
            options: OptionValues::new(),
            upgrade_index,
            disabled: false,
        })
    }

    fn feedback(id: &str, upgrade_index: Option<i64>) -> EntityModel {
        EntityModel::Feedback(FeedbackModel {
            id: id.into(),
            connection_id: "conn-1".into(),
            definition_id: "tally".into(),
            options: OptionValues::new(),
            upgrade_index,
            disabled: false,
            is_inverted: false,
            style: None,
        })
    }

    fn manager_with(deps: &TestDeps) -> (EntityManager, Arc<RecordingChannel>) {
        let channel = RecordingChannel::new();
        let manager = EntityManager::new(
            channel.clone() as Arc<dyn MessageChannel>,
            deps.deps.clone(),
            &HostConfig::default(),
        );
        (manager, channel)
    }

    #[tokio::test]
    async fn test_matching_index_sends_update_without_upgrade() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        manager.track_entity(&action("act-1", Some(5)), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        let updates = channel.calls(MSG_UPDATE_ACTIONS);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["actions"]["act-1"]["actionId"], json!("press"));
        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 0);
    }

    #[tokio::test]
    async fn test_stale_index_sends_upgrade_without_update() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        manager.track_entity(&action("act-1", Some(2)), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 0);
        let upgrades = channel.calls(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS);
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0]["actions"][0]["id"], json!("act-1"));
    }

    #[tokio::test]
    async fn test_missing_upgrade_index_goes_through_upgrade_path() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(0);

        manager.track_entity(&action("act-1", None), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 1);
    }

    #[tokio::test]
    async fn test_forget_untracked_is_a_noop() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(0);

        manager.forget_entity("ghost");
        tokio::time::sleep(SETTLE).await;

        assert_eq!(channel.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_forgotten_feedback_tombstones_once() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        manager.track_entity(&feedback("fb-1", Some(5)), "ctl-1");
        manager.track_entity(&feedback("fb-2", Some(5)), "ctl-1");
        manager.forget_entity("fb-1");
        tokio::time::sleep(SETTLE).await;

        let updates = channel.calls(MSG_UPDATE_FEEDBACKS);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["feedbacks"]["fb-1"], serde_json::Value::Null);
        assert_eq!(updates[0]["feedbacks"]["fb-2"]["feedbackId"], json!("tally"));

        // The tombstone never reappears.
        manager.resend_feedbacks();
        tokio::time::sleep(SETTLE).await;
        let updates = channel.calls(MSG_UPDATE_FEEDBACKS);
        assert_eq!(updates.len(), 2);
        assert!(updates[1]["feedbacks"].get("fb-1").is_none());
        assert!(updates[1]["feedbacks"]["fb-2"].is_object());
    }

    #[tokio::test]
    async fn test_feedback_update_carries_bitmap_size() {
        let deps = test_deps();
        deps.controls.insert(
            "ctl-1",
            FakeControl::with_bitmap(ImageSize {
                width: 72,
                height: 58,
            }),
        );
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        manager.track_entity(&feedback("fb-1", Some(5)), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        let updates = channel.calls(MSG_UPDATE_FEEDBACKS);
        assert_eq!(updates[0]["feedbacks"]["fb-1"]["image"]["width"], json!(72));
        assert_eq!(updates[0]["feedbacks"]["fb-1"]["image"]["height"], json!(58));
    }

    #[tokio::test]
    async fn test_stale_upgrade_response_is_discarded() {
        let deps = test_deps();
        let control = FakeControl::new();
        deps.controls.insert("ctl-1", control.clone());
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        let gate = channel.script_pending(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS);
        manager.track_entity(&action("act-1", Some(1)), "ctl-1");
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 1);

        // Replace the entity while the upgrade is in flight.
        manager.track_entity(&action("act-1", Some(5)), "ctl-1");

        gate.send(Ok(json!({
            "updatedActions": [
                { "id": "act-1", "actionId": "press-v2", "options": {}, "upgradeIndex": 5 }
            ],
            "updatedFeedbacks": [],
        })))
        .expect("gate open");
        tokio::time::sleep(SETTLE).await;

        // The stale response must not touch the replacement wrapper.
        assert!(control.replaced().is_empty());
        // The replacement (matching index) went out as a plain update.
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 1);
    }

    #[tokio::test]
    async fn test_upgrade_apply_does_not_force_ready() {
        // Documented quirk: a successfully applied upgrade response leaves
        // the wrapper in UPGRADING until the caller re-tracks it.
        let deps = test_deps();
        let control = FakeControl::new();
        deps.controls.insert("ctl-1", control.clone());
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        channel.script(
            MSG_UPGRADE_ACTIONS_AND_FEEDBACKS,
            Ok(json!({
                "updatedActions": [
                    { "id": "act-1", "actionId": "press-v2", "options": {}, "upgradeIndex": 5 }
                ],
                "updatedFeedbacks": [],
            })),
        );
        manager.track_entity(&action("act-1", Some(1)), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        // The upgraded definition was pushed back to the caller...
        let replaced = control.replaced();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].definition_id(), "press-v2");
        // ...but no update payload was sent: the wrapper is still UPGRADING.
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 0);

        // The caller's replace round trip re-tracks and reconciles it.
        manager.track_entity(&replaced[0], "ctl-1");
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 1);
    }

    #[tokio::test]
    async fn test_upgrade_failure_pretends_completion() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        channel.script(
            MSG_UPGRADE_ACTIONS_AND_FEEDBACKS,
            Err("worker went away".into()),
        );
        manager.track_entity(&action("act-1", Some(1)), "ctl-1");
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 1);

        // Marked READY optimistically: nothing further goes out.
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 1);
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 0);
    }

    #[tokio::test]
    async fn test_invalidated_during_upgrade_is_retried() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        let gate = channel.script_pending(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS);
        manager.track_entity(&feedback("fb-1", Some(1)), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        // Invalidate while the round trip is pending.
        manager.resend_feedbacks();
        gate.send(Ok(json!({ "updatedActions": [], "updatedFeedbacks": [] })))
            .expect("gate open");
        tokio::time::sleep(SETTLE).await;

        // UPGRADING_INVALIDATED reverted to UNLOADED and a fresh upgrade
        // was staged by the re-triggered pass.
        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 2);
    }

    #[tokio::test]
    async fn test_variables_changed_only_hits_intersecting_entities() {
        let deps = test_deps();
        deps.definitions.insert(
            "press",
            EntityDefinition {
                option_fields: vec![OptionField {
                    id: "text".into(),
                    allows_variables: true,
                }],
            },
        );
        deps.variables.set("tally-source", "cam 2");

        let mut options = OptionValues::new();
        options.insert("text".into(), json!("now: $(tally-source)"));
        let entity = EntityModel::Action(ActionModel {
            id: "act-1".into(),
            connection_id: "conn-1".into(),
            definition_id: "press".into(),
            options,
            upgrade_index: Some(5),
            disabled: false,
        });

        let (manager, channel) = manager_with(&deps);
        manager.start(5);
        manager.track_entity(&entity, "ctl-1");
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 1);

        // Disjoint set: nothing happens.
        manager.on_variables_changed(&HashSet::from(["other".to_string()]));
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 1);

        // Intersecting set: forced back through the UNLOADED path.
        manager.on_variables_changed(&HashSet::from(["tally-source".to_string()]));
        tokio::time::sleep(SETTLE).await;
        let updates = channel.calls(MSG_UPDATE_ACTIONS);
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[1]["actions"]["act-1"]["options"]["text"],
            json!("now: cam 2")
        );
    }

    #[tokio::test]
    async fn test_never_evaluated_entities_ignore_variable_changes() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        // Stale entity: staged for upgrade, never into an update payload.
        let gate = channel.script_pending(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS);
        manager.track_entity(&action("act-1", Some(1)), "ctl-1");
        tokio::time::sleep(SETTLE).await;

        manager.on_variables_changed(&HashSet::from(["anything".to_string()]));
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 0);
        assert_eq!(channel.call_count(MSG_UPGRADE_ACTIONS_AND_FEEDBACKS), 1);
        drop(gate);
    }

    #[tokio::test]
    async fn test_destroy_cancels_pending_pass_and_silences_tracking() {
        let deps = test_deps();
        let (manager, channel) = manager_with(&deps);
        manager.start(5);

        manager.track_entity(&action("act-1", Some(5)), "ctl-1");
        manager.destroy();
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.total_calls(), 0);

        // Accepted, but silent until start() again.
        manager.track_entity(&action("act-2", Some(5)), "ctl-1");
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.total_calls(), 0);

        manager.start(5);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(channel.call_count(MSG_UPDATE_ACTIONS), 1);
    }

    #[tokio::test]
    async fn test_parse_options_object_without_definition_passes_through() {
        let deps = test_deps();
        let (manager, _channel) = manager_with(&deps);

        let mut options = OptionValues::new();
        options.insert("text".into(), json!("$(ignored)"));
        let parsed = manager.parse_options_object(None, &options, None);

        assert_eq!(parsed.options, options);
        assert!(parsed.referenced_variable_ids.is_empty());
    }

    #[tokio::test]
    async fn test_parse_options_object_resolves_flagged_fields() {
        let deps = test_deps();
        deps.variables.set("cam", "one");
        let (manager, _channel) = manager_with(&deps);

        let definition = EntityDefinition {
            option_fields: vec![
                OptionField {
                    id: "text".into(),
                    allows_variables: true,
                },
                OptionField {
                    id: "plain".into(),
                    allows_variables: false,
                },
            ],
        };
        let mut options = OptionValues::new();
        options.insert("text".into(), json!("camera $(cam)"));
        options.insert("plain".into(), json!("$(cam)"));
        options.insert("count".into(), json!(3));

        let parsed = manager.parse_options_object(Some(&definition), &options, None);
        assert_eq!(parsed.options["text"], json!("camera one"));
        assert_eq!(parsed.options["plain"], json!("$(cam)"));
        assert_eq!(parsed.options["count"], json!(3));
        assert_eq!(
            parsed.referenced_variable_ids,
            HashSet::from(["cam".to_string()])
        );
    }

    #[test]
    fn test_kind_accessor_matches_variants() {
        assert_eq!(action("a", None).kind(), EntityKind::Action);
        assert_eq!(feedback("f", None).kind(), EntityKind::Feedback);
    }
}
