//! # ModuleHost: supervises the per-connection worker processes.
//!
//! One worker record per configured connection, driven through an explicit
//! state machine by a debounced "connection check" pass:
//!
//! ```text
//!                 ┌──────────── new desired config ────────────┐
//!                 ▼                                            │
//!           INVALIDATED ──(check pass)──► IN_PROGRESS ──────► RUNNING
//!                 ▲                            │
//!                 │          new desired config▼
//!                 └──(attempt settles)── IN_PROGRESS_INVALIDATED
//!
//!   IN_PROGRESS + empty target + stop complete  ⇒  record deleted
//! ```
//!
//! Each pass picks up every INVALIDATED record and runs an async
//! stop-then-maybe-start sequence:
//!
//! - **stop**: clear the auth token (in-flight registrations are rejected),
//!   mark not ready, best-effort destroy of the bound handler, stop the
//!   process, and wait for its exit;
//! - **start**: validate module compatibility and the entrypoint, generate a
//!   fresh single-use auth token, spawn the process (auto-restart disabled —
//!   the supervisor does its own backoff), and attach the event listener.
//!
//! The worker proves itself with a `register` call carrying the token; the
//! handshake binds a [`ModuleClient`], acks, and runs the async `init` call
//! that completes the state transition. Every failure path — bad token,
//! incompatible API version, init error, crash — funnels into a forced
//! restart with exponential backoff.
//!
//! No per-child error escapes this type: async failures are logged and fold
//! back into the retry cycle.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time;
use uuid::Uuid;

use super::child::{ChildCell, ModuleChild, WorkerState};
use super::client::ModuleClient;
use super::launch::{
    build_launch_command, check_module_compatibility, read_inspect_port, resolve_entrypoint,
};
use crate::channel::{InboundMessage, RegisterPayload, MSG_REGISTER};
use crate::config::HostConfig;
use crate::debounce::Debouncer;
use crate::deps::HostDeps;
use crate::error::SpawnError;
use crate::events::{DebugLogBus, DebugLogLevel};
use crate::model::{
    ConnectionConfig, EntityModel, ModuleVersionInfo, OptionValues, StatusCategory,
};
use crate::process::{ProcessEvent, ProcessHandle, ProcessSpawner};

/// Supervisor for the fleet of connection worker processes.
pub struct ModuleHost {
    cfg: HostConfig,
    deps: HostDeps,
    spawner: Arc<dyn ProcessSpawner>,
    log: DebugLogBus,
    children: parking_lot::Mutex<BTreeMap<String, Arc<ChildCell>>>,
    check: Debouncer,
}

enum StopOutcome {
    Delete(Uuid),
    Recheck,
    Recover,
}

impl ModuleHost {
    /// Creates the host. Nothing runs until a connection is configured via
    /// [`ModuleHost::queue_update_connection`].
    pub fn new(cfg: HostConfig, deps: HostDeps, spawner: Arc<dyn ProcessSpawner>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ModuleHost>| {
            let check_weak = weak.clone();
            let check = Debouncer::new(cfg.debounce_wait, cfg.debounce_max_wait, move || {
                let weak = check_weak.clone();
                async move {
                    if let Some(host) = weak.upgrade() {
                        host.run_connection_check().await;
                    }
                }
                .boxed()
            });

            ModuleHost {
                log: DebugLogBus::new(cfg.log_capacity),
                cfg,
                deps,
                spawner,
                children: parking_lot::Mutex::new(BTreeMap::new()),
                check,
            }
        })
    }

    /// The per-connection debug-log stream.
    pub fn debug_log(&self) -> &DebugLogBus {
        &self.log
    }

    /// Upserts the desired state of a connection.
    ///
    /// `None` for both `config` and `module_info` requests a stop; a record
    /// is only created when there is something to run. Always re-triggers
    /// the debounced connection check.
    pub fn queue_update_connection(
        &self,
        connection_id: &str,
        config: Option<ConnectionConfig>,
        module_info: Option<ModuleVersionInfo>,
    ) {
        let cell = {
            let mut children = self.children.lock();
            match children.get(connection_id) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let (Some(config), Some(module_info)) = (config.clone(), module_info.clone())
                    else {
                        tracing::debug!(%connection_id, "connection already stopped");
                        return;
                    };
                    let cell = Arc::new(ChildCell {
                        connection_id: connection_id.to_string(),
                        child: parking_lot::Mutex::new(ModuleChild::new(config, module_info)),
                    });
                    children.insert(connection_id.to_string(), Arc::clone(&cell));
                    cell
                }
            }
        };

        {
            let mut child = cell.child.lock();
            child.config = config;
            child.module_info = module_info;

            match child.state {
                WorkerState::Invalidated | WorkerState::InProgressInvalidated => {
                    // A state change is already queued.
                }
                WorkerState::InProgress => {
                    child.state = WorkerState::InProgressInvalidated;
                }
                WorkerState::Running => {
                    child.state = WorkerState::Invalidated;
                }
            }
        }

        self.check.trigger();
    }

    /// Returns the handler of a ready worker.
    ///
    /// With `allow_initialising`, a worker that has registered but not yet
    /// finished init is also eligible.
    pub fn get_child(
        &self,
        connection_id: &str,
        allow_initialising: bool,
    ) -> Option<Arc<ModuleClient>> {
        let children = self.children.lock();
        let cell = children.get(connection_id)?;
        let child = cell.child.lock();
        if child.is_ready || allow_initialising {
            child.handler.clone()
        } else {
            None
        }
    }

    /// Clears the desired config of every connection and waits up to
    /// `timeout_secs` poll intervals for the record map to drain.
    ///
    /// Returns early once empty; never force-waits past the timeout.
    pub async fn queue_stop_all_connections(&self, timeout_secs: u64) {
        {
            let children = self.children.lock();
            for cell in children.values() {
                let mut child = cell.child.lock();
                child.config = None;
                child.module_info = None;

                match child.state {
                    WorkerState::InProgress => {
                        child.state = WorkerState::InProgressInvalidated;
                    }
                    WorkerState::Invalidated | WorkerState::InProgressInvalidated => {
                        // Change already queued.
                    }
                    WorkerState::Running => {
                        child.state = WorkerState::Invalidated;
                    }
                }
            }
        }

        self.check.trigger();

        for _ in 0..timeout_secs {
            if self.children.lock().is_empty() {
                return;
            }
            time::sleep(self.cfg.stop_poll_interval).await;
        }
    }

    /// Forces a re-send of every feedback on every ready worker, which makes
    /// the modules re-subscribe them.
    pub fn resubscribe_all_feedbacks(&self) {
        for (_, handler) in self.ready_handlers() {
            handler.send_all_feedback_instances();
        }
    }

    /// Fans a changed-variables notification out to every ready worker.
    ///
    /// Per-worker failures are logged and do not abort the fan-out.
    pub fn on_variables_changed(&self, changed: HashSet<String>) {
        let changed = Arc::new(changed);
        for (connection_id, handler) in self.ready_handlers() {
            let changed = Arc::clone(&changed);
            tokio::spawn(async move {
                if let Err(err) = handler.send_variables_changed(&changed).await {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %err,
                        "sendVariablesChanged failed"
                    );
                }
            });
        }
    }

    /// Routes an entity update to its connection's worker.
    ///
    /// Returns false when no eligible worker exists (not handled).
    pub fn connection_entity_update(&self, entity: &EntityModel, control_id: &str) -> bool {
        let Some(handler) = self.get_child(entity.connection_id(), true) else {
            return false;
        };
        handler.entity_update(entity, control_id);
        true
    }

    /// Routes an entity deletion to its connection's worker.
    ///
    /// Returns false when no eligible worker exists (not handled).
    pub fn connection_entity_delete(&self, entity: &EntityModel) -> bool {
        let Some(handler) = self.get_child(entity.connection_id(), true) else {
            return false;
        };
        handler.entity_delete(entity.id());
        true
    }

    /// Asks the entity's worker to learn current option values.
    ///
    /// Returns `None` when no ready worker exists or the module declines;
    /// channel failures are logged, never propagated.
    pub async fn connection_entity_learn_options(
        &self,
        entity: &EntityModel,
        control_id: &str,
    ) -> Option<OptionValues> {
        let handler = self.get_child(entity.connection_id(), false)?;
        match handler.entity_learn_options(entity, control_id).await {
            Ok(options) => options,
            Err(err) => {
                tracing::warn!(
                    connection_id = %entity.connection_id(),
                    error = %err,
                    "entity learn failed"
                );
                None
            }
        }
    }

    fn ready_handlers(&self) -> Vec<(String, Arc<ModuleClient>)> {
        let children = self.children.lock();
        children
            .iter()
            .filter_map(|(connection_id, cell)| {
                let child = cell.child.lock();
                if !child.is_ready {
                    return None;
                }
                child
                    .handler
                    .as_ref()
                    .map(|handler| (connection_id.clone(), Arc::clone(handler)))
            })
            .collect()
    }

    // ---------------------------
    // Connection check pass
    // ---------------------------

    async fn run_connection_check(self: Arc<Self>) {
        let targets: Vec<Arc<ChildCell>> = {
            let children = self.children.lock();
            children
                .values()
                .filter(|cell| {
                    let mut child = cell.child.lock();
                    if child.state != WorkerState::Invalidated {
                        // Already in progress, or nothing to do.
                        return false;
                    }
                    child.state = WorkerState::InProgress;
                    true
                })
                .map(Arc::clone)
                .collect()
        };

        for cell in targets {
            tracing::debug!(connection_id = %cell.connection_id, "updating connection state");
            tokio::spawn(Arc::clone(&self).process_connection_state(cell));
        }
    }

    async fn process_connection_state(self: Arc<Self>, cell: Arc<ChildCell>) {
        enum Decision {
            Stop,
            DelayPending,
            Start,
        }

        let decision = {
            let mut child = cell.child.lock();
            if child.config.is_none() || child.module_info.is_none() {
                child.delay_start_until = None;
                Decision::Stop
            } else if child
                .delay_start_until
                .is_some_and(|until| until > Instant::now())
            {
                Decision::DelayPending
            } else {
                child.delay_start_until = None;
                Decision::Start
            }
        };

        match decision {
            Decision::Stop => self.finish_stopped_connection(&cell).await,
            Decision::DelayPending => {
                // Fold the attempt back and re-arm a wake-up for whatever is
                // left of the delay. The wake-up the forced restart booked
                // may already have fired while this attempt was in flight.
                let (recheck, remaining) = {
                    let mut child = cell.child.lock();
                    let recheck = child.state == WorkerState::InProgressInvalidated;
                    child.state = WorkerState::Invalidated;
                    let remaining = child
                        .delay_start_until
                        .map(|until| until.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    (recheck, remaining)
                };

                let host = Arc::clone(&self);
                tokio::spawn(async move {
                    time::sleep(remaining).await;
                    host.check.trigger();
                });
                if recheck {
                    self.check.trigger();
                }
            }
            Decision::Start => {
                if let Err(err) = self.start_worker(&cell).await {
                    tracing::error!(
                        connection_id = %cell.connection_id,
                        error = %err,
                        "failed to start connection"
                    );
                    self.log.log(
                        &cell.connection_id,
                        DebugLogLevel::Error,
                        format!("Failed to start connection: {err}"),
                    );
                    self.schedule_backoff(&cell);
                }
                // On success the attempt completes asynchronously: the
                // registration handshake and init call advance the state.
            }
        }
    }

    async fn finish_stopped_connection(&self, cell: &Arc<ChildCell>) {
        tracing::debug!(connection_id = %cell.connection_id, "stopping connection");
        self.stop_worker(cell).await;

        let outcome = {
            let mut child = cell.child.lock();
            match child.state {
                WorkerState::InProgress => StopOutcome::Delete(child.creation_id),
                WorkerState::InProgressInvalidated => {
                    child.state = WorkerState::Invalidated;
                    StopOutcome::Recheck
                }
                WorkerState::Invalidated | WorkerState::Running => {
                    // Shouldn't get here, but make sure we don't get stuck.
                    child.state = WorkerState::Invalidated;
                    StopOutcome::Recover
                }
            }
        };

        match outcome {
            StopOutcome::Delete(creation_id) => {
                self.deps.status.update_connection_status(
                    &cell.connection_id,
                    Some(StatusCategory::Disabled),
                    None,
                );

                let mut children = self.children.lock();
                let matches = children
                    .get(&cell.connection_id)
                    .is_some_and(|existing| existing.child.lock().creation_id == creation_id);
                if matches {
                    children.remove(&cell.connection_id);
                }
            }
            StopOutcome::Recheck => self.check.trigger(),
            StopOutcome::Recover => {
                tracing::error!(
                    connection_id = %cell.connection_id,
                    "invalid state for stopped connection"
                );
                self.check.trigger();
            }
        }
    }

    // ---------------------------
    // Stop / start sequences
    // ---------------------------

    /// Stops whatever is running for this record and waits for it to wind
    /// down. Safe to call when nothing runs.
    async fn stop_worker(&self, cell: &Arc<ChildCell>) {
        let (handler, process, listener) = {
            let mut child = cell.child.lock();
            // No in-flight registration may succeed past this point.
            child.auth_token = None;
            child.is_ready = false;
            child.delay_start_until = None;
            (
                child.handler.take(),
                child.process.take(),
                child.listener.take(),
            )
        };

        if let Some(handler) = handler {
            if let Err(err) = handler.destroy().await {
                tracing::warn!(
                    connection_id = %cell.connection_id,
                    error = %err,
                    "module destroy failed"
                );
            }
        }
        if let Some(process) = process {
            process.stop().await;
        }
        if let Some(listener) = listener {
            let _ = listener.await;
        }

        // Supersede any handshake or init still in flight for the stopped
        // process; its completion must not mark this record ready.
        cell.child.lock().attempt += 1;
    }

    async fn start_worker(self: &Arc<Self>, cell: &Arc<ChildCell>) -> Result<(), SpawnError> {
        // Make sure the worker is not already running.
        self.stop_worker(cell).await;

        let (config, module_info) = {
            let child = cell.child.lock();
            (child.config.clone(), child.module_info.clone())
        };
        let (Some(config), Some(module_info)) = (config, module_info) else {
            return Err(SpawnError::MissingTarget);
        };

        tracing::info!(
            connection_id = %cell.connection_id,
            label = %config.label,
            "starting connection"
        );

        let resolved = check_module_compatibility(
            self.deps.resolver.as_ref(),
            &self.cfg.module_api_range,
            &module_info,
        )
        .await?;
        let entrypoint = resolve_entrypoint(&module_info).await?;

        let auth_token = Uuid::new_v4().to_string();
        let attempt = {
            let mut child = cell.child.lock();
            child.attempt += 1;
            child.auth_token = Some(auth_token.clone());
            child.skip_api_version_check = !module_info.is_packaged;
            child.attempt
        };

        let inspect_port = if module_info.is_packaged {
            None
        } else {
            read_inspect_port(&module_info).await
        };
        let command = build_launch_command(
            &self.cfg,
            &module_info,
            &resolved,
            inspect_port,
            &cell.connection_id,
            &auth_token,
        );

        self.log.log(
            &cell.connection_id,
            DebugLogLevel::System,
            format!("** Starting connection from \"{}\" **", entrypoint.display()),
        );

        let spawned = self.spawner.spawn(command).await?;
        let listener = tokio::spawn(Arc::clone(self).run_process_listener(
            Arc::clone(cell),
            attempt,
            spawned.events,
            Arc::clone(&spawned.handle),
            config.label.clone(),
            module_info.is_dev(),
        ));

        {
            let mut child = cell.child.lock();
            child.process = Some(spawned.handle);
            child.listener = Some(listener);
        }

        Ok(())
    }

    /// Books a delayed retry for a start attempt that failed before any
    /// process existed.
    fn schedule_backoff(self: &Arc<Self>, cell: &Arc<ChildCell>) {
        let mut child = cell.child.lock();
        child.restart_count += 1;
        child.state = WorkerState::Invalidated;
        if child.delay_start_until.is_none() {
            let delay = self.cfg.backoff.next(child.restart_count);
            child.delay_start_until = Some(Instant::now() + delay);

            let host = Arc::clone(self);
            tokio::spawn(async move {
                time::sleep(delay).await;
                host.check.trigger();
            });
        }
    }

    /// Force-restarts a worker whose attempt `expected_attempt` failed:
    /// increments the restart count, books the backoff delay, invalidates
    /// the record, and stops the process immediately.
    ///
    /// No-op when the attempt has already been superseded.
    fn force_restart(self: &Arc<Self>, cell: &Arc<ChildCell>, expected_attempt: u64) {
        let (process, handler) = {
            let mut child = cell.child.lock();
            if child.attempt != expected_attempt {
                return;
            }
            // Stale callbacks of this attempt die here.
            child.attempt += 1;
            child.restart_count += 1;
            child.auth_token = None;
            child.is_ready = false;
            child.state = WorkerState::Invalidated;
            child.listener = None;

            if child.delay_start_until.is_none() {
                let delay = self.cfg.backoff.next(child.restart_count);
                child.delay_start_until = Some(Instant::now() + delay);

                let host = Arc::clone(self);
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    host.check.trigger();
                });
            }

            (child.process.take(), child.handler.take())
        };

        self.deps.status.update_connection_status(
            &cell.connection_id,
            Some(StatusCategory::Crashed),
            None,
        );

        if let Some(handler) = handler {
            handler.cleanup();
        }
        if let Some(process) = process {
            tokio::spawn(async move { process.stop().await });
        }
    }

    // ---------------------------
    // Process events and handshake
    // ---------------------------

    async fn run_process_listener(
        self: Arc<Self>,
        cell: Arc<ChildCell>,
        attempt: u64,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        process: Arc<dyn ProcessHandle>,
        label: String,
        is_dev: bool,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Started => {
                    if !self.attempt_is_current(&cell, attempt) {
                        continue;
                    }
                    {
                        let mut child = cell.child.lock();
                        child.is_ready = false;
                        if let Some(handler) = child.handler.take() {
                            handler.cleanup();
                        }
                    }
                    tracing::debug!(connection_id = %cell.connection_id, label = %label, "connection started");
                    self.log.log(
                        &cell.connection_id,
                        DebugLogLevel::System,
                        "** Connection started **",
                    );
                }
                ProcessEvent::Stopped => {
                    if !self.attempt_is_current(&cell, attempt) {
                        continue;
                    }
                    let delay_pending = {
                        let mut child = cell.child.lock();
                        child.is_ready = false;
                        if let Some(handler) = child.handler.take() {
                            handler.cleanup();
                        }
                        child.delay_start_until.is_some()
                    };
                    let status = if delay_pending {
                        StatusCategory::Crashed
                    } else {
                        StatusCategory::Stopped
                    };
                    self.deps
                        .status
                        .update_connection_status(&cell.connection_id, Some(status), None);
                    tracing::debug!(
                        connection_id = %cell.connection_id,
                        label = %label,
                        status = status.as_label(),
                        "connection stopped"
                    );
                    self.log.log(
                        &cell.connection_id,
                        DebugLogLevel::System,
                        "** Connection stopped **",
                    );
                    self.deps
                        .recorder
                        .connection_availability_change(&cell.connection_id, false);
                }
                ProcessEvent::Crashed => {
                    if !self.attempt_is_current(&cell, attempt) {
                        continue;
                    }
                    {
                        let mut child = cell.child.lock();
                        child.is_ready = false;
                        if let Some(handler) = child.handler.take() {
                            handler.cleanup();
                        }
                    }
                    tracing::debug!(connection_id = %cell.connection_id, label = %label, "connection crashed");
                    self.log.log(
                        &cell.connection_id,
                        DebugLogLevel::System,
                        "** Connection crashed **",
                    );
                    self.deps
                        .recorder
                        .connection_availability_change(&cell.connection_id, false);
                    self.force_restart(&cell, attempt);
                }
                ProcessEvent::Exited => break,
                ProcessEvent::Stdout(line) => {
                    if is_dev {
                        // Only worth logging for modules under development.
                        tracing::debug!(connection_id = %cell.connection_id, "stdout: {line}");
                    }
                    if self.log.has_subscribers() {
                        self.log
                            .log(&cell.connection_id, DebugLogLevel::Console, line);
                    }
                }
                ProcessEvent::Stderr(line) => {
                    tracing::debug!(connection_id = %cell.connection_id, "stderr: {line}");
                    if self.log.has_subscribers() {
                        self.log.log(&cell.connection_id, DebugLogLevel::Error, line);
                    }
                }
                ProcessEvent::Message(message) => {
                    if message.name == MSG_REGISTER {
                        tokio::spawn(Arc::clone(&self).handle_register(
                            Arc::clone(&cell),
                            attempt,
                            Arc::clone(&process),
                            message,
                        ));
                    } else {
                        tracing::debug!(
                            connection_id = %cell.connection_id,
                            name = %message.name,
                            "unhandled message from module"
                        );
                    }
                }
            }
        }
    }

    fn attempt_is_current(&self, cell: &Arc<ChildCell>, attempt: u64) -> bool {
        cell.child.lock().attempt == attempt
    }

    /// Registration handshake: validate the API version and the single-use
    /// token, bind the handler, ack, then run init.
    async fn handle_register(
        self: Arc<Self>,
        cell: Arc<ChildCell>,
        attempt: u64,
        process: Arc<dyn ProcessHandle>,
        message: InboundMessage,
    ) {
        let connection_id = cell.connection_id.clone();
        let Some(callback_id) = message.callback_id else {
            tracing::debug!(%connection_id, "register without callback id");
            return;
        };

        let payload: RegisterPayload = match serde_json::from_value(message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(%connection_id, error = %err, "malformed register payload");
                self.force_restart(&cell, attempt);
                return;
            }
        };

        let (skip_api_check, token_matches) = {
            let child = cell.child.lock();
            if child.attempt != attempt {
                return;
            }
            (
                child.skip_api_version_check,
                child.auth_token.as_deref() == Some(payload.verification_token.as_str()),
            )
        };

        if !skip_api_check && !self.cfg.module_api_range.matches(&payload.api_version) {
            tracing::debug!(
                connection_id,
                api_version = %payload.api_version,
                "register for unsupported api version"
            );
            self.log.log(
                &connection_id,
                DebugLogLevel::Error,
                format!(
                    "Got register for unsupported api version \"{}\"",
                    payload.api_version
                ),
            );
            self.force_restart(&cell, attempt);
            return;
        }

        if !token_matches {
            tracing::debug!(%connection_id, "register with bad auth token");
            self.force_restart(&cell, attempt);
            return;
        }

        let Some(channel) = process.channel() else {
            tracing::debug!(%connection_id, "register with no channel bound");
            self.force_restart(&cell, attempt);
            return;
        };

        let handler = ModuleClient::new(&self.deps, &self.cfg, Arc::clone(&channel), &connection_id);
        let config = {
            let mut child = cell.child.lock();
            if child.attempt != attempt {
                return;
            }
            child.handler = Some(Arc::clone(&handler));
            child.config.clone()
        };
        let Some(config) = config else {
            tracing::debug!(%connection_id, "missing config for registering connection");
            self.force_restart(&cell, attempt);
            return;
        };

        tracing::debug!(%connection_id, "registered module client");
        if let Err(err) = channel.respond(callback_id, Ok(serde_json::json!({}))).await {
            tracing::warn!(%connection_id, error = %err, "register ack failed");
            self.force_restart(&cell, attempt);
            return;
        }

        self.deps.status.update_connection_status(
            &connection_id,
            Some(StatusCategory::Initializing),
            None,
        );

        match handler.init(&config).await {
            Ok(_) => {
                let recheck = {
                    let mut child = cell.child.lock();
                    if child.attempt != attempt {
                        return;
                    }
                    child.restart_count = 0;
                    let recheck = match child.state {
                        WorkerState::InProgress => {
                            child.state = WorkerState::Running;
                            false
                        }
                        WorkerState::InProgressInvalidated => {
                            child.state = WorkerState::Invalidated;
                            true
                        }
                        WorkerState::Invalidated | WorkerState::Running => {
                            // Already the next state in this cycle; leave it.
                            false
                        }
                    };
                    child.is_ready = true;
                    recheck
                };
                if recheck {
                    self.check.trigger();
                }
                self.deps
                    .recorder
                    .connection_availability_change(&connection_id, true);
            }
            Err(err) => {
                tracing::warn!(
                    connection_id,
                    label = %config.label,
                    error = %err,
                    "connection failed to init"
                );
                self.log.log(
                    &connection_id,
                    DebugLogLevel::Error,
                    format!("Failed to init: {err}"),
                );
                self.force_restart(&cell, attempt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MSG_INIT, MSG_LEARN_ACTION, MSG_UPDATE_FEEDBACKS, MSG_VARIABLES_CHANGED};
    use crate::model::{
        ActionModel, FeedbackModel, ModuleManifest, ModuleRuntime, RuntimeProtocol,
    };
    use crate::policies::BackoffPolicy;
    use crate::testing::{test_deps, MockProcess, MockSpawner, TestDeps};
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const SETTLE: Duration = Duration::from_millis(150);

    fn test_config() -> HostConfig {
        HostConfig {
            debounce_wait: Duration::from_millis(10),
            debounce_max_wait: Duration::from_millis(50),
            stop_poll_interval: Duration::from_millis(50),
            kill_timeout: Duration::from_millis(100),
            module_api_range: "^1".parse().expect("test range"),
            backoff: BackoffPolicy {
                quick_attempts: 3,
                min: Duration::from_millis(60),
                max: Duration::from_millis(200),
            },
            log_capacity: 64,
        }
    }

    struct Harness {
        host: Arc<ModuleHost>,
        deps: TestDeps,
        spawner: Arc<MockSpawner>,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let deps = test_deps();
        let spawner = MockSpawner::new();
        let host = ModuleHost::new(
            test_config(),
            deps.deps.clone(),
            Arc::clone(&spawner) as Arc<dyn ProcessSpawner>,
        );
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.js"), "// entry").expect("write entrypoint");
        Harness {
            host,
            deps,
            spawner,
            dir,
        }
    }

    fn module_info(base_path: &Path) -> ModuleVersionInfo {
        ModuleVersionInfo {
            manifest: ModuleManifest {
                id: "camera".into(),
                name: "Camera".into(),
                runtime: ModuleRuntime {
                    protocol: RuntimeProtocol::SocketJson,
                    kind: "node22".into(),
                    entrypoint: "main.js".into(),
                    api_version: "1.2.0".parse().expect("test version"),
                },
            },
            base_path: base_path.to_path_buf(),
            is_packaged: true,
            version_id: "1.0.0".into(),
        }
    }

    fn config(label: &str) -> ConnectionConfig {
        ConnectionConfig {
            label: label.into(),
            enabled: true,
            config: json!({ "host": "10.0.0.1" }),
        }
    }

    fn action(id: &str, connection_id: &str) -> EntityModel {
        EntityModel::Action(ActionModel {
            id: id.into(),
            connection_id: connection_id.into(),
            definition_id: "press".into(),
            options: Default::default(),
            upgrade_index: Some(0),
            disabled: false,
        })
    }

    fn feedback(id: &str, connection_id: &str) -> EntityModel {
        EntityModel::Feedback(FeedbackModel {
            id: id.into(),
            connection_id: connection_id.into(),
            definition_id: "tally".into(),
            options: Default::default(),
            upgrade_index: Some(0),
            disabled: false,
            is_inverted: false,
            style: None,
        })
    }

    /// Drives the harness to a fully ready worker and returns its process.
    async fn ready_worker(h: &Harness) -> Arc<MockProcess> {
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );
        let process = h.spawner.wait_for(1).await;
        process.send_register("1.2.0");
        tokio::time::sleep(SETTLE).await;
        assert!(
            h.host.get_child("conn-1", false).is_some(),
            "worker did not become ready"
        );
        process
    }

    #[tokio::test]
    async fn test_happy_path_register_init_ready() {
        let h = harness();
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );

        let process = h.spawner.wait_for(1).await;
        assert_eq!(
            process.command().env_value(crate::host::CONNECTION_ID_ENV),
            Some("conn-1")
        );
        let token = process.verification_token().expect("token in env");
        assert!(!token.is_empty());

        // Nothing available before the handshake.
        assert!(h.host.get_child("conn-1", false).is_none());
        assert!(h.host.get_child("conn-1", true).is_none());

        let init_gate = process.channel().script_pending(MSG_INIT);
        process.send_register("1.2.0");
        tokio::time::sleep(SETTLE).await;

        // Registered, acked, initializing reported; init still in flight.
        assert_eq!(process.channel().responses().len(), 1);
        assert!(h
            .deps
            .status
            .saw("conn-1", Some(StatusCategory::Initializing)));
        assert!(h.host.get_child("conn-1", false).is_none());
        assert!(h.host.get_child("conn-1", true).is_some());

        init_gate
            .send(Ok(json!({ "newUpgradeIndex": 0 })))
            .expect("init gate");
        tokio::time::sleep(SETTLE).await;

        assert!(h.host.get_child("conn-1", false).is_some());
        assert!(h.deps.recorder.saw("conn-1", true));
    }

    #[tokio::test]
    async fn test_register_with_bad_token_forces_restart() {
        let h = harness();
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );

        let first = h.spawner.wait_for(1).await;
        let first_token = first.verification_token().expect("token");
        first.send_register_with_token("1.2.0", "not-the-token");
        tokio::time::sleep(SETTLE).await;

        // No ack, no init.
        assert_eq!(first.channel().responses().len(), 0);
        assert_eq!(first.channel().call_count(MSG_INIT), 0);
        assert!(first.stop_requested());

        // Backoff elapses and a fresh attempt starts with a fresh token.
        let second = h.spawner.wait_for(2).await;
        let second_token = second.verification_token().expect("token");
        assert_ne!(first_token, second_token);
    }

    #[tokio::test]
    async fn test_register_with_incompatible_api_version_forces_restart() {
        let h = harness();
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );

        let first = h.spawner.wait_for(1).await;
        first.send_register("3.0.0");
        tokio::time::sleep(SETTLE).await;

        assert_eq!(first.channel().call_count(MSG_INIT), 0);
        assert!(first.stop_requested());
        let _ = h.spawner.wait_for(2).await;
    }

    #[tokio::test]
    async fn test_dev_module_skips_handshake_api_check() {
        let h = harness();
        h.deps.resolver.set_dev_api_version("1.5.0");
        let mut info = module_info(h.dir.path());
        info.is_packaged = false;
        info.version_id = "dev".into();
        h.host
            .queue_update_connection("conn-1", Some(config("cam")), Some(info));

        let process = h.spawner.wait_for(1).await;
        process.send_register("9.9.9");
        tokio::time::sleep(SETTLE).await;

        assert_eq!(process.channel().call_count(MSG_INIT), 1);
        assert!(h.host.get_child("conn-1", false).is_some());
    }

    #[tokio::test]
    async fn test_config_update_during_attempt_recycles_worker() {
        let h = harness();
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );

        let first = h.spawner.wait_for(1).await;
        let init_gate = first.channel().script_pending(MSG_INIT);
        first.send_register("1.2.0");
        tokio::time::sleep(SETTLE).await;

        // Attempt is in flight (init pending): the new config must pass
        // through IN_PROGRESS_INVALIDATED, not be lost.
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam-renamed")),
            Some(module_info(h.dir.path())),
        );
        init_gate
            .send(Ok(json!({ "newUpgradeIndex": 0 })))
            .expect("init gate");

        // Exactly one re-check: the first worker stops, a second starts.
        let second = h.spawner.wait_for(2).await;
        assert!(first.stop_requested());
        tokio::time::sleep(SETTLE).await;
        assert_eq!(h.spawner.spawn_count(), 2);

        // The settled worker is not ready until the new attempt completes.
        assert!(h.host.get_child("conn-1", false).is_none());
        second.send_register("1.2.0");
        tokio::time::sleep(SETTLE).await;
        assert!(h.host.get_child("conn-1", false).is_some());
    }

    #[tokio::test]
    async fn test_crash_reports_status_and_restarts() {
        let h = harness();
        let process = ready_worker(&h).await;

        process.crash();
        tokio::time::sleep(SETTLE).await;

        assert!(h.deps.status.saw("conn-1", Some(StatusCategory::Crashed)));
        assert!(h.deps.recorder.saw("conn-1", false));
        assert!(h.host.get_child("conn-1", false).is_none());

        // Backoff elapses; a fresh process appears with a fresh token.
        let second = h.spawner.wait_for(2).await;
        assert_ne!(
            process.verification_token(),
            second.verification_token()
        );
    }

    #[tokio::test]
    async fn test_init_failure_forces_restart() {
        let h = harness();
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );

        let first = h.spawner.wait_for(1).await;
        first.channel().script(MSG_INIT, Err("config rejected".into()));
        first.send_register("1.2.0");
        tokio::time::sleep(SETTLE).await;

        assert!(h.host.get_child("conn-1", false).is_none());
        assert!(first.stop_requested());
        let _ = h.spawner.wait_for(2).await;
    }

    #[tokio::test]
    async fn test_stop_all_connections_drains_records() {
        let h = harness();
        let process = ready_worker(&h).await;

        h.host.queue_stop_all_connections(10).await;

        assert!(h.host.get_child("conn-1", true).is_none());
        assert!(process.stop_requested());
        assert_eq!(process.channel().call_count("destroy"), 1);
        assert!(h.deps.status.saw("conn-1", Some(StatusCategory::Disabled)));
    }

    #[tokio::test]
    async fn test_missing_entrypoint_never_spawns() {
        let h = harness();
        std::fs::remove_file(h.dir.path().join("main.js")).expect("remove entrypoint");
        h.host.queue_update_connection(
            "conn-1",
            Some(config("cam")),
            Some(module_info(h.dir.path())),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.spawner.spawn_count(), 0);
        // The record survives for later retries.
        assert!(h.host.get_child("conn-1", true).is_none());
    }

    #[tokio::test]
    async fn test_incompatible_packaged_module_never_spawns() {
        let h = harness();
        let mut info = module_info(h.dir.path());
        info.manifest.runtime.api_version = "2.0.0".parse().expect("test version");
        h.host
            .queue_update_connection("conn-1", Some(config("cam")), Some(info));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_request_for_unknown_connection_is_noop() {
        let h = harness();
        h.host.queue_update_connection("ghost", None, None);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(h.spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_variables_changed_fans_out_to_ready_workers() {
        let h = harness();
        let process = ready_worker(&h).await;

        h.host
            .on_variables_changed(HashSet::from(["tally-source".to_string()]));
        tokio::time::sleep(SETTLE).await;

        let calls = process.channel().calls(MSG_VARIABLES_CHANGED);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["changedVariableIds"], json!(["tally-source"]));
    }

    #[tokio::test]
    async fn test_entity_passthroughs_and_resubscribe() {
        let h = harness();
        let process = ready_worker(&h).await;

        assert!(h.host.connection_entity_update(&feedback("fb-1", "conn-1"), "ctl-1"));
        tokio::time::sleep(SETTLE).await;
        assert_eq!(process.channel().call_count(MSG_UPDATE_FEEDBACKS), 1);

        h.host.resubscribe_all_feedbacks();
        tokio::time::sleep(SETTLE).await;
        assert_eq!(process.channel().call_count(MSG_UPDATE_FEEDBACKS), 2);

        assert!(h.host.connection_entity_delete(&feedback("fb-1", "conn-1")));
        tokio::time::sleep(SETTLE).await;
        let calls = process.channel().calls(MSG_UPDATE_FEEDBACKS);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2]["feedbacks"]["fb-1"], serde_json::Value::Null);

        // No worker for this connection: not handled.
        assert!(!h.host.connection_entity_update(&action("act-1", "conn-2"), "ctl-1"));
    }

    #[tokio::test]
    async fn test_learn_options_requires_ready_worker() {
        let h = harness();

        // No worker at all.
        assert!(h
            .host
            .connection_entity_learn_options(&action("act-1", "conn-1"), "ctl-1")
            .await
            .is_none());

        let process = ready_worker(&h).await;
        process.channel().script(
            MSG_LEARN_ACTION,
            Ok(json!({ "options": { "speed": 5 } })),
        );

        let learned = h
            .host
            .connection_entity_learn_options(&action("act-1", "conn-1"), "ctl-1")
            .await
            .expect("learned options");
        assert_eq!(learned["speed"], json!(5));
    }

    #[tokio::test]
    async fn test_debug_log_carries_lifecycle_markers() {
        let h = harness();
        let mut log = h.host.debug_log().subscribe();

        let _process = ready_worker(&h).await;

        let mut saw_starting = false;
        while let Ok(event) = log.try_recv() {
            if event.level == DebugLogLevel::System && event.line.contains("** Starting connection") {
                saw_starting = true;
            }
        }
        assert!(saw_starting, "start marker missing from debug log");
    }
}
