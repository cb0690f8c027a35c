//! In-memory fakes for exercising the host without real processes.
//!
//! Everything here is deterministic and in-process: a recording message
//! channel with scriptable responses, a mock spawner/process pair that the
//! test drives by emitting [`ProcessEvent`]s, and static implementations of
//! every collaborator seam. [`test_deps`] bundles a fresh set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{InboundMessage, MessageChannel, MSG_REGISTER};
use crate::deps::{
    ActionRecorder, ControlHandle, ControlLocation, ControlLookup, EntityDefinitions, HostDeps,
    LocationLookup, ModuleResolver, ParsedVariables, StatusReporter, VariableResolver,
};
use crate::error::{ChannelError, SpawnError};
use crate::host::{CONNECTION_ID_ENV, VERIFICATION_TOKEN_ENV};
use crate::model::{
    EntityDefinition, EntityKind, EntityModel, ImageSize, StatusCategory,
};
use crate::process::{
    LaunchCommand, ProcessEvent, ProcessHandle, ProcessSpawner, SpawnedProcess,
};

enum Scripted {
    Ready(Result<serde_json::Value, String>),
    Pending(oneshot::Receiver<Result<serde_json::Value, String>>),
}

/// [`MessageChannel`] that records every call and answers from a script.
///
/// Unscripted calls resolve to an empty object, which every response type
/// in the crate tolerates via serde defaults.
pub struct RecordingChannel {
    calls: parking_lot::Mutex<Vec<(String, serde_json::Value)>>,
    scripts: parking_lot::Mutex<HashMap<String, VecDeque<Scripted>>>,
    responses: parking_lot::Mutex<Vec<(u64, Result<serde_json::Value, String>)>>,
}

impl RecordingChannel {
    /// Creates an empty channel.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: parking_lot::Mutex::new(Vec::new()),
            scripts: parking_lot::Mutex::new(HashMap::new()),
            responses: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Queues one response for the next call named `name`.
    ///
    /// `Err` values surface to the caller as [`ChannelError::Remote`].
    pub fn script(&self, name: &str, result: Result<serde_json::Value, String>) {
        self.scripts
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(Scripted::Ready(result));
    }

    /// Queues a gated response: the call blocks until the returned sender
    /// fires (or fails with a remote error when the sender is dropped).
    pub fn script_pending(&self, name: &str) -> oneshot::Sender<Result<serde_json::Value, String>> {
        let (tx, rx) = oneshot::channel();
        self.scripts
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(Scripted::Pending(rx));
        tx
    }

    /// Payloads of every call named `name`, in send order.
    pub fn calls(&self, name: &str) -> Vec<serde_json::Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(call_name, _)| call_name == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of calls named `name`.
    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(call_name, _)| call_name == name)
            .count()
    }

    /// Total number of calls of any name.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every response sent with [`MessageChannel::respond`].
    pub fn responses(&self) -> Vec<(u64, Result<serde_json::Value, String>)> {
        self.responses.lock().clone()
    }
}

#[async_trait]
impl MessageChannel for RecordingChannel {
    async fn send_with_callback(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        self.calls.lock().push((name.to_string(), payload));

        let scripted = self
            .scripts
            .lock()
            .get_mut(name)
            .and_then(|queue| queue.pop_front());
        let result = match scripted {
            None => Ok(serde_json::json!({})),
            Some(Scripted::Ready(result)) => result,
            Some(Scripted::Pending(rx)) => match rx.await {
                Ok(result) => result,
                Err(_) => Err("scripted response dropped".to_string()),
            },
        };
        result.map_err(ChannelError::Remote)
    }

    async fn respond(
        &self,
        callback_id: u64,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), ChannelError> {
        self.responses.lock().push((callback_id, result));
        Ok(())
    }
}

/// Scripted stand-in for one worker process.
///
/// The test drives it by emitting [`ProcessEvent`]s; the supervisor's
/// listener consumes them exactly as it would a real process's.
pub struct MockProcess {
    command: LaunchCommand,
    channel: Arc<RecordingChannel>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    stop_requested: AtomicBool,
    exited: AtomicBool,
}

impl MockProcess {
    /// The launch command this process was spawned with.
    pub fn command(&self) -> &LaunchCommand {
        &self.command
    }

    /// The recording channel bound to this process.
    pub fn channel(&self) -> Arc<RecordingChannel> {
        Arc::clone(&self.channel)
    }

    /// Emits one process event toward the supervisor's listener.
    pub fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event);
    }

    /// The auth token handed to this process at launch.
    pub fn verification_token(&self) -> Option<String> {
        self.command
            .env_value(VERIFICATION_TOKEN_ENV)
            .map(str::to_string)
    }

    /// Sends a well-formed `register` call using the launch token.
    pub fn send_register(&self, api_version: &str) {
        let token = self.verification_token().unwrap_or_default();
        self.send_register_with_token(api_version, &token);
    }

    /// Sends a `register` call with an explicit token.
    pub fn send_register_with_token(&self, api_version: &str, token: &str) {
        let connection_id = self.command.env_value(CONNECTION_ID_ENV).unwrap_or_default();
        self.emit(ProcessEvent::Message(InboundMessage {
            name: MSG_REGISTER.to_string(),
            callback_id: Some(1),
            payload: serde_json::json!({
                "apiVersion": api_version,
                "connectionId": connection_id,
                "verificationToken": token,
            }),
        }));
    }

    /// Simulates an unexpected exit.
    pub fn crash(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(ProcessEvent::Crashed);
        self.emit(ProcessEvent::Exited);
    }

    /// True once the supervisor requested a stop.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn channel(&self) -> Option<Arc<dyn MessageChannel>> {
        Some(Arc::clone(&self.channel) as Arc<dyn MessageChannel>)
    }

    async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(ProcessEvent::Stopped);
        self.emit(ProcessEvent::Exited);
    }
}

/// [`ProcessSpawner`] that hands out [`MockProcess`]es.
pub struct MockSpawner {
    processes: parking_lot::Mutex<Vec<Arc<MockProcess>>>,
}

impl MockSpawner {
    /// Creates an empty spawner.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Number of processes spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Returns the `index`-th spawned process.
    ///
    /// Panics when it does not exist; pair with [`MockSpawner::wait_for`].
    pub fn process(&self, index: usize) -> Arc<MockProcess> {
        Arc::clone(&self.processes.lock()[index])
    }

    /// Polls until at least `count` processes have spawned and returns the
    /// latest of them. Panics after ~2s.
    pub async fn wait_for(&self, count: usize) -> Arc<MockProcess> {
        for _ in 0..200 {
            if self.spawn_count() >= count {
                return self.process(count - 1);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker process {count} was not spawned in time");
    }
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    async fn spawn(&self, command: LaunchCommand) -> Result<SpawnedProcess, SpawnError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let process = Arc::new(MockProcess {
            command,
            channel: RecordingChannel::new(),
            events: events_tx,
            stop_requested: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        process.emit(ProcessEvent::Started);
        self.processes.lock().push(Arc::clone(&process));

        Ok(SpawnedProcess {
            handle: Arc::clone(&process) as Arc<dyn ProcessHandle>,
            events: events_rx,
        })
    }
}

/// [`StatusReporter`] that records every update.
pub struct CountingStatus {
    updates: parking_lot::Mutex<Vec<(String, Option<StatusCategory>, Option<String>)>>,
}

impl CountingStatus {
    /// Creates an empty reporter.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Every update received, in order.
    pub fn updates(&self) -> Vec<(String, Option<StatusCategory>, Option<String>)> {
        self.updates.lock().clone()
    }

    /// True when any update matched the connection and category.
    pub fn saw(&self, connection_id: &str, category: Option<StatusCategory>) -> bool {
        self.updates
            .lock()
            .iter()
            .any(|(id, status, _)| id == connection_id && *status == category)
    }
}

impl StatusReporter for CountingStatus {
    fn update_connection_status(
        &self,
        connection_id: &str,
        status: Option<StatusCategory>,
        message: Option<&str>,
    ) {
        self.updates.lock().push((
            connection_id.to_string(),
            status,
            message.map(str::to_string),
        ));
    }
}

/// [`ActionRecorder`] that records availability changes.
pub struct RecordingRecorder {
    changes: parking_lot::Mutex<Vec<(String, bool)>>,
}

impl RecordingRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            changes: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Every availability change received, in order.
    pub fn changes(&self) -> Vec<(String, bool)> {
        self.changes.lock().clone()
    }

    /// True when any change matched the connection and availability.
    pub fn saw(&self, connection_id: &str, available: bool) -> bool {
        self.changes
            .lock()
            .iter()
            .any(|(id, avail)| id == connection_id && *avail == available)
    }
}

impl ActionRecorder for RecordingRecorder {
    fn connection_availability_change(&self, connection_id: &str, available: bool) {
        self.changes
            .lock()
            .push((connection_id.to_string(), available));
    }
}

/// [`ControlHandle`] that records entity replacements.
pub struct FakeControl {
    bitmap: Option<ImageSize>,
    replaced: parking_lot::Mutex<Vec<EntityModel>>,
}

impl FakeControl {
    /// A control without a bitmap.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bitmap: None,
            replaced: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// A control reporting the given bitmap size.
    pub fn with_bitmap(size: ImageSize) -> Arc<Self> {
        Arc::new(Self {
            bitmap: Some(size),
            replaced: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Every entity replacement received, in order.
    pub fn replaced(&self) -> Vec<EntityModel> {
        self.replaced.lock().clone()
    }
}

impl ControlHandle for FakeControl {
    fn entity_replace(&self, entity: EntityModel) {
        self.replaced.lock().push(entity);
    }

    fn bitmap_size(&self) -> Option<ImageSize> {
        self.bitmap
    }
}

/// [`ControlLookup`] over a static map.
pub struct StaticControls {
    controls: parking_lot::Mutex<HashMap<String, Arc<FakeControl>>>,
}

impl StaticControls {
    /// Creates an empty lookup.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            controls: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Registers a control.
    pub fn insert(&self, control_id: &str, control: Arc<FakeControl>) {
        self.controls
            .lock()
            .insert(control_id.to_string(), control);
    }
}

impl ControlLookup for StaticControls {
    fn get_control(&self, control_id: &str) -> Option<Arc<dyn ControlHandle>> {
        self.controls
            .lock()
            .get(control_id)
            .map(|control| Arc::clone(control) as Arc<dyn ControlHandle>)
    }
}

/// [`VariableResolver`] resolving `$(name)` references from a static map.
///
/// Unknown references resolve to an empty string but are still reported in
/// the referenced-variable set.
pub struct FakeVariables {
    values: parking_lot::Mutex<HashMap<String, String>>,
}

impl FakeVariables {
    /// Creates an empty resolver.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Sets a variable value.
    pub fn set(&self, name: &str, value: &str) {
        self.values
            .lock()
            .insert(name.to_string(), value.to_string());
    }
}

impl VariableResolver for FakeVariables {
    fn parse_variables(&self, text: &str, _location: Option<&ControlLocation>) -> ParsedVariables {
        let values = self.values.lock();
        let mut resolved = String::new();
        let mut variable_ids = HashSet::new();

        let mut rest = text;
        while let Some(start) = rest.find("$(") {
            resolved.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                resolved.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let name = &after[..end];
            variable_ids.insert(name.to_string());
            if let Some(value) = values.get(name) {
                resolved.push_str(value);
            }
            rest = &after[end + 1..];
        }
        resolved.push_str(rest);

        ParsedVariables {
            text: resolved,
            variable_ids,
        }
    }
}

/// [`LocationLookup`] over a static map.
pub struct StaticLocations {
    locations: parking_lot::Mutex<HashMap<String, ControlLocation>>,
}

impl StaticLocations {
    /// Creates an empty lookup.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            locations: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Places a control at a location.
    pub fn insert(&self, control_id: &str, location: ControlLocation) {
        self.locations
            .lock()
            .insert(control_id.to_string(), location);
    }
}

impl LocationLookup for StaticLocations {
    fn location_of_control(&self, control_id: &str) -> Option<ControlLocation> {
        self.locations.lock().get(control_id).copied()
    }
}

/// [`EntityDefinitions`] keyed by definition id.
pub struct StaticDefinitions {
    definitions: parking_lot::Mutex<HashMap<String, Arc<EntityDefinition>>>,
}

impl StaticDefinitions {
    /// Creates an empty lookup.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            definitions: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Registers a definition.
    pub fn insert(&self, definition_id: &str, definition: EntityDefinition) {
        self.definitions
            .lock()
            .insert(definition_id.to_string(), Arc::new(definition));
    }
}

impl EntityDefinitions for StaticDefinitions {
    fn get_definition(
        &self,
        _kind: EntityKind,
        _connection_id: &str,
        definition_id: &str,
    ) -> Option<Arc<EntityDefinition>> {
        self.definitions.lock().get(definition_id).cloned()
    }
}

/// [`ModuleResolver`] with a fixed interpreter and a scriptable dev version.
///
/// Supports the `node22` runtime kind out of the box.
pub struct StaticResolver {
    interpreter: PathBuf,
    supported_kinds: parking_lot::Mutex<HashSet<String>>,
    dev_api_version: parking_lot::Mutex<Option<semver::Version>>,
}

impl StaticResolver {
    /// Creates a resolver handing out `interpreter` for supported kinds.
    pub fn new(interpreter: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            interpreter: interpreter.into(),
            supported_kinds: parking_lot::Mutex::new(HashSet::from(["node22".to_string()])),
            dev_api_version: parking_lot::Mutex::new(None),
        })
    }

    /// Marks an additional runtime kind as supported.
    pub fn allow_kind(&self, kind: &str) {
        self.supported_kinds.lock().insert(kind.to_string());
    }

    /// Scripts the version returned for unpackaged modules.
    pub fn set_dev_api_version(&self, version: &str) {
        *self.dev_api_version.lock() = Some(version.parse().expect("valid test version"));
    }
}

#[async_trait]
impl ModuleResolver for StaticResolver {
    fn interpreter_for(&self, runtime_kind: &str) -> Option<PathBuf> {
        self.supported_kinds
            .lock()
            .contains(runtime_kind)
            .then(|| self.interpreter.clone())
    }

    async fn dev_api_version(&self, _base_path: &Path) -> Result<semver::Version, SpawnError> {
        self.dev_api_version
            .lock()
            .clone()
            .ok_or_else(|| SpawnError::ApiVersionResolve {
                message: "no dev api version scripted".to_string(),
            })
    }
}

/// A fresh bundle of collaborator fakes.
pub struct TestDeps {
    /// The bundle to hand to the host.
    pub deps: HostDeps,
    /// Status sink.
    pub status: Arc<CountingStatus>,
    /// Availability sink.
    pub recorder: Arc<RecordingRecorder>,
    /// Control lookup.
    pub controls: Arc<StaticControls>,
    /// Variable resolver.
    pub variables: Arc<FakeVariables>,
    /// Location lookup.
    pub locations: Arc<StaticLocations>,
    /// Definition lookup.
    pub definitions: Arc<StaticDefinitions>,
    /// Runtime resolver.
    pub resolver: Arc<StaticResolver>,
}

/// Creates a fresh set of collaborator fakes.
pub fn test_deps() -> TestDeps {
    let status = CountingStatus::new();
    let recorder = RecordingRecorder::new();
    let controls = StaticControls::new();
    let variables = FakeVariables::new();
    let locations = StaticLocations::new();
    let definitions = StaticDefinitions::new();
    let resolver = StaticResolver::new("/usr/bin/node");

    TestDeps {
        deps: HostDeps {
            status: Arc::clone(&status) as Arc<dyn StatusReporter>,
            recorder: Arc::clone(&recorder) as Arc<dyn ActionRecorder>,
            controls: Arc::clone(&controls) as Arc<dyn ControlLookup>,
            variables: Arc::clone(&variables) as Arc<dyn VariableResolver>,
            locations: Arc::clone(&locations) as Arc<dyn LocationLookup>,
            definitions: Arc::clone(&definitions) as Arc<dyn EntityDefinitions>,
            resolver: Arc::clone(&resolver) as Arc<dyn ModuleResolver>,
        },
        status,
        recorder,
        controls,
        variables,
        locations,
        definitions,
        resolver,
    }
}
