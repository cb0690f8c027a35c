//! # Status aggregator.
//!
//! Collects the coarse per-connection statuses the supervisor reports and
//! derives the fleet-level view: aggregate counters and a variable
//! definition list (one aggregate variable per counter plus one status
//! variable per connection).
//!
//! Observers are registered at construction and called synchronously on
//! every change; teardown is scoped ownership (drop the aggregator, the
//! callbacks are gone) — no implicit listener registry to leak.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::deps::StatusReporter;
use crate::model::StatusCategory;

/// Latest reported status of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatusEntry {
    /// Coarse category, `None` when cleared.
    pub category: Option<StatusCategory>,
    /// Optional human-readable message.
    pub message: Option<String>,
}

/// Aggregate counters over all tracked connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Connections with any recorded entry.
    pub total: usize,
    /// Currently initializing.
    pub initializing: usize,
    /// Crashed and awaiting restart.
    pub crashed: usize,
    /// Stopped cleanly.
    pub stopped: usize,
    /// Disabled (no desired config).
    pub disabled: usize,
}

/// One variable this aggregator can describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDefinition {
    /// Stable variable name.
    pub name: String,
    /// Human-readable label.
    pub label: String,
}

/// Callback invoked with each changed connection entry.
pub type StatusObserver = Box<dyn Fn(&str, &ConnectionStatusEntry) + Send + Sync>;

/// [`StatusReporter`] sink with counters, observers, and variable
/// definitions.
pub struct StatusAggregator {
    entries: parking_lot::Mutex<BTreeMap<String, ConnectionStatusEntry>>,
    observers: Vec<StatusObserver>,
}

impl StatusAggregator {
    /// Creates an aggregator with the given observers.
    ///
    /// Observers run synchronously inside status updates; keep them cheap.
    pub fn new(observers: Vec<StatusObserver>) -> Arc<Self> {
        Arc::new(Self {
            entries: parking_lot::Mutex::new(BTreeMap::new()),
            observers,
        })
    }

    /// Returns the latest entry for one connection.
    pub fn entry(&self, connection_id: &str) -> Option<ConnectionStatusEntry> {
        self.entries.lock().get(connection_id).cloned()
    }

    /// Returns the current aggregate counters.
    pub fn counts(&self) -> StatusCounts {
        let entries = self.entries.lock();
        let mut counts = StatusCounts {
            total: entries.len(),
            ..StatusCounts::default()
        };
        for entry in entries.values() {
            match entry.category {
                Some(StatusCategory::Initializing) => counts.initializing += 1,
                Some(StatusCategory::Crashed) => counts.crashed += 1,
                Some(StatusCategory::Stopped) => counts.stopped += 1,
                Some(StatusCategory::Disabled) => counts.disabled += 1,
                None => {}
            }
        }
        counts
    }

    /// Describes the aggregate counter variables plus one status variable
    /// per tracked connection.
    pub fn variable_definitions(&self) -> Vec<VariableDefinition> {
        let mut variables = vec![
            VariableDefinition {
                name: "connection_total".into(),
                label: "Connections: count total".into(),
            },
            VariableDefinition {
                name: "connection_initializing".into(),
                label: "Connections: count initializing".into(),
            },
            VariableDefinition {
                name: "connection_crashed".into(),
                label: "Connections: count crashed".into(),
            },
            VariableDefinition {
                name: "connection_stopped".into(),
                label: "Connections: count stopped".into(),
            },
            VariableDefinition {
                name: "connection_disabled".into(),
                label: "Connections: count disabled".into(),
            },
        ];

        let entries = self.entries.lock();
        for connection_id in entries.keys() {
            variables.push(VariableDefinition {
                name: format!("connection_{connection_id}_status"),
                label: format!("Connection status: {connection_id}"),
            });
        }
        variables
    }
}

impl StatusReporter for StatusAggregator {
    fn update_connection_status(
        &self,
        connection_id: &str,
        status: Option<StatusCategory>,
        message: Option<&str>,
    ) {
        let entry = ConnectionStatusEntry {
            category: status,
            message: message.map(str::to_string),
        };

        let changed = {
            let mut entries = self.entries.lock();
            match entries.get(connection_id) {
                Some(existing) if *existing == entry => false,
                _ => {
                    entries.insert(connection_id.to_string(), entry.clone());
                    true
                }
            }
        };

        if changed {
            for observer in &self.observers {
                observer(connection_id, &entry);
            }
        }
    }
}
