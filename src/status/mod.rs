//! Connection status aggregation.
//!
//! [`StatusAggregator`] is a ready-made [`StatusReporter`] sink: it keeps
//! the latest per-connection entry, maintains aggregate counters, notifies
//! observers registered at construction, and produces the variable
//! definition list describing the fleet.

mod aggregator;

pub use aggregator::{
    ConnectionStatusEntry, StatusAggregator, StatusCounts, StatusObserver, VariableDefinition,
};
