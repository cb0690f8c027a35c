//! Entity reconciliation engine.
//!
//! One [`EntityManager`] per running worker keeps the worker's in-memory set
//! of action/feedback entities synchronized with the canonical model, runs
//! the batched upgrade protocol for stale definitions, and re-sends entities
//! whose resolved options depend on changed variables.

mod manager;

pub use manager::{EntityManager, ParsedOptions};
