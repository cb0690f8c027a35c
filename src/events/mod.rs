//! Debug-log events emitted per connection.
//!
//! The host publishes categorized diagnostic lines for each connection
//! (process lifecycle markers, forwarded stdout/stderr) to a broadcast
//! [`DebugLogBus`]. Delivery is opt-in: consumers subscribe explicitly, and
//! high-volume console output is only forwarded while someone is listening.

mod bus;
mod event;

pub use bus::DebugLogBus;
pub use event::{DebugLogEvent, DebugLogLevel};
