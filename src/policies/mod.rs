//! Restart policies for supervised worker processes.
//!
//! - [`BackoffPolicy`]: how long to wait before the next start attempt after
//!   repeated failures.

mod backoff;

pub use backoff::BackoffPolicy;
