//! # modvisor
//!
//! **Modvisor** supervises a fleet of long-lived worker subprocesses
//! ("connections"), each hosting a pluggable module implementation behind a
//! message channel, and keeps every worker's in-memory set of action and
//! feedback entities synchronized with the canonical model.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  queue_update_connection / queue_stop_all_connections
//!                      │
//!                      ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  ModuleHost (worker supervisor)                               │
//! │  - worker record per connection (explicit state machine)      │
//! │  - debounced connection check (batching window 10ms/50ms)     │
//! │  - stop/start sequences, registration handshake, backoff     │
//! │  - DebugLogBus (per-connection diagnostic lines)              │
//! └──────┬──────────────────┬──────────────────┬──────────────────┘
//!        ▼                  ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ worker proc  │   │ worker proc  │   │ worker proc  │   (ProcessSpawner)
//! │  + channel   │   │  + channel   │   │  + channel   │   (MessageChannel)
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        ▼                  ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ ModuleClient │   │ ModuleClient │   │ ModuleClient │   (one per worker)
//! │ EntityManager│   │ EntityManager│   │ EntityManager│
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ### Worker lifecycle
//! ```text
//! queue_update_connection(id, config, module_info)
//!   └─► record INVALIDATED ─► debounced check ─► IN_PROGRESS
//!         ├─ target empty ─► stop ─► record deleted
//!         └─ target set   ─► stop ─► validate ─► spawn ─► register ─► init
//!                                                   │          │
//!                                 bad token / bad api ─► force restart
//!                                                              │
//!                                    init ok ─► RUNNING (isReady)
//!                                    init err ─► force restart (backoff)
//! ```
//!
//! Entity synchronization is driven per worker by an [`EntityManager`]: a
//! debounced reconciliation pass batches `updateActions`/`updateFeedbacks`
//! payloads and the `upgradeActionsAndFeedbacks` round trip for stale
//! definitions, correlated by per-wrapper tokens so replaced or deleted
//! entities silently discard in-flight responses.
//!
//! ## Features
//! | Area             | Description                                            | Key types / traits                        |
//! |------------------|--------------------------------------------------------|-------------------------------------------|
//! | **Supervision**  | Worker records, handshake, backoff, status reporting.  | [`ModuleHost`], [`BackoffPolicy`]         |
//! | **Entities**     | Batched sync + upgrade protocol per worker.            | [`EntityManager`], [`ModuleClient`]       |
//! | **Seams**        | Everything external is a trait object.                 | [`HostDeps`], [`MessageChannel`], [`ProcessSpawner`] |
//! | **Diagnostics**  | Per-connection categorized debug-log stream.           | [`DebugLogBus`], [`DebugLogEvent`]        |
//! | **Status**       | Aggregate counters + variable definitions.             | [`StatusAggregator`]                      |
//! | **Testing**      | In-memory fakes for all of the above.                  | [`testing`]                               |

mod config;
mod debounce;
mod error;
mod policies;

pub mod channel;
pub mod deps;
pub mod entities;
pub mod events;
pub mod host;
pub mod model;
pub mod process;
pub mod status;
pub mod testing;

// ---- Public re-exports ----

pub use config::HostConfig;
pub use debounce::Debouncer;
pub use entities::{EntityManager, ParsedOptions};
pub use error::{ChannelError, SpawnError};
pub use events::{DebugLogBus, DebugLogEvent, DebugLogLevel};
pub use host::{ModuleClient, ModuleHost};
pub use policies::BackoffPolicy;
pub use status::StatusAggregator;

pub use channel::MessageChannel;
pub use deps::HostDeps;
pub use process::{ProcessHandle, ProcessSpawner};
