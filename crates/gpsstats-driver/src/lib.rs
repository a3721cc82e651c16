//! # gpsstats Driver
//!
//! Connection supervision and telemetry differencing for the gpsd to MQTT
//! bridge. Everything here is single-threaded and I/O-agnostic: sockets live
//! behind [`gpsstats_link::Link`], polling and timers behind [`EventHost`].
//!
//! ```text
//! EventHost ──Event──► Orchestrator ──► Supervisor<GpsdLink> ──readings──► Differ
//!                           │                                                │
//!                           │                                   Publish(snapshot)
//!                           ▼                                                ▼
//!                      StatsRegistry ◄── Supervisor<MqttLink> ◄── payload::encode
//! ```

pub mod backoff;
mod error;
pub mod host;
pub mod orchestrator;
pub mod payload;
pub mod stats;
pub mod supervisor;
pub mod telemetry;

pub use backoff::Backoff;
pub use error::{OrchestratorError, SupervisorError};
pub use host::{ConnId, Event, EventHost, HandlerId, HostError, Interest, SignalKind, Task, TaskId};
pub use orchestrator::{Control, LinkProvider, Links, Orchestrator, PublishOptions, TOPIC};
pub use payload::PayloadError;
pub use stats::{LinkEvent, LinkMetrics, StatsRegistry, StatsSnapshot};
pub use supervisor::{ConnState, Supervisor};
pub use telemetry::{ChangeResult, ConstellationCounts, Differ, Snapshot};
